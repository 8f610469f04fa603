//! Host environment preparation.
//!
//! Validates that the host has the tools the pipeline shells out to, and
//! best-effort installs the build dependencies. The checks exist to make a
//! broken host fail legibly up front instead of twenty minutes into the
//! compile.

use anyhow::{bail, Result};

use crate::process::Cmd;

/// Check if a command is resolvable on PATH.
pub fn command_exists(cmd: &str) -> bool {
    which::which(cmd).is_ok()
}

/// Tools the pipeline invokes directly.
///
/// Each tuple is (command_name, package_name).
pub const REQUIRED_TOOLS: &[(&str, &str)] = &[
    ("git", "git"),
    ("make", "make"),
    ("clang", "clang"),
    ("ld.lld", "lld"),
    ("python3", "python3"),
    ("zip", "zip"),
];

/// Packages installed best-effort before the build.
pub const HOST_PACKAGES: &[&str] = &[
    "bc",
    "bison",
    "ca-certificates",
    "flex",
    "libssl-dev",
    "zip",
];

/// Check that specific tools are available.
///
/// # Arguments
///
/// * `tools` - Slice of (command, package) tuples
///
/// # Returns
///
/// * `Ok(())` if all tools are found
/// * `Err` with the list of missing tools and their packages
pub fn check_required_tools(tools: &[(&str, &str)]) -> Result<()> {
    let mut missing = Vec::new();

    for (tool, package) in tools {
        if !command_exists(tool) {
            missing.push((*tool, *package));
        }
    }

    if !missing.is_empty() {
        let msg = missing
            .iter()
            .map(|(t, p)| format!("  {} (install: {})", t, p))
            .collect::<Vec<_>>()
            .join("\n");
        bail!("Missing required host tools:\n{}", msg);
    }

    Ok(())
}

/// Install the host build dependencies, best effort.
///
/// Not idempotent-checked and never fatal: a host without apt or without
/// the packages still gets a clear failure later from the tool checks or
/// the build itself.
pub fn install_host_packages() {
    if !command_exists("apt-get") {
        eprintln!("  [WARN] apt-get not available; skipping host dependency install");
        return;
    }

    println!("  Installing host packages (best effort)...");
    let result = Cmd::new("apt-get")
        .args(["install", "-y", "--no-install-recommends"])
        .args(HOST_PACKAGES)
        .allow_fail()
        .run();

    match result {
        Ok(r) if r.success() => {}
        Ok(_) => eprintln!("  [WARN] host package install returned non-zero; continuing"),
        Err(e) => eprintln!("  [WARN] host package install failed: {e:#}"),
    }
}
