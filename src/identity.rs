//! Build identity and toolchain identity.
//!
//! The identity of one build run is fixed at startup: static profile
//! literals plus the current source-control revision. For an unchanged
//! revision the derived strings are stable across invocations, which is
//! what makes the archive name reproducible.

use anyhow::{Context, Result};
use regex::Regex;
use std::path::Path;

use crate::config::BuildConfig;
use crate::process::Cmd;

/// Length the commit hash is shortened to in names and messages.
const SHORT_HASH_LEN: usize = 8;

/// Composite identity of one build run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildIdentity {
    pub name: String,
    pub version: String,
    pub codename: String,
    pub branch: String,
    pub commit: String,
    pub commit_subject: String,
}

impl BuildIdentity {
    /// Resolve the identity from the profile and the kernel tree.
    ///
    /// The commit hash comes from the `COMMIT_HASH` override when CI
    /// provides one, otherwise from the checked-out revision.
    pub fn resolve(cfg: &BuildConfig) -> Result<Self> {
        let commit = match cfg.env.commit_override.as_deref() {
            Some(hash) => short_hash(hash),
            None => git_output(&cfg.source_dir, &["rev-parse", &format!("--short={}", SHORT_HASH_LEN), "HEAD"])?,
        };
        let branch = git_output(&cfg.source_dir, &["rev-parse", "--abbrev-ref", "HEAD"])?;
        let commit_subject = git_output(&cfg.source_dir, &["log", "-1", "--pretty=%s"])?;

        Ok(Self {
            name: cfg.profile.kernel_name.clone(),
            version: cfg.profile.version.clone(),
            codename: cfg.profile.codename.clone(),
            branch,
            commit,
            commit_subject,
        })
    }

    /// Version string shown in status messages, e.g. `Stratos-v1.4-1a2b3c4d`.
    pub fn version_string(&self) -> String {
        format!("{}-{}-{}", self.name, self.version, self.commit)
    }

    /// Output archive filename; the `ARCHIVE_NAME` override wins.
    pub fn archive_name(&self, archive_override: Option<&str>) -> String {
        match archive_override {
            Some(name) => name.to_string(),
            None => format!(
                "{}-{}-{}-{}.zip",
                self.name, self.codename, self.version, self.commit
            ),
        }
    }

    /// Web link to the last commit, when a repository URL is known.
    pub fn commit_url(&self, repo_url: Option<&str>) -> Option<String> {
        repo_url.map(|url| format!("{}/commit/{}", url.trim_end_matches('/'), self.commit))
    }
}

/// Normalized identity strings for the compiler and linker.
#[derive(Debug, Clone)]
pub struct ToolchainDescriptor {
    pub compiler: String,
    pub linker: String,
}

impl ToolchainDescriptor {
    /// Probe `clang` and `ld.lld` for their version banners.
    ///
    /// Absent binaries are fatal here; nothing downstream can work
    /// without them.
    pub fn probe() -> Result<Self> {
        Ok(Self {
            compiler: version_banner("clang")?,
            linker: version_banner("ld.lld")?,
        })
    }
}

fn version_banner(tool: &str) -> Result<String> {
    let result = Cmd::new(tool)
        .arg("--version")
        .error_msg(format!("{} --version failed; is the toolchain installed?", tool))
        .run()?;
    let first = result.stdout.lines().next().unwrap_or("");
    normalize_banner(first)
}

/// Normalize a toolchain version banner for display.
///
/// Toolchain banners carry a parenthesized source URL and hash, e.g.
/// `AOSP clang version 12.0.5 (https://... c935d99d)`. The URL chunk is
/// noise in a chat message, so it is stripped and the remaining
/// whitespace collapsed.
pub(crate) fn normalize_banner(line: &str) -> Result<String> {
    let url_chunk = Regex::new(r"\((?:https?|git)://[^)]*\)")
        .context("compiling version banner pattern")?;
    let stripped = url_chunk.replace_all(line, "");
    Ok(stripped.split_whitespace().collect::<Vec<_>>().join(" "))
}

fn short_hash(hash: &str) -> String {
    hash.chars().take(SHORT_HASH_LEN).collect()
}

fn git_output(dir: &Path, args: &[&str]) -> Result<String> {
    let result = Cmd::new("git")
        .current_dir(dir)
        .args(args)
        .error_msg(format!("git {} failed", args.join(" ")))
        .run()?;
    Ok(result.stdout.trim().to_string())
}
