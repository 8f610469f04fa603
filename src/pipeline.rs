//! The end-to-end build pipeline.
//!
//! Preparation → announce/status → configure → compile → verify →
//! package → upload. Strictly sequential; every stage blocks until its
//! external commands finish. A compile or verification failure posts the
//! failure notification and aborts with a non-zero exit; notifier
//! failures themselves are never fatal.

use anyhow::{bail, Result};
use std::time::{Duration, Instant};
use time::macros::format_description;
use time::OffsetDateTime;

use crate::build::{self, ArtifactPaths};
use crate::config::BuildConfig;
use crate::identity::{BuildIdentity, ToolchainDescriptor};
use crate::notify::{Notifier, StatusReport};
use crate::process::Cmd;
use crate::{package, preflight};

/// Run the whole pipeline for one build.
pub fn run(cfg: &BuildConfig) -> Result<()> {
    let started = Instant::now();

    println!("[prep] checking host environment...");
    preflight::install_host_packages();
    preflight::check_required_tools(preflight::REQUIRED_TOOLS)?;

    let identity = BuildIdentity::resolve(cfg)?;
    let toolchain = ToolchainDescriptor::probe()?;
    let archive_name = identity.archive_name(cfg.env.archive_override.as_deref());
    println!(
        "[prep] {} on {} ({} @ {})",
        identity.version_string(),
        cfg.profile.device,
        identity.branch,
        identity.commit
    );

    let notifier = Notifier::from_env(&cfg.env);
    if let Some(n) = &notifier {
        n.announce(&cfg.profile);
        n.report_status(&StatusReport {
            host: host_name(),
            build_date: build_date()?,
            device: format!("{} ({})", cfg.profile.device, cfg.profile.codename),
            kernel_version: identity.version_string(),
            build_type: cfg.profile.build_type.clone(),
            compiler: toolchain.compiler.clone(),
            linker: toolchain.linker.clone(),
            archive_name: archive_name.clone(),
            branch: identity.branch.clone(),
            commit_subject: identity.commit_subject.clone(),
            commit_url: identity.commit_url(cfg.env.repo_url.as_deref()),
        });
    }

    println!("[build] invoking the kernel build system...");
    let build_result = build::configure(cfg)
        .and_then(|_| build::compile(cfg))
        .and_then(|_| build::install_modules(cfg));
    if let Err(err) = build_result {
        if let Some(n) = &notifier {
            n.report_failure();
        }
        return Err(err);
    }

    let artifacts = ArtifactPaths::new(cfg);
    if !build::verify_outputs(&artifacts) {
        if let Some(n) = &notifier {
            n.report_failure();
        }
        bail!(
            "build output verification failed\n  image:       {} (present: {})\n  staged dtb:  {} (present: {})\n  staged dtbo: {} (present: {})",
            artifacts.image.display(),
            artifacts.image.exists(),
            artifacts.staged_dtb.display(),
            artifacts.staged_dtb.exists(),
            artifacts.staged_dtbo.display(),
            artifacts.staged_dtbo.exists(),
        );
    }

    println!("[package] assembling the flashable archive...");
    let archive = package::package(cfg, &archive_name, &artifacts)?;
    println!("[package] wrote {}", archive.display());

    let elapsed = format_elapsed(started.elapsed());
    if let Some(n) = &notifier {
        let caption = format!("Time taken: {} | {}", elapsed, toolchain.compiler);
        n.upload_artifact(cfg.archive_dir(), &caption);
    }

    println!("Done in {}.", elapsed);
    Ok(())
}

/// Host identity shown in the status card.
fn host_name() -> String {
    Cmd::new("uname")
        .arg("-n")
        .allow_fail()
        .run()
        .ok()
        .map(|r| r.stdout.trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "unknown".to_string())
}

fn build_date() -> Result<String> {
    let fmt = format_description!(
        "[weekday repr:short] [day] [month repr:short] [year] [hour]:[minute] UTC"
    );
    Ok(OffsetDateTime::now_utc().format(&fmt)?)
}

fn format_elapsed(elapsed: Duration) -> String {
    let secs = elapsed.as_secs();
    format!("{}m{:02}s", secs / 60, secs % 60)
}
