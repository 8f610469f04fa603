//! Flashable archive assembly.
//!
//! Stages the packaging template (local copy or fresh clone), drops the
//! build outputs and loadable modules into it, rewrites the depmod
//! metadata for the on-device install layout, and compresses the result
//! into the output archive.
//!
//! There is no rollback: a failure partway leaves the workspace
//! partially modified, and the next run starts by clearing it.

use anyhow::{bail, Context, Result};
use fs2::FileExt;
use sha2::{Digest, Sha256};
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::build::{self, ArtifactPaths};
use crate::config::BuildConfig;
use crate::process::Cmd;

/// Overlay packer shipped inside the kernel tree.
const MKDTBOIMG: &str = "scripts/dtc/libfdt/mkdtboimg.py";

const DTBO_PAGE_SIZE: &str = "4096";

/// depmod indexes copied alongside the modules.
const MODULE_METADATA_FILES: &[&str] = &["modules.dep", "modules.alias", "modules.softdep"];

/// Housekeeping files kept out of the archive.
const ARCHIVE_EXCLUDES: &[&str] = &["*.git*", "README.md", "*placeholder"];

/// Assemble and compress the flashable archive.
///
/// Returns the path of the written archive. The packaging workspace is
/// exclusively locked for the duration; a second concurrent build on the
/// same tree is refused instead of corrupting the staging directory.
pub fn package(cfg: &BuildConfig, archive_name: &str, artifacts: &ArtifactPaths) -> Result<PathBuf> {
    let _lock = WorkspaceLock::acquire(cfg.archive_dir())?;

    let template = stage_template(cfg)?;

    copy_artifacts(artifacts, &template)?;
    pack_dtbo(cfg, &template)?;
    let module_count = copy_modules(cfg, &template)?;
    println!("  Staged {} kernel modules", module_count);

    clean_intermediates(cfg);

    let archive = compress_template(cfg, &template, archive_name)?;
    write_checksum(&archive)?;

    fs::remove_dir_all(&template)
        .with_context(|| format!("Failed to remove {}", template.display()))?;

    Ok(archive)
}

/// Obtain the packaging template.
///
/// Preference order: the `TEMPLATE_DIR` override, a previously fetched
/// copy in the user cache, then a shallow clone of the template
/// repository. No source available is fatal.
fn stage_template(cfg: &BuildConfig) -> Result<PathBuf> {
    let dest = cfg.template_workdir();
    if dest.exists() {
        fs::remove_dir_all(&dest)
            .with_context(|| format!("Failed to clear stale template at {}", dest.display()))?;
    }

    if let Some(local) = &cfg.env.template_dir {
        if !local.is_dir() {
            bail!(
                "Packaging template not found at {} (TEMPLATE_DIR)",
                local.display()
            );
        }
        println!("  Copying packaging template from {}...", local.display());
        copy_dir_recursive(local, &dest)?;
        return Ok(dest);
    }

    if let Some(cached) = dirs::cache_dir().map(|c| c.join("kernel-builder/template")) {
        if cached.is_dir() {
            println!("  Copying packaging template from {}...", cached.display());
            copy_dir_recursive(&cached, &dest)?;
            return Ok(dest);
        }
    }

    println!(
        "  Cloning packaging template from {}...",
        cfg.profile.template_repo
    );
    Cmd::new("git")
        .args(["clone", "--depth=1", "-q"])
        .arg(&cfg.profile.template_repo)
        .arg_path(&dest)
        .error_msg(
            "Could not fetch the packaging template.\n\
             Provide a local copy via TEMPLATE_DIR or check network access.",
        )
        .run()?;

    Ok(dest)
}

/// Copy the kernel image and device-tree blob into the template root.
fn copy_artifacts(artifacts: &ArtifactPaths, template: &Path) -> Result<()> {
    let image_name = artifacts
        .image
        .file_name()
        .context("kernel image path has no filename")?;

    println!(
        "  Copying {} and dtb into the template...",
        image_name.to_string_lossy()
    );
    fs::copy(&artifacts.image, template.join(image_name))
        .with_context(|| format!("Failed to copy {}", artifacts.image.display()))?;
    fs::copy(&artifacts.dtb, template.join("dtb"))
        .with_context(|| format!("Failed to copy {}", artifacts.dtb.display()))?;

    Ok(())
}

/// Pack the built .dtbo overlays into a combined dtbo.img.
fn pack_dtbo(cfg: &BuildConfig, template: &Path) -> Result<()> {
    let dtbo_dir = cfg.out_dir.join(&cfg.profile.dtbo_dir);
    let overlays = collect_dtbos(&dtbo_dir)?;
    if overlays.is_empty() {
        bail!("no .dtbo overlays found under {}", dtbo_dir.display());
    }

    println!(
        "  Packing {} device-tree overlays into dtbo.img...",
        overlays.len()
    );
    let mut cmd = Cmd::new("python3")
        .arg_path(cfg.source_dir.join(MKDTBOIMG))
        .arg("create")
        .arg_path(template.join("dtbo.img"))
        .arg(format!("--page_size={}", DTBO_PAGE_SIZE));
    for overlay in &overlays {
        cmd = cmd.arg_path(overlay);
    }
    cmd.error_msg("mkdtboimg failed to pack the overlay image").run()?;

    Ok(())
}

/// Built overlays, in stable name order.
fn collect_dtbos(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut overlays = Vec::new();
    if !dir.exists() {
        return Ok(overlays);
    }

    for entry in
        fs::read_dir(dir).with_context(|| format!("Failed to read {}", dir.display()))?
    {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) == Some("dtbo") {
            overlays.push(path);
        }
    }

    overlays.sort();
    Ok(overlays)
}

/// Copy the installed modules into the template and fix their metadata
/// for the on-device layout.
///
/// Modules land flat (basename only) in the template's module directory,
/// which is why the dependency index is rewritten to match.
fn copy_modules(cfg: &BuildConfig, template: &Path) -> Result<usize> {
    let modules_base = build::module_staging_dir(cfg).join("lib/modules");
    if !modules_base.exists() {
        bail!(
            "No installed modules found at {}.\n\
             The build must run modules_install first.",
            modules_base.display()
        );
    }

    let release_dir = find_release_dir(&modules_base, &cfg.profile.kernel_release_prefix)?;
    println!(
        "  Kernel release: {}",
        release_dir.file_name().unwrap_or_default().to_string_lossy()
    );

    let dst = template.join(&cfg.profile.template_module_dir);
    fs::create_dir_all(&dst)?;
    let count = copy_modules_flat(&release_dir, &dst)?;

    println!("  Copying module metadata...");
    for name in MODULE_METADATA_FILES {
        let src = release_dir.join(name);
        if src.exists() {
            fs::copy(&src, dst.join(name))?;
        }
    }

    let dep_path = dst.join("modules.dep");
    if dep_path.exists() {
        let content = fs::read_to_string(&dep_path)?;
        fs::write(
            &dep_path,
            rewrite_modules_dep(&content, &cfg.profile.module_install_prefix),
        )?;
    }

    // depmod's modules.order becomes the on-device load-order file.
    let order = release_dir.join("modules.order");
    if order.exists() {
        let content = fs::read_to_string(&order)?;
        fs::write(dst.join("modules.load"), rewrite_modules_load(&content))?;
    }

    Ok(count)
}

/// Find the installed release directory matching the profile's prefix.
fn find_release_dir(modules_base: &Path, release_prefix: &str) -> Result<PathBuf> {
    for entry in fs::read_dir(modules_base)? {
        let entry = entry?;
        let name = entry.file_name();
        let name_str = name.to_string_lossy();
        if entry.path().is_dir() && name_str.starts_with(release_prefix) {
            return Ok(entry.path());
        }
    }
    bail!(
        "Could not find a {}* modules directory under {}",
        release_prefix,
        modules_base.display()
    )
}

/// Copy every .ko under `src_root` flat into `dst`.
fn copy_modules_flat(src_root: &Path, dst: &Path) -> Result<usize> {
    let mut count = 0usize;

    for entry in WalkDir::new(src_root)
        .follow_links(false)
        .into_iter()
        .filter_map(Result::ok)
    {
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("ko") {
            continue;
        }
        fs::copy(path, dst.join(entry.file_name()))
            .with_context(|| format!("Failed to copy module {}", path.display()))?;
        count += 1;
    }

    Ok(count)
}

/// One entry of the depmod dependency index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleDep {
    pub module: String,
    pub deps: Vec<String>,
}

impl ModuleDep {
    /// Parse a `module: dep dep...` line; `None` for anything else.
    pub fn parse(line: &str) -> Option<Self> {
        let (module, deps) = line.split_once(':')?;
        Some(Self {
            module: module.trim().to_string(),
            deps: deps.split_whitespace().map(String::from).collect(),
        })
    }

    /// Render the entry with every reference moved to `prefix` + basename.
    pub fn render_installed(&self, prefix: &str) -> String {
        let module = format!("{}{}", prefix, basename(&self.module));
        if self.deps.is_empty() {
            return format!("{}:", module);
        }
        let deps = self
            .deps
            .iter()
            .map(|d| format!("{}{}", prefix, basename(d)))
            .collect::<Vec<_>>()
            .join(" ");
        format!("{}: {}", module, deps)
    }
}

/// Rewrite a modules.dep index for the flat on-device install layout.
///
/// Lines that are not dependency entries pass through unchanged.
pub fn rewrite_modules_dep(content: &str, prefix: &str) -> String {
    let mut out = String::with_capacity(content.len());
    for line in content.lines() {
        match ModuleDep::parse(line) {
            Some(dep) => out.push_str(&dep.render_installed(prefix)),
            None => out.push_str(line),
        }
        out.push('\n');
    }
    out
}

/// Reduce every line of a load-order file to its final path component.
pub fn rewrite_modules_load(content: &str) -> String {
    let mut out = String::with_capacity(content.len());
    for line in content.lines() {
        out.push_str(basename(line.trim()));
        out.push('\n');
    }
    out
}

fn basename(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// Delete the bulky intermediate build trees before compression.
fn clean_intermediates(cfg: &BuildConfig) {
    let staging = build::module_staging_dir(cfg);
    if staging.exists() {
        println!("  Removing {}...", staging.display());
        if let Err(e) = fs::remove_dir_all(&staging) {
            eprintln!("  [WARN] could not remove {}: {}", staging.display(), e);
        }
    }
}

/// Compress the template tree into the named archive.
fn compress_template(cfg: &BuildConfig, template: &Path, archive_name: &str) -> Result<PathBuf> {
    let dest_dir = cfg
        .archive_dir()
        .canonicalize()
        .with_context(|| format!("Failed to resolve {}", cfg.archive_dir().display()))?;
    let dest = dest_dir.join(archive_name);
    if dest.exists() {
        fs::remove_file(&dest)
            .with_context(|| format!("Failed to remove stale {}", dest.display()))?;
    }

    println!("  Compressing template into {}...", archive_name);
    Cmd::new("zip")
        .args(["-r9", "-q"])
        .arg_path(&dest)
        .arg(".")
        .arg("-x")
        .args(ARCHIVE_EXCLUDES)
        .current_dir(template)
        .error_msg("zip failed. Install: sudo apt-get install zip")
        .run()?;

    Ok(dest)
}

/// Write `<archive>.sha256` in the `sha256sum -c` format.
fn write_checksum(archive: &Path) -> Result<PathBuf> {
    let hash = sha256_file(archive)?;
    let filename = archive
        .file_name()
        .context("archive path has no filename")?
        .to_string_lossy();

    let checksum_path = archive.with_file_name(format!("{}.sha256", filename));
    fs::write(&checksum_path, format!("{}  {}\n", hash, filename))?;
    println!("  SHA256: {}...{}", &hash[..8], &hash[hash.len() - 8..]);

    Ok(checksum_path)
}

fn sha256_file(path: &Path) -> Result<String> {
    let f = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    let mut reader = BufReader::new(f);
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 1024 * 1024];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

/// Recursively copy a directory, preserving symlinks.
fn copy_dir_recursive(src: &Path, dst: &Path) -> Result<()> {
    if !dst.exists() {
        fs::create_dir_all(dst)
            .with_context(|| format!("Failed to create directory: {}", dst.display()))?;
    }

    for entry in
        fs::read_dir(src).with_context(|| format!("Failed to read directory: {}", src.display()))?
    {
        let entry = entry?;
        let src_path = entry.path();
        let dst_path = dst.join(entry.file_name());

        let file_type = entry.file_type()?;
        if file_type.is_symlink() {
            let target = fs::read_link(&src_path)?;
            if dst_path.exists() || dst_path.is_symlink() {
                fs::remove_file(&dst_path)?;
            }
            std::os::unix::fs::symlink(&target, &dst_path)
                .with_context(|| format!("Failed to create symlink: {}", dst_path.display()))?;
        } else if file_type.is_dir() {
            copy_dir_recursive(&src_path, &dst_path)?;
        } else {
            fs::copy(&src_path, &dst_path)
                .with_context(|| format!("Failed to copy file: {}", src_path.display()))?;
        }
    }

    Ok(())
}

/// RAII guard for the packaging workspace; the lock file is removed on drop.
struct WorkspaceLock {
    _file: File,
    path: PathBuf,
}

impl WorkspaceLock {
    fn acquire(dir: &Path) -> Result<Self> {
        let path = dir.join(".kernel-builder.lock");
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .with_context(|| format!("Failed to create lock file {}", path.display()))?;

        if file.try_lock_exclusive().is_err() {
            bail!(
                "another build owns {}; refusing to package concurrently",
                dir.display()
            );
        }

        Ok(Self { _file: file, path })
    }
}

impl Drop for WorkspaceLock {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DeviceProfile, EnvSettings};
    use tempfile::TempDir;

    const PREFIX: &str = "/vendor/lib/modules/";

    #[test]
    fn test_rewrite_modules_dep_moves_every_reference() {
        let input = "kernel/drivers/net/wlan.ko: kernel/net/core.ko kernel/lib/crc.ko\n";
        let expected = "/vendor/lib/modules/wlan.ko: /vendor/lib/modules/core.ko /vendor/lib/modules/crc.ko\n";
        assert_eq!(rewrite_modules_dep(input, PREFIX), expected);
    }

    #[test]
    fn test_rewrite_modules_dep_no_deps_entry() {
        assert_eq!(
            rewrite_modules_dep("kernel/drivers/leds.ko:\n", PREFIX),
            "/vendor/lib/modules/leds.ko:\n"
        );
    }

    #[test]
    fn test_rewrite_modules_dep_passes_other_lines_through() {
        let input = "# generated by depmod\n\nkernel/a.ko: kernel/b.ko\n";
        let output = rewrite_modules_dep(input, PREFIX);
        assert!(output.starts_with("# generated by depmod\n\n"));
        assert!(output.ends_with("/vendor/lib/modules/a.ko: /vendor/lib/modules/b.ko\n"));
    }

    #[test]
    fn test_module_dep_parse_and_render() {
        let dep = ModuleDep::parse("kernel/fs/exfat.ko: kernel/lib/nls.ko").unwrap();
        assert_eq!(dep.module, "kernel/fs/exfat.ko");
        assert_eq!(dep.deps, vec!["kernel/lib/nls.ko".to_string()]);
        assert_eq!(
            dep.render_installed(PREFIX),
            "/vendor/lib/modules/exfat.ko: /vendor/lib/modules/nls.ko"
        );

        assert!(ModuleDep::parse("not a dependency line").is_none());
    }

    #[test]
    fn test_rewrite_modules_load_strips_directories() {
        let input = "kernel/drivers/net/wlan.ko\nexfat.ko\n";
        assert_eq!(rewrite_modules_load(input), "wlan.ko\nexfat.ko\n");
    }

    #[test]
    fn test_rewrite_modules_load_is_idempotent() {
        let input = "kernel/drivers/net/wlan.ko\nkernel/fs/exfat.ko\n";
        let once = rewrite_modules_load(input);
        assert_eq!(rewrite_modules_load(&once), once);
    }

    #[test]
    fn test_copy_modules_flat_flattens_nested_tree() {
        let temp = TempDir::new().unwrap();
        let src = temp.path().join("release");
        let dst = temp.path().join("flat");
        fs::create_dir_all(src.join("kernel/drivers/net")).unwrap();
        fs::create_dir_all(&dst).unwrap();
        fs::write(src.join("kernel/drivers/net/wlan.ko"), b"ko").unwrap();
        fs::write(src.join("kernel/exfat.ko"), b"ko").unwrap();
        fs::write(src.join("modules.dep"), b"meta").unwrap();

        let count = copy_modules_flat(&src, &dst).unwrap();
        assert_eq!(count, 2);
        assert!(dst.join("wlan.ko").exists());
        assert!(dst.join("exfat.ko").exists());
        assert!(!dst.join("modules.dep").exists());
    }

    #[test]
    fn test_find_release_dir_matches_prefix() {
        let temp = TempDir::new().unwrap();
        fs::create_dir_all(temp.path().join("4.14.302-Stratos")).unwrap();
        fs::write(temp.path().join("notes"), b"x").unwrap();

        let found = find_release_dir(temp.path(), "4.14").unwrap();
        assert!(found.ends_with("4.14.302-Stratos"));

        assert!(find_release_dir(temp.path(), "5.4").is_err());
    }

    #[test]
    fn test_collect_dtbos_sorted_and_filtered() {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join("b-overlay.dtbo"), b"d").unwrap();
        fs::write(temp.path().join("a-overlay.dtbo"), b"d").unwrap();
        fs::write(temp.path().join("trinket.dtb"), b"d").unwrap();

        let overlays = collect_dtbos(temp.path()).unwrap();
        let names: Vec<_> = overlays
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["a-overlay.dtbo", "b-overlay.dtbo"]);
    }

    #[test]
    fn test_sha256_and_checksum_format() {
        let temp = TempDir::new().unwrap();
        let archive = temp.path().join("build.zip");
        fs::write(&archive, b"hello").unwrap();

        assert_eq!(
            sha256_file(&archive).unwrap(),
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );

        let checksum = write_checksum(&archive).unwrap();
        let content = fs::read_to_string(&checksum).unwrap();
        assert!(content.ends_with("  build.zip\n"));
    }

    #[test]
    fn test_workspace_lock_is_exclusive() {
        let temp = TempDir::new().unwrap();

        let first = WorkspaceLock::acquire(temp.path()).unwrap();
        assert!(WorkspaceLock::acquire(temp.path()).is_err());

        drop(first);
        assert!(WorkspaceLock::acquire(temp.path()).is_ok());
    }

    fn config_in(dir: &Path) -> BuildConfig {
        BuildConfig {
            profile: DeviceProfile::default(),
            env: EnvSettings::default(),
            source_dir: dir.to_path_buf(),
            out_dir: dir.join("out"),
        }
    }

    #[test]
    fn test_stage_template_from_local_copy() {
        let temp = TempDir::new().unwrap();
        let local = temp.path().join("prefetched");
        fs::create_dir_all(local.join("META-INF")).unwrap();
        fs::write(local.join("anykernel.sh"), b"#!/sbin/sh\n").unwrap();

        let mut cfg = config_in(temp.path());
        cfg.env.template_dir = Some(local);

        let staged = stage_template(&cfg).unwrap();
        assert_eq!(staged, cfg.template_workdir());
        assert!(staged.join("anykernel.sh").exists());
        assert!(staged.join("META-INF").is_dir());
    }

    #[test]
    fn test_stage_template_missing_local_copy_is_fatal() {
        let temp = TempDir::new().unwrap();
        let mut cfg = config_in(temp.path());
        cfg.env.template_dir = Some(temp.path().join("does-not-exist"));

        let err = stage_template(&cfg).unwrap_err();
        assert!(err.to_string().contains("TEMPLATE_DIR"));
    }

    #[test]
    fn test_copy_modules_rewrites_metadata() {
        let temp = TempDir::new().unwrap();
        let cfg = config_in(temp.path());

        let release = build::module_staging_dir(&cfg).join("lib/modules/4.14.302-Stratos");
        fs::create_dir_all(release.join("kernel/drivers/net")).unwrap();
        fs::write(release.join("kernel/drivers/net/wlan.ko"), b"ko").unwrap();
        fs::write(
            release.join("modules.dep"),
            "kernel/drivers/net/wlan.ko:\n",
        )
        .unwrap();
        fs::write(
            release.join("modules.order"),
            "kernel/drivers/net/wlan.ko\n",
        )
        .unwrap();

        let template = temp.path().join("template");
        fs::create_dir_all(&template).unwrap();

        let count = copy_modules(&cfg, &template).unwrap();
        assert_eq!(count, 1);

        let module_dir = template.join(&cfg.profile.template_module_dir);
        assert!(module_dir.join("wlan.ko").exists());
        assert_eq!(
            fs::read_to_string(module_dir.join("modules.dep")).unwrap(),
            "/vendor/lib/modules/wlan.ko:\n"
        );
        assert_eq!(
            fs::read_to_string(module_dir.join("modules.load")).unwrap(),
            "wlan.ko\n"
        );
    }
}
