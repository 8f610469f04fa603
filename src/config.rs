//! Build configuration.
//!
//! Everything the later stages need is collected here once, at startup:
//!
//! - [`DeviceProfile`] - the compiled-in identity of the one supported
//!   target, overridable from an optional `kernel-builder.toml` in the
//!   kernel tree
//! - [`EnvSettings`] - values the caller provides through the environment
//!   (notifier credentials, repository URL, overrides)
//! - [`BuildConfig`] - the context struct passed by reference into every
//!   stage; there is no process-wide mutable state

use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

/// Optional profile override file, looked up in the kernel source tree.
pub const PROFILE_FILE: &str = "kernel-builder.toml";

/// Static identity of the build target.
///
/// Defaults describe the Stratos kernel for ginkgo (Redmi Note 8 / 8T).
/// Any field can be overridden from [`PROFILE_FILE`]; unknown keys are
/// rejected so typos fail loudly instead of silently using a default.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DeviceProfile {
    /// Kernel brand name, used in messages and the archive filename.
    pub kernel_name: String,
    /// Human-readable device name.
    pub device: String,
    /// Device codename.
    pub codename: String,
    /// Release tag.
    pub version: String,
    /// Build type label reported in status messages.
    pub build_type: String,
    /// Kernel architecture passed to make.
    pub arch: String,
    /// Base defconfig target.
    pub defconfig: String,
    /// Configuration fragments applied after the defconfig, in order.
    pub config_fragments: Vec<String>,
    /// Cross toolchain prefix for the 64-bit target.
    pub cross_triple: String,
    /// Cross toolchain prefix for 32-bit vDSO bits.
    pub cross_triple_32: String,
    /// Kernel image path relative to the make output directory.
    pub image_path: String,
    /// Device-tree blob path relative to the make output directory.
    pub dtb_path: String,
    /// Directory (relative to the output dir) holding built .dtbo overlays.
    pub dtbo_dir: String,
    /// Kernel release prefix used to locate the installed modules directory.
    pub kernel_release_prefix: String,
    /// On-device module path prefix written into modules.dep.
    pub module_install_prefix: String,
    /// Module subdirectory inside the packaging template.
    pub template_module_dir: String,
    /// Packaging template repository, cloned when no local copy is given.
    pub template_repo: String,
}

impl Default for DeviceProfile {
    fn default() -> Self {
        Self {
            kernel_name: "Stratos".into(),
            device: "Redmi Note 8 / 8T".into(),
            codename: "ginkgo".into(),
            version: "v1.4".into(),
            build_type: "Release".into(),
            arch: "arm64".into(),
            defconfig: "vendor/ginkgo-perf_defconfig".into(),
            config_fragments: vec!["vendor/xiaomi/ginkgo.config".into()],
            cross_triple: "aarch64-linux-gnu-".into(),
            cross_triple_32: "arm-linux-gnueabi-".into(),
            image_path: "arch/arm64/boot/Image.gz".into(),
            dtb_path: "arch/arm64/boot/dts/qcom/trinket.dtb".into(),
            dtbo_dir: "arch/arm64/boot/dts/qcom".into(),
            kernel_release_prefix: "4.14".into(),
            module_install_prefix: "/vendor/lib/modules/".into(),
            template_module_dir: "modules/vendor/lib/modules".into(),
            template_repo: "https://github.com/StratosKernel/AnyKernel3".into(),
        }
    }
}

impl DeviceProfile {
    /// Load the profile, applying overrides from `kernel-builder.toml`
    /// when the file exists next to the kernel tree.
    pub fn load(source_dir: &Path) -> Result<Self> {
        let path = source_dir.join(PROFILE_FILE);
        if !path.exists() {
            return Ok(Self::default());
        }

        let text = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let profile = toml::from_str(&text)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        Ok(profile)
    }
}

/// Values the caller provides through the environment.
///
/// All of them are optional: missing notifier credentials disable
/// notifications instead of failing the build, and the overrides fall
/// back to values computed from the source tree.
#[derive(Debug, Clone, Default)]
pub struct EnvSettings {
    /// Bot authentication token (`BOT_TOKEN`).
    pub bot_token: Option<String>,
    /// Public channel for the start-of-build announcement (`CHAT_ID`).
    pub chat_id: Option<String>,
    /// Private channel for status/failure/artifact posts (`PRIVATE_CHAT_ID`).
    pub private_chat_id: Option<String>,
    /// Repository URL used to link the last commit (`REPO_URL`).
    pub repo_url: Option<String>,
    /// Commit hash override from CI (`COMMIT_HASH`), else git decides.
    pub commit_override: Option<String>,
    /// Archive filename override (`ARCHIVE_NAME`), else derived.
    pub archive_override: Option<String>,
    /// Pre-fetched packaging template directory (`TEMPLATE_DIR`).
    pub template_dir: Option<PathBuf>,
}

impl EnvSettings {
    /// Collect settings from the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Collect settings through an arbitrary lookup (tests use this).
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        Self {
            bot_token: get("BOT_TOKEN"),
            chat_id: get("CHAT_ID"),
            private_chat_id: get("PRIVATE_CHAT_ID"),
            repo_url: get("REPO_URL"),
            commit_override: get("COMMIT_HASH"),
            archive_override: get("ARCHIVE_NAME"),
            template_dir: get("TEMPLATE_DIR").map(PathBuf::from),
        }
    }
}

/// Context shared by every pipeline stage.
#[derive(Debug, Clone)]
pub struct BuildConfig {
    pub profile: DeviceProfile,
    pub env: EnvSettings,
    /// Kernel source tree (the working directory).
    pub source_dir: PathBuf,
    /// Make output directory.
    pub out_dir: PathBuf,
}

impl BuildConfig {
    /// Build the configuration for a kernel tree.
    pub fn load(source_dir: PathBuf) -> Result<Self> {
        let profile = DeviceProfile::load(&source_dir)?;
        let out_dir = source_dir.join("out");
        Ok(Self {
            profile,
            env: EnvSettings::from_env(),
            source_dir,
            out_dir,
        })
    }

    /// Directory the finished archive (and its checksum) lands in.
    pub fn archive_dir(&self) -> &Path {
        &self.source_dir
    }

    /// Transient workspace the packaging template is staged into.
    pub fn template_workdir(&self) -> PathBuf {
        self.source_dir.join("flash-template")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_profile_is_consistent() {
        let p = DeviceProfile::default();
        assert_eq!(p.codename, "ginkgo");
        assert!(p.image_path.starts_with("arch/arm64/boot/"));
        assert!(p.module_install_prefix.ends_with('/'));
        assert!(!p.config_fragments.is_empty());
    }

    #[test]
    fn test_profile_partial_override() {
        let temp = TempDir::new().unwrap();
        fs::write(
            temp.path().join(PROFILE_FILE),
            "version = \"v2.0\"\nbuild_type = \"Nightly\"\n",
        )
        .unwrap();

        let p = DeviceProfile::load(temp.path()).unwrap();
        assert_eq!(p.version, "v2.0");
        assert_eq!(p.build_type, "Nightly");
        // Untouched fields keep their defaults
        assert_eq!(p.codename, "ginkgo");
    }

    #[test]
    fn test_profile_rejects_unknown_keys() {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join(PROFILE_FILE), "versoin = \"typo\"\n").unwrap();

        assert!(DeviceProfile::load(temp.path()).is_err());
    }

    #[test]
    fn test_env_settings_ignore_empty_values() {
        let settings = EnvSettings::from_lookup(|key| match key {
            "BOT_TOKEN" => Some("123:abc".to_string()),
            "CHAT_ID" => Some("   ".to_string()),
            _ => None,
        });

        assert_eq!(settings.bot_token.as_deref(), Some("123:abc"));
        assert!(settings.chat_id.is_none());
        assert!(settings.template_dir.is_none());
    }
}
