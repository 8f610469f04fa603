//! Build pipeline for flashable Stratos kernel archives.
//!
//! Drives one cross-compilation build of the Stratos kernel for ginkgo
//! (Redmi Note 8 / 8T) end to end:
//!
//! - **Preparation** - host tool checks, build identity from git, toolchain
//!   identity from the compiler and linker banners
//! - **Notifier** - start/status/failure messages and the artifact upload
//!   to a Telegram bot API
//! - **Compiler invocation** - defconfig plus fragments, the parallel make,
//!   and artifact verification
//! - **Packager** - packaging-template staging, module metadata rewrites,
//!   and the final zip
//!
//! The heavy lifting (the compile itself, the overlay packer, the archive
//! format) lives in external tools; this crate is the glue that sequences
//! them, with one [`config::BuildConfig`] context passed into every stage
//! instead of process-wide environment state.

pub mod build;
pub mod config;
pub mod identity;
pub mod notify;
pub mod package;
pub mod pipeline;
pub mod preflight;
pub mod process;

pub use config::{BuildConfig, DeviceProfile, EnvSettings};
pub use identity::{BuildIdentity, ToolchainDescriptor};
