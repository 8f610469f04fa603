//! External command plumbing.
//!
//! Everything this pipeline does that matters happens in child processes
//! (git, make, the dtbo packer, zip). `Cmd` wraps `std::process::Command`
//! with the error reporting the rest of the crate expects: a single
//! `error_msg` shown on failure together with the exit status and the tail
//! of stderr.
//!
//! # Example
//!
//! ```rust,ignore
//! use kernel_builder::process::Cmd;
//!
//! let result = Cmd::new("git")
//!     .args(["rev-parse", "--short=8", "HEAD"])
//!     .error_msg("git rev-parse failed")
//!     .run()?;
//! println!("HEAD is {}", result.stdout.trim());
//! ```

use anyhow::{bail, Context, Result};
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus};

/// Builder for a single external command invocation.
pub struct Cmd {
    program: String,
    args: Vec<String>,
    envs: Vec<(String, String)>,
    cwd: Option<PathBuf>,
    error_msg: Option<String>,
    allow_fail: bool,
}

/// Captured result of a finished command.
#[derive(Debug)]
pub struct CmdResult {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
}

impl CmdResult {
    pub fn success(&self) -> bool {
        self.status.success()
    }
}

impl Cmd {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            envs: Vec::new(),
            cwd: None,
            error_msg: None,
            allow_fail: false,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for a in args {
            self.args.push(a.as_ref().to_string());
        }
        self
    }

    /// Append a path argument (lossy UTF-8, which is fine for build trees).
    pub fn arg_path(mut self, path: impl AsRef<Path>) -> Self {
        self.args.push(path.as_ref().to_string_lossy().into_owned());
        self
    }

    /// Set an environment variable for the child process only.
    pub fn env(mut self, key: impl Into<String>, value: impl AsRef<str>) -> Self {
        self.envs.push((key.into(), value.as_ref().to_string()));
        self
    }

    pub fn current_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.cwd = Some(dir.as_ref().to_path_buf());
        self
    }

    /// Message reported when the command exits non-zero.
    pub fn error_msg(mut self, msg: impl Into<String>) -> Self {
        self.error_msg = Some(msg.into());
        self
    }

    /// A non-zero exit becomes part of the result instead of an error.
    pub fn allow_fail(mut self) -> Self {
        self.allow_fail = true;
        self
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        for (k, v) in &self.envs {
            cmd.env(k, v);
        }
        if let Some(dir) = &self.cwd {
            cmd.current_dir(dir);
        }
        cmd
    }

    /// Run the command, capturing stdout and stderr.
    pub fn run(self) -> Result<CmdResult> {
        let output = self
            .command()
            .output()
            .with_context(|| format!("failed to launch '{}'", self.program))?;

        let result = CmdResult {
            status: output.status,
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };

        if !result.success() && !self.allow_fail {
            let msg = self
                .error_msg
                .unwrap_or_else(|| format!("'{}' failed", self.program));
            let stderr = stderr_excerpt(&result.stderr);
            if stderr.is_empty() {
                bail!("{} (exit: {})", msg, result.status);
            }
            bail!("{} (exit: {})\n{}", msg, result.status, stderr);
        }

        Ok(result)
    }

    /// Run the command with inherited stdio (progress visible to the user).
    ///
    /// Used for the long-running make invocations where capturing output
    /// would hide the compiler progress.
    pub fn run_interactive(self) -> Result<()> {
        let status = self
            .command()
            .status()
            .with_context(|| format!("failed to launch '{}'", self.program))?;

        if !status.success() && !self.allow_fail {
            let msg = self
                .error_msg
                .unwrap_or_else(|| format!("'{}' failed", self.program));
            bail!("{} (exit: {})", msg, status);
        }

        Ok(())
    }
}

/// Last few lines of stderr, enough to diagnose without flooding the log.
fn stderr_excerpt(stderr: &str) -> String {
    const KEEP: usize = 15;
    let lines: Vec<&str> = stderr.trim_end().lines().collect();
    if lines.len() <= KEEP {
        lines.join("\n")
    } else {
        lines[lines.len() - KEEP..].join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_captures_stdout() {
        let result = Cmd::new("echo").arg("hello").run().unwrap();
        assert!(result.success());
        assert_eq!(result.stdout.trim(), "hello");
    }

    #[test]
    fn test_run_reports_error_msg() {
        let err = Cmd::new("false").error_msg("boom").run().unwrap_err();
        assert!(err.to_string().contains("boom"));
    }

    #[test]
    fn test_allow_fail_keeps_status() {
        let result = Cmd::new("false").allow_fail().run().unwrap();
        assert!(!result.success());
    }

    #[test]
    fn test_env_and_current_dir() {
        let temp = tempfile::TempDir::new().unwrap();
        let canonical = temp.path().canonicalize().unwrap();
        let result = Cmd::new("sh")
            .args(["-c", "echo \"$MARKER\" && pwd"])
            .env("MARKER", "on")
            .current_dir(temp.path())
            .run()
            .unwrap();
        assert!(result.stdout.starts_with("on"));
        assert!(result.stdout.contains(&canonical.to_string_lossy().into_owned()));
    }

    #[test]
    fn test_stderr_excerpt_truncates() {
        let many: String = (0..40).map(|i| format!("line {}\n", i)).collect();
        let excerpt = stderr_excerpt(&many);
        assert!(excerpt.starts_with("line 25"));
        assert!(excerpt.ends_with("line 39"));
    }
}
