//! Telegram bot notifications.
//!
//! Every operation here is a single outbound HTTP call, fire-and-forget:
//! delivery is never verified, nothing is retried, and a transport error
//! degrades to a `[WARN]` line on stderr. The build's exit code must never
//! depend on whether a chat message landed.
//!
//! Status text is built by [`render_status_message`], which escapes every
//! substitution that originates outside this program (hostnames, commit
//! subjects) so a stray `<` in a commit message cannot corrupt the markup.

use anyhow::{bail, Context, Result};
use reqwest::blocking::{multipart, Client};
use std::path::{Path, PathBuf};

use crate::config::{DeviceProfile, EnvSettings};

const API_BASE: &str = "https://api.telegram.org";

/// Fixed text posted when the build fails.
const FAILURE_TEXT: &str = "Build failed! Check the worker log for details.";

/// Sends build notifications to a bot API endpoint.
pub struct Notifier {
    client: Client,
    token: String,
    /// Public channel for the start-of-build announcement.
    chat_id: String,
    /// Private channel for status, failure, and artifact posts.
    private_chat_id: String,
}

impl Notifier {
    /// Build a notifier from the environment settings.
    ///
    /// Returns `None` (with a visible warning) when any credential is
    /// missing; CI frequently runs without secrets and the build itself
    /// must not depend on the messaging side-channel.
    pub fn from_env(env: &EnvSettings) -> Option<Self> {
        let (token, chat_id, private_chat_id) = match (
            env.bot_token.clone(),
            env.chat_id.clone(),
            env.private_chat_id.clone(),
        ) {
            (Some(t), Some(c), Some(p)) => (t, c, p),
            _ => {
                eprintln!(
                    "  [WARN] notifications disabled (set BOT_TOKEN, CHAT_ID, PRIVATE_CHAT_ID)"
                );
                return None;
            }
        };

        Some(Self {
            client: Client::new(),
            token,
            chat_id,
            private_chat_id,
        })
    }

    /// Post the plain start-of-build message to the public channel.
    pub fn announce(&self, profile: &DeviceProfile) {
        let text = format!(
            "{} build started for {} ({})",
            profile.kernel_name, profile.device, profile.codename
        );
        self.send_message(&self.chat_id, &text, false);
    }

    /// Post the rich status card to the private channel.
    pub fn report_status(&self, report: &StatusReport) {
        self.send_message(&self.private_chat_id, &render_status_message(report), true);
    }

    /// Post the fixed failure message to the private channel.
    ///
    /// The caller terminates the pipeline afterwards; the non-zero exit
    /// comes from the build failure, not from this call.
    pub fn report_failure(&self) {
        self.send_message(&self.private_chat_id, FAILURE_TEXT, false);
    }

    /// Upload the finished archive as a document with a caption.
    ///
    /// The archive is located by extension in `dir`; zero or multiple
    /// matches refuse to guess and skip the upload with a warning.
    pub fn upload_artifact(&self, dir: &Path, caption: &str) {
        let archive = match find_archive(dir) {
            Ok(path) => path,
            Err(e) => {
                eprintln!("  [WARN] artifact upload skipped: {e:#}");
                return;
            }
        };

        println!("  Uploading {}...", archive.display());
        let form = multipart::Form::new()
            .text("chat_id", self.private_chat_id.clone())
            .text("caption", caption.to_string())
            .file("document", &archive);

        let form = match form {
            Ok(f) => f,
            Err(e) => {
                eprintln!("  [WARN] could not read {}: {}", archive.display(), e);
                return;
            }
        };

        let url = format!("{}/bot{}/sendDocument", API_BASE, self.token);
        if let Err(e) = self.client.post(&url).multipart(form).send() {
            eprintln!("  [WARN] sendDocument failed: {}", e);
        }
    }

    /// Single sendMessage call. Delivery is not verified.
    fn send_message(&self, chat_id: &str, text: &str, html: bool) {
        let mut payload = serde_json::json!({
            "chat_id": chat_id,
            "text": text,
            "disable_web_page_preview": true,
        });
        if html {
            payload["parse_mode"] = serde_json::Value::String("HTML".into());
        }

        let url = format!("{}/bot{}/sendMessage", API_BASE, self.token);
        if let Err(e) = self.client.post(&url).json(&payload).send() {
            eprintln!("  [WARN] sendMessage failed: {}", e);
        }
    }
}

/// Everything the status card shows.
pub struct StatusReport {
    pub host: String,
    pub build_date: String,
    pub device: String,
    pub kernel_version: String,
    pub build_type: String,
    pub compiler: String,
    pub linker: String,
    pub archive_name: String,
    pub branch: String,
    pub commit_subject: String,
    pub commit_url: Option<String>,
}

/// Render the HTML status card.
///
/// Every substituted value is escaped; the markup skeleton is the only
/// source of tags in the output.
pub fn render_status_message(r: &StatusReport) -> String {
    let commit_line = match &r.commit_url {
        Some(url) => format!(
            "<a href=\"{}\">{}</a>",
            escape_html(url),
            escape_html(&r.commit_subject)
        ),
        None => escape_html(&r.commit_subject),
    };

    format!(
        "<b>Build machine:</b> {host}\n\
         <b>Build date:</b> {date}\n\
         <b>Device:</b> {device}\n\
         <b>Kernel:</b> {kernel}\n\
         <b>Build type:</b> {build_type}\n\
         <b>Compiler:</b> {compiler}\n\
         <b>Linker:</b> {linker}\n\
         <b>Archive:</b> <code>{archive}</code>\n\
         <b>Branch:</b> {branch}\n\
         <b>Last commit:</b> {commit}",
        host = escape_html(&r.host),
        date = escape_html(&r.build_date),
        device = escape_html(&r.device),
        kernel = escape_html(&r.kernel_version),
        build_type = escape_html(&r.build_type),
        compiler = escape_html(&r.compiler),
        linker = escape_html(&r.linker),
        archive = escape_html(&r.archive_name),
        branch = escape_html(&r.branch),
        commit = commit_line,
    )
}

/// Escape the characters Telegram's HTML parse mode treats specially.
pub(crate) fn escape_html(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            _ => out.push(c),
        }
    }
    out
}

/// Locate the one archive in the output directory.
///
/// Refuses to guess: zero matches means the packager never ran, multiple
/// matches means a stale archive survived a previous run.
pub(crate) fn find_archive(dir: &Path) -> Result<PathBuf> {
    let mut matches: Vec<PathBuf> = Vec::new();
    for entry in std::fs::read_dir(dir)
        .with_context(|| format!("Failed to read {}", dir.display()))?
    {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) == Some("zip") {
            matches.push(path);
        }
    }

    match matches.len() {
        0 => bail!("no archive found in {}", dir.display()),
        1 => Ok(matches.remove(0)),
        n => {
            matches.sort();
            bail!(
                "{} archives found in {}; refusing to pick one: {}",
                n,
                dir.display(),
                matches
                    .iter()
                    .map(|p| p.display().to_string())
                    .collect::<Vec<_>>()
                    .join(", ")
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn sample_report() -> StatusReport {
        StatusReport {
            host: "builder-01".into(),
            build_date: "Mon 03 Aug 2026 14:05 UTC".into(),
            device: "Redmi Note 8 / 8T (ginkgo)".into(),
            kernel_version: "Stratos-v1.4-1a2b3c4d".into(),
            build_type: "Release".into(),
            compiler: "AOSP clang version 12.0.5".into(),
            linker: "LLD 12.0.5".into(),
            archive_name: "Stratos-ginkgo-v1.4-1a2b3c4d.zip".into(),
            branch: "main".into(),
            commit_subject: "thermal: tune <80C throttle & fan".into(),
            commit_url: Some("https://example.com/commit/1a2b3c4d".into()),
        }
    }

    #[test]
    fn test_escape_html() {
        assert_eq!(escape_html("a < b & c > d"), "a &lt; b &amp; c &gt; d");
        assert_eq!(escape_html("plain"), "plain");
    }

    #[test]
    fn test_render_escapes_commit_subject() {
        let msg = render_status_message(&sample_report());
        assert!(msg.contains("tune &lt;80C throttle &amp; fan"));
        assert!(!msg.contains("<80C"));
        // The link wraps the escaped subject
        assert!(msg.contains("<a href=\"https://example.com/commit/1a2b3c4d\">"));
    }

    #[test]
    fn test_render_without_commit_link() {
        let mut report = sample_report();
        report.commit_url = None;
        let msg = render_status_message(&report);
        assert!(!msg.contains("<a href"));
        assert!(msg.contains("<b>Last commit:</b> thermal:"));
    }

    #[test]
    fn test_find_archive_exactly_one() {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join("build.zip"), b"zip").unwrap();
        fs::write(temp.path().join("notes.txt"), b"txt").unwrap();

        let found = find_archive(temp.path()).unwrap();
        assert_eq!(found.file_name().unwrap(), "build.zip");
    }

    #[test]
    fn test_find_archive_none() {
        let temp = TempDir::new().unwrap();
        assert!(find_archive(temp.path()).is_err());
    }

    #[test]
    fn test_find_archive_multiple() {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join("a.zip"), b"zip").unwrap();
        fs::write(temp.path().join("b.zip"), b"zip").unwrap();

        let err = find_archive(temp.path()).unwrap_err();
        assert!(err.to_string().contains("refusing"));
    }
}
