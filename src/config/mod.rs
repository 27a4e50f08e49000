//! Configuration loading.
//!
//! Configuration comes from an optional TOML file (with `${VAR}`
//! interpolation), then environment-backed command line overrides. Every
//! section has defaults so an empty file is valid apart from credentials.

mod vars;

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::daemon::DaemonConfig;
use crate::domain::record::{MailDefaults, RetryPolicy};
use crate::error::{Result, TexpostError};

pub use vars::interpolate;

/// Mail body used when neither the record nor the config provides one.
pub const DEFAULT_EMAIL_BODY: &str =
    "Im Anhang befindet sich die gewünschte PDF.\n\n\
     Dies ist eine automatisch generierte Email. Beep. Boop.";

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub paths: PathsConfig,
    pub template: TemplateConfig,
    pub compiler: CompilerConfig,
    pub smtp: SmtpConfig,
    pub daemon: DaemonConfig,
}

/// Filesystem layout. Relative directories are resolved against `root`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    pub root: PathBuf,
    pub data: PathBuf,
    pub templates: PathBuf,
    pub pdfs: PathBuf,
    pub emails: PathBuf,
    pub archive: PathBuf,
    pub failed: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("."),
            data: PathBuf::from("data"),
            templates: PathBuf::from("templates"),
            pdfs: PathBuf::from("pdfs"),
            emails: PathBuf::from("emails"),
            archive: PathBuf::from("archive"),
            failed: PathBuf::from("failed"),
        }
    }
}

impl PathsConfig {
    /// All paths rooted at `root`, with default directory names.
    pub fn rooted(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            ..Default::default()
        }
    }

    fn resolve(&self, dir: &Path) -> PathBuf {
        if dir.is_absolute() {
            dir.to_path_buf()
        } else {
            self.root.join(dir)
        }
    }

    pub fn data_dir(&self) -> PathBuf {
        self.resolve(&self.data)
    }

    pub fn templates_dir(&self) -> PathBuf {
        self.resolve(&self.templates)
    }

    pub fn pdfs_dir(&self) -> PathBuf {
        self.resolve(&self.pdfs)
    }

    pub fn emails_dir(&self) -> PathBuf {
        self.resolve(&self.emails)
    }

    pub fn archive_dir(&self) -> PathBuf {
        self.resolve(&self.archive)
    }

    pub fn failed_dir(&self) -> PathBuf {
        self.resolve(&self.failed)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TemplateConfig {
    /// Template used by records that do not name one.
    pub default_name: String,
    /// Placeholders every template must contain; checked when it is loaded.
    pub required_placeholders: Vec<String>,
}

impl Default for TemplateConfig {
    fn default() -> Self {
        Self {
            default_name: "template.tex".to_string(),
            required_placeholders: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CompilerConfig {
    pub program: String,
    /// `{work_dir}` and `{source}` are replaced per record.
    pub args: Vec<String>,
    pub timeout_ms: u64,
    pub max_attempts: u32,
}

impl Default for CompilerConfig {
    fn default() -> Self {
        Self {
            program: "pdflatex".to_string(),
            args: [
                "-interaction=nonstopmode",
                "-halt-on-error",
                "-output-directory",
                "{work_dir}",
                "{source}",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
            timeout_ms: 30_000,
            max_attempts: 3,
        }
    }
}

#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SmtpConfig {
    pub server: String,
    pub port: u16,
    /// Sender address, also the login name.
    pub sender: String,
    pub password: String,
    pub timeout_ms: u64,
    pub max_attempts: u32,
    /// Default mail subject; may contain placeholders.
    pub subject: String,
    /// Default plain-text mail body; may contain placeholders.
    pub body: String,
}

impl Default for SmtpConfig {
    fn default() -> Self {
        Self {
            server: String::new(),
            port: 587,
            sender: String::new(),
            password: String::new(),
            timeout_ms: 30_000,
            max_attempts: 3,
            subject: "Your document".to_string(),
            body: DEFAULT_EMAIL_BODY.to_string(),
        }
    }
}

impl std::fmt::Debug for SmtpConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SmtpConfig")
            .field("server", &self.server)
            .field("port", &self.port)
            .field("sender", &self.sender)
            .field("password", &"<redacted>")
            .field("timeout_ms", &self.timeout_ms)
            .field("max_attempts", &self.max_attempts)
            .finish_non_exhaustive()
    }
}

/// Values that override the file, typically from environment variables.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub root: Option<PathBuf>,
    pub pdf_dir: Option<PathBuf>,
    pub template_file: Option<String>,
    pub smtp_server: Option<String>,
    pub smtp_port: Option<u16>,
    pub smtp_sender: Option<String>,
    pub smtp_password: Option<String>,
    pub email_body: Option<String>,
}

impl Config {
    /// Load from a TOML file, or defaults if `path` is `None`.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => {
                let raw = std::fs::read_to_string(path).map_err(|e| {
                    TexpostError::Config(format!("cannot read {}: {}", path.display(), e))
                })?;
                Self::from_toml(&raw)
            }
            None => Ok(Self::default()),
        }
    }

    pub fn from_toml(raw: &str) -> Result<Self> {
        let text = interpolate(raw).map_err(|errors| TexpostError::Config(errors.join("; ")))?;
        toml::from_str(&text).map_err(|e| TexpostError::Config(e.to_string()))
    }

    pub fn apply_overrides(&mut self, overrides: ConfigOverrides) {
        if let Some(root) = overrides.root {
            self.paths.root = root;
        }
        if let Some(pdfs) = overrides.pdf_dir {
            self.paths.pdfs = pdfs;
        }
        if let Some(template) = overrides.template_file {
            self.template.default_name = template;
        }
        if let Some(server) = overrides.smtp_server {
            self.smtp.server = server;
        }
        if let Some(port) = overrides.smtp_port {
            self.smtp.port = port;
        }
        if let Some(sender) = overrides.smtp_sender {
            self.smtp.sender = sender;
        }
        if let Some(password) = overrides.smtp_password {
            self.smtp.password = password;
        }
        if let Some(body) = overrides.email_body {
            self.smtp.body = body;
        }
    }

    /// Check the settings a batch cannot run without.
    pub fn validate(&self) -> Result<()> {
        let mut problems = Vec::new();
        if self.smtp.server.trim().is_empty() {
            problems.push("smtp.server (SMTP_SERVER) is not set".to_string());
        }
        if self.smtp.sender.trim().is_empty() {
            problems.push("smtp.sender (SMTP_SENDER_EMAIL) is not set".to_string());
        }
        if self.smtp.password.is_empty() {
            problems.push("smtp.password (SMTP_SENDER_PASSWORD) is not set".to_string());
        }
        for (name, value) in [
            ("compiler.max_attempts", self.compiler.max_attempts as u64),
            ("smtp.max_attempts", self.smtp.max_attempts as u64),
            ("compiler.timeout_ms", self.compiler.timeout_ms),
            ("smtp.timeout_ms", self.smtp.timeout_ms),
            (
                "daemon.max_concurrent_records",
                self.daemon.max_concurrent_records as u64,
            ),
            ("daemon.backoff_factor", self.daemon.backoff_factor),
        ] {
            if value < 1 {
                problems.push(format!("{} must be at least 1", name));
            }
        }
        if self.compiler.program.trim().is_empty() {
            problems.push("compiler.program is empty".to_string());
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(TexpostError::Config(problems.join("; ")))
        }
    }

    pub fn compile_policy(&self) -> RetryPolicy {
        self.daemon.retry_policy(self.compiler.max_attempts)
    }

    pub fn delivery_policy(&self) -> RetryPolicy {
        self.daemon.retry_policy(self.smtp.max_attempts)
    }

    pub fn mail_defaults(&self) -> MailDefaults {
        MailDefaults {
            subject: self.smtp.subject.clone(),
            body: self.smtp.body.clone(),
        }
    }

    /// JSON snapshot for run records, without secrets.
    pub fn redacted_snapshot(&self) -> serde_json::Value {
        let mut copy = self.clone();
        if !copy.smtp.password.is_empty() {
            copy.smtp.password = "<redacted>".to_string();
        }
        serde_json::to_value(&copy).unwrap_or(serde_json::Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> Config {
        let mut config = Config::default();
        config.smtp.server = "smtp.example.com".into();
        config.smtp.sender = "bot@example.com".into();
        config.smtp.password = "secret".into();
        config
    }

    #[test]
    fn test_defaults_match_layout() {
        let config = Config::default();
        assert_eq!(config.paths.data_dir(), PathBuf::from("./data"));
        assert_eq!(config.template.default_name, "template.tex");
        assert_eq!(config.compiler.program, "pdflatex");
        assert_eq!(config.compiler.timeout_ms, 30_000);
        assert_eq!(config.smtp.port, 587);
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = Config::from_toml(
            r#"
[paths]
root = "/srv/texpost"
pdfs = "/var/pdfs"

[compiler]
max_attempts = 5

[daemon]
max_concurrent_records = 8
"#,
        )
        .unwrap();

        assert_eq!(config.paths.data_dir(), PathBuf::from("/srv/texpost/data"));
        assert_eq!(config.paths.pdfs_dir(), PathBuf::from("/var/pdfs"));
        assert_eq!(config.compiler.max_attempts, 5);
        assert_eq!(config.compiler.program, "pdflatex");
        assert_eq!(config.daemon.max_concurrent_records, 8);
        assert_eq!(config.daemon.backoff_factor, DaemonConfig::default().backoff_factor);
    }

    #[test]
    fn test_unknown_toml_is_config_error() {
        let err = Config::from_toml("[compiler]\nmax_attempts = \"many\"").unwrap_err();
        assert!(matches!(err, TexpostError::Config(_)));
        assert!(err.is_batch_fatal());
    }

    #[test]
    fn test_overrides_win() {
        let mut config = Config::default();
        config.apply_overrides(ConfigOverrides {
            smtp_server: Some("mail.example.org".into()),
            smtp_port: Some(2525),
            template_file: Some("letter.tex".into()),
            ..Default::default()
        });
        assert_eq!(config.smtp.server, "mail.example.org");
        assert_eq!(config.smtp.port, 2525);
        assert_eq!(config.template.default_name, "letter.tex");
    }

    #[test]
    fn test_validate_requires_credentials() {
        let err = Config::default().validate().unwrap_err().to_string();
        assert!(err.contains("SMTP_SERVER"));
        assert!(err.contains("SMTP_SENDER_PASSWORD"));
        assert!(valid().validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_limits() {
        let mut config = valid();
        config.compiler.max_attempts = 0;
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("compiler.max_attempts"));
    }

    #[test]
    fn test_snapshot_hides_password() {
        let snapshot = valid().redacted_snapshot();
        assert_eq!(snapshot["smtp"]["password"], "<redacted>");
        assert!(!format!("{:?}", valid().smtp).contains("secret"));
    }
}
