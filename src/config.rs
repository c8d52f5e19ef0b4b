//! Configuration loader and validator for the digest pipeline.
use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}

/// Root configuration struct mirroring the YAML schema exactly.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    pub app: App,
    pub mail: Mail,
    pub timeline: Timeline,
    pub confirmation: Confirmation,
    #[serde(default)]
    pub pipeline: Pipeline,
}

/// App-level settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct App {
    pub data_dir: String,
    #[serde(default)]
    pub database_url: Option<String>,
}

/// Outgoing mail settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Mail {
    pub from: String,
    pub api_base: String,
    pub domain: String,
    pub api_key: String,
}

/// Timeline proxy settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Timeline {
    pub base_url: String,
    #[serde(default = "default_page_size")]
    pub page_size: u32,
    #[serde(default = "default_max_concurrent_requests")]
    pub max_concurrent_requests: usize,
    #[serde(default = "default_request_timeout_seconds")]
    pub request_timeout_seconds: u64,
}

/// Email address confirmation links.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Confirmation {
    /// Page that accepts `?token=...` and marks the address confirmed.
    pub link_base: String,
    /// HMAC secret the link tokens are signed with.
    pub signing_key: String,
    #[serde(default = "default_token_ttl_hours")]
    pub token_ttl_hours: u32,
}

/// Pipeline tuning.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Pipeline {
    #[serde(default = "default_lock_lease_seconds")]
    pub lock_lease_seconds: u64,
    #[serde(default = "default_post_ttl_days")]
    pub post_ttl_days: u32,
}

impl Default for Pipeline {
    fn default() -> Self {
        Self {
            lock_lease_seconds: default_lock_lease_seconds(),
            post_ttl_days: default_post_ttl_days(),
        }
    }
}

fn default_page_size() -> u32 {
    100
}

fn default_max_concurrent_requests() -> usize {
    8
}

fn default_request_timeout_seconds() -> u64 {
    30
}

fn default_token_ttl_hours() -> u32 {
    24
}

fn default_lock_lease_seconds() -> u64 {
    3600
}

fn default_post_ttl_days() -> u32 {
    30
}

impl App {
    /// `DATABASE_URL` wins over `app.database_url`, which wins over a
    /// database file inside `app.data_dir`.
    pub fn database_url(&self) -> String {
        if let Ok(url) = std::env::var("DATABASE_URL") {
            if !url.trim().is_empty() {
                return url;
            }
        }
        match &self.database_url {
            Some(url) if !url.trim().is_empty() => url.clone(),
            _ => format!("sqlite://{}/digest.db", self.data_dir.trim_end_matches('/')),
        }
    }
}

impl Config {
    /// Ensure required directories exist (creates `app.data_dir` if missing).
    pub fn ensure_dirs(&self) -> Result<(), std::io::Error> {
        if self.app.data_dir.trim().is_empty() {
            return Ok(());
        }
        fs::create_dir_all(&self.app.data_dir)
    }
}

/// Load configuration from a YAML file and validate it.
/// - If `path` is None, uses `config.yaml` in the current working directory.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.unwrap_or_else(|| Path::new("config.yaml"));
    let content = fs::read_to_string(path)?;
    let cfg: Config = serde_yaml::from_str(&content)?;
    validate(&cfg)?;
    Ok(cfg)
}

/// Validate a configuration instance.
fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.app.data_dir.trim().is_empty() {
        return Err(ConfigError::Invalid("app.data_dir must be non-empty"));
    }

    if !cfg.mail.from.contains('@') {
        return Err(ConfigError::Invalid("mail.from must be an email address"));
    }
    if Url::parse(&cfg.mail.api_base).is_err() {
        return Err(ConfigError::Invalid("mail.api_base must be a valid URL"));
    }
    if cfg.mail.domain.trim().is_empty() {
        return Err(ConfigError::Invalid("mail.domain must be non-empty"));
    }
    if cfg.mail.api_key.trim().is_empty() {
        return Err(ConfigError::Invalid("mail.api_key must be non-empty"));
    }

    if Url::parse(&cfg.timeline.base_url).is_err() {
        return Err(ConfigError::Invalid("timeline.base_url must be a valid URL"));
    }
    if cfg.timeline.page_size == 0 {
        return Err(ConfigError::Invalid("timeline.page_size must be > 0"));
    }
    if cfg.timeline.max_concurrent_requests == 0 {
        return Err(ConfigError::Invalid("timeline.max_concurrent_requests must be > 0"));
    }
    if cfg.timeline.request_timeout_seconds == 0 {
        return Err(ConfigError::Invalid("timeline.request_timeout_seconds must be > 0"));
    }

    if Url::parse(&cfg.confirmation.link_base).is_err() {
        return Err(ConfigError::Invalid("confirmation.link_base must be a valid URL"));
    }
    if cfg.confirmation.signing_key.trim().is_empty() {
        return Err(ConfigError::Invalid("confirmation.signing_key must be non-empty"));
    }
    if cfg.confirmation.token_ttl_hours == 0 {
        return Err(ConfigError::Invalid("confirmation.token_ttl_hours must be > 0"));
    }

    if cfg.pipeline.lock_lease_seconds == 0 {
        return Err(ConfigError::Invalid("pipeline.lock_lease_seconds must be > 0"));
    }
    if cfg.pipeline.post_ttl_days == 0 {
        return Err(ConfigError::Invalid("pipeline.post_ttl_days must be > 0"));
    }

    Ok(())
}

/// Returns the example YAML shipped as `config.example.yaml`.
pub fn example() -> &'static str {
    r#"app:
  data_dir: "./data"

mail:
  from: "Digest <digest@mg.example.com>"
  api_base: "https://api.mailgun.net/v3"
  domain: "mg.example.com"
  api_key: "YOUR_MAILGUN_API_KEY"

timeline:
  base_url: "http://127.0.0.1:8088/"
  page_size: 100
  max_concurrent_requests: 8
  request_timeout_seconds: 30

confirmation:
  link_base: "https://digest.example.com/confirm/email"
  signing_key: "CHANGE_ME"
  token_ttl_hours: 24

pipeline:
  lock_lease_seconds: 3600
  post_ttl_days: 30
"#
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn example_config() -> Config {
        serde_yaml::from_str(example()).unwrap()
    }

    #[test]
    fn parse_example_ok() {
        let cfg = example_config();
        validate(&cfg).unwrap();
        assert_eq!(cfg.timeline.page_size, 100);
        assert_eq!(cfg.pipeline.post_ttl_days, 30);
    }

    #[test]
    fn defaults_fill_optional_sections() {
        let yaml = r#"
app:
  data_dir: "/tmp/digest"
mail:
  from: "me@example.com"
  api_base: "https://api.mailgun.net/v3"
  domain: "mg.example.com"
  api_key: "k"
timeline:
  base_url: "http://localhost:8088"
confirmation:
  link_base: "https://digest.example.com/confirm/email"
  signing_key: "s3cret"
"#;
        let cfg: Config = serde_yaml::from_str(yaml).unwrap();
        validate(&cfg).unwrap();
        assert_eq!(cfg.pipeline, Pipeline::default());
        assert_eq!(cfg.timeline.max_concurrent_requests, 8);
        assert_eq!(cfg.app.database_url, None);
        assert_eq!(cfg.confirmation.token_ttl_hours, 24);
    }

    #[test]
    fn invalid_mail_settings() {
        let mut cfg = example_config();
        cfg.mail.api_key = "  ".into();
        let err = validate(&cfg).unwrap_err();
        match err { ConfigError::Invalid(msg) => assert!(msg.contains("mail.api_key")), _ => panic!("wrong error") }

        let mut cfg = example_config();
        cfg.mail.from = "nobody".into();
        let err = validate(&cfg).unwrap_err();
        match err { ConfigError::Invalid(msg) => assert!(msg.contains("mail.from")), _ => panic!("wrong error") }

        let mut cfg = example_config();
        cfg.mail.api_base = "not a url".into();
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn invalid_timeline_confirmation_and_pipeline_settings() {
        let mut cfg = example_config();
        cfg.timeline.base_url = "".into();
        let err = validate(&cfg).unwrap_err();
        match err { ConfigError::Invalid(msg) => assert!(msg.contains("timeline.base_url")), _ => panic!("wrong error") }

        let mut cfg = example_config();
        cfg.timeline.max_concurrent_requests = 0;
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));

        let mut cfg = example_config();
        cfg.confirmation.signing_key = "".into();
        let err = validate(&cfg).unwrap_err();
        match err { ConfigError::Invalid(msg) => assert!(msg.contains("confirmation.signing_key")), _ => panic!("wrong error") }

        let mut cfg = example_config();
        cfg.pipeline.lock_lease_seconds = 0;
        let err = validate(&cfg).unwrap_err();
        match err { ConfigError::Invalid(msg) => assert!(msg.contains("lock_lease_seconds")), _ => panic!("wrong error") }
    }

    #[test]
    fn database_url_prefers_explicit_setting() {
        let mut cfg = example_config();
        if std::env::var("DATABASE_URL").is_ok() {
            return;
        }
        assert_eq!(cfg.app.database_url(), "sqlite://./data/digest.db");
        cfg.app.database_url = Some("sqlite:///var/lib/digest.db".into());
        assert_eq!(cfg.app.database_url(), "sqlite:///var/lib/digest.db");
    }

    #[test]
    fn ensure_dirs_creates_data_dir() {
        let td = tempdir().unwrap();
        let data_path = td.path().join("data");
        let mut cfg = example_config();
        cfg.app.data_dir = data_path.to_string_lossy().to_string();
        cfg.ensure_dirs().unwrap();
        assert!(data_path.exists());
    }

    #[test]
    fn load_from_file_ok() {
        let td = tempdir().unwrap();
        let p = td.path().join("config.yaml");
        fs::write(&p, example()).unwrap();
        let cfg = load(Some(&p)).unwrap();
        assert_eq!(cfg.mail.domain, "mg.example.com");
    }
}
