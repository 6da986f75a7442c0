//! Configuration loader and validator for the delivery agent.
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;
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
    pub agent: Agent,
    pub catalog: Catalog,
    pub queue: Queue,
}

/// Agent-level settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Agent {
    pub data_dir: String,
    #[serde(default = "default_reconcile_interval")]
    pub reconcile_interval_secs: u64,
    #[serde(default = "default_display_interval")]
    pub display_interval_secs: u64,
    /// Overrides the identity resolved from the OS user.
    #[serde(default)]
    pub identity: Option<String>,
}

/// Remote catalog API settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Catalog {
    pub base_url: String,
    pub token: String,
}

/// Outcome queue settings (NATS JetStream).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Queue {
    pub url: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    pub stream: String,
    pub subject: String,
    /// Constant `message_id` stamped on every event of this log stream.
    #[serde(default = "default_log_stream_id")]
    pub log_stream_id: i64,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

fn default_reconcile_interval() -> u64 {
    60
}

fn default_display_interval() -> u64 {
    20
}

fn default_log_stream_id() -> i64 {
    1
}

fn default_connect_timeout() -> u64 {
    5
}

impl Config {
    /// Ensure required directories exist (creates `agent.data_dir` if missing).
    pub fn ensure_dirs(&self) -> Result<(), std::io::Error> {
        if self.agent.data_dir.trim().is_empty() {
            return Ok(());
        }
        fs::create_dir_all(&self.agent.data_dir)
    }

    /// SQLite URL for the local cache, honoring a `DATABASE_URL` override.
    pub fn database_url(&self) -> String {
        std::env::var("DATABASE_URL")
            .unwrap_or_else(|_| format!("sqlite://{}/agent.db", self.agent.data_dir))
    }

    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.agent.reconcile_interval_secs)
    }

    pub fn display_interval(&self) -> Duration {
        Duration::from_secs(self.agent.display_interval_secs)
    }
}

impl Queue {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
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
    if cfg.agent.data_dir.trim().is_empty() {
        return Err(ConfigError::Invalid("agent.data_dir must be non-empty"));
    }
    if cfg.agent.reconcile_interval_secs == 0 {
        return Err(ConfigError::Invalid("agent.reconcile_interval_secs must be > 0"));
    }
    if cfg.agent.display_interval_secs == 0 {
        return Err(ConfigError::Invalid("agent.display_interval_secs must be > 0"));
    }
    if let Some(identity) = &cfg.agent.identity {
        if identity.trim().is_empty() {
            return Err(ConfigError::Invalid("agent.identity must be non-empty when set"));
        }
    }

    if cfg.catalog.base_url.trim().is_empty() {
        return Err(ConfigError::Invalid("catalog.base_url must be non-empty"));
    }
    if reqwest::Url::parse(&cfg.catalog.base_url).is_err() {
        return Err(ConfigError::Invalid("catalog.base_url must be a valid URL"));
    }

    if cfg.queue.url.trim().is_empty() {
        return Err(ConfigError::Invalid("queue.url must be non-empty"));
    }
    if cfg.queue.stream.trim().is_empty() {
        return Err(ConfigError::Invalid("queue.stream must be non-empty"));
    }
    if cfg.queue.subject.trim().is_empty() {
        return Err(ConfigError::Invalid("queue.subject must be non-empty"));
    }
    if cfg.queue.username.is_some() != cfg.queue.password.is_some() {
        return Err(ConfigError::Invalid(
            "queue.username and queue.password must be set together",
        ));
    }

    Ok(())
}

/// Returns the example YAML document shipped with the agent.
pub fn example() -> &'static str {
    r#"agent:
  data_dir: "./data"
  reconcile_interval_secs: 60
  display_interval_secs: 20

catalog:
  base_url: "http://localhost:5050/"
  token: "YOUR_CATALOG_BEARER_TOKEN"

queue:
  url: "nats://localhost:4222"
  username: "guest"
  password: "guest"
  stream: "ACTIVITY"
  subject: "activity_queue"
  log_stream_id: 1
  connect_timeout_secs: 5
"#
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn parse_example_ok() {
        let cfg: Config = serde_yaml::from_str(example()).unwrap();
        validate(&cfg).unwrap();
        assert_eq!(cfg.reconcile_interval(), Duration::from_secs(60));
        assert_eq!(cfg.display_interval(), Duration::from_secs(20));
        assert!(cfg.agent.identity.is_none());
    }

    #[test]
    fn intervals_default_when_omitted() {
        let yaml = r#"agent:
  data_dir: "./data"
catalog:
  base_url: "http://localhost:5050/"
  token: ""
queue:
  url: "nats://localhost:4222"
  stream: "ACTIVITY"
  subject: "activity_queue"
"#;
        let cfg: Config = serde_yaml::from_str(yaml).unwrap();
        validate(&cfg).unwrap();
        assert_eq!(cfg.agent.reconcile_interval_secs, 60);
        assert_eq!(cfg.agent.display_interval_secs, 20);
        assert_eq!(cfg.queue.log_stream_id, 1);
        assert_eq!(cfg.queue.connect_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn invalid_intervals() {
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.agent.display_interval_secs = 0;
        let err = validate(&cfg).unwrap_err();
        match err { ConfigError::Invalid(msg) => assert!(msg.contains("display_interval")), _ => panic!("wrong error") }

        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.agent.reconcile_interval_secs = 0;
        let err = validate(&cfg).unwrap_err();
        match err { ConfigError::Invalid(msg) => assert!(msg.contains("reconcile_interval")), _ => panic!("wrong error") }
    }

    #[test]
    fn invalid_catalog_url() {
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.catalog.base_url = "not a url".into();
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn invalid_queue_settings() {
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.queue.subject = "".into();
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));

        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.queue.password = None;
        let err = validate(&cfg).unwrap_err();
        match err { ConfigError::Invalid(msg) => assert!(msg.contains("together")), _ => panic!("wrong error") }
    }

    #[test]
    fn ensure_dirs_creates_data_dir() {
        let td = tempdir().unwrap();
        let data_path = td.path().join("data");
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.agent.data_dir = data_path.to_string_lossy().to_string();
        cfg.ensure_dirs().unwrap();
        assert!(data_path.exists());
    }

    #[test]
    fn load_from_file_ok() {
        let td = tempdir().unwrap();
        let p = td.path().join("config.yaml");
        fs::write(&p, example()).unwrap();
        let cfg = load(Some(&p)).unwrap();
        assert_eq!(cfg.queue.subject, "activity_queue");
    }
}
