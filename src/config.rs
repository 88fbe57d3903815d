//! Configuration loader and validator for the panel API server.
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Usernames per `DELETE ... IN (...)` statement during a prune pass.
pub const DEFAULT_PRUNE_BATCH_SIZE: usize = 200;

/// Largest request body the sync endpoint buffers. A router with 60k PPPoE
/// secrets exports a few MiB of JSON.
pub const DEFAULT_MAX_BODY_BYTES: usize = 16 * 1024 * 1024;

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
    pub server: Server,
    #[serde(default)]
    pub sync: PppSync,
}

/// App-level settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct App {
    pub data_dir: String,
}

/// HTTP listener settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Server {
    pub listen_addr: String,
    #[serde(default = "default_cors_allow")]
    pub cors_allow: Vec<String>,
    pub request_timeout_ms: u64,
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
}

/// Settings for the PPPoE reconciliation pass.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PppSync {
    /// Upper bound for one pass; `0` derives it from `server.request_timeout_ms`.
    #[serde(default)]
    pub deadline_ms: u64,
    #[serde(default = "default_prune_batch_size")]
    pub prune_batch_size: usize,
}

impl Default for PppSync {
    fn default() -> Self {
        Self {
            deadline_ms: 0,
            prune_batch_size: DEFAULT_PRUNE_BATCH_SIZE,
        }
    }
}

fn default_cors_allow() -> Vec<String> {
    vec!["*".to_string()]
}

fn default_prune_batch_size() -> usize {
    DEFAULT_PRUNE_BATCH_SIZE
}

fn default_max_body_bytes() -> usize {
    DEFAULT_MAX_BODY_BYTES
}

impl Config {
    /// Ensure required directories exist (creates `app.data_dir` if missing).
    pub fn ensure_dirs(&self) -> Result<(), std::io::Error> {
        fs::create_dir_all(self.app.resolved_data_dir())
    }

    /// Database URL, honoring a `DATABASE_URL` override from the environment.
    pub fn database_url(&self) -> String {
        std::env::var("DATABASE_URL")
            .unwrap_or_else(|_| format!("sqlite://{}/panel.db", self.app.resolved_data_dir()))
    }

    pub fn listen_addr(&self) -> Result<SocketAddr, ConfigError> {
        self.server
            .listen_addr
            .parse()
            .map_err(|_| ConfigError::Invalid("server.listen_addr must be a socket address"))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.server.request_timeout_ms)
    }

    /// Pass deadline. Without an explicit value it takes 90% of the request
    /// timeout, so a stopped pass still answers with its partial counts.
    pub fn sync_deadline(&self) -> Duration {
        if self.sync.deadline_ms > 0 {
            return Duration::from_millis(self.sync.deadline_ms);
        }
        self.request_timeout() * 9 / 10
    }
}

impl App {
    /// `data_dir` with a leading `~/` expanded against `$HOME`.
    pub fn resolved_data_dir(&self) -> String {
        match self.data_dir.strip_prefix("~/") {
            Some(rest) => match std::env::var("HOME") {
                Ok(home) => format!("{}/{}", home.trim_end_matches('/'), rest),
                Err(_) => self.data_dir.clone(),
            },
            None => self.data_dir.clone(),
        }
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

    cfg.listen_addr()?;
    if cfg.server.cors_allow.iter().any(|o| o.trim().is_empty()) {
        return Err(ConfigError::Invalid("server.cors_allow entries must be non-empty"));
    }
    if cfg.server.request_timeout_ms == 0 {
        return Err(ConfigError::Invalid("server.request_timeout_ms must be > 0"));
    }
    if cfg.server.max_body_bytes == 0 {
        return Err(ConfigError::Invalid("server.max_body_bytes must be > 0"));
    }

    if cfg.sync.deadline_ms >= cfg.server.request_timeout_ms {
        return Err(ConfigError::Invalid(
            "sync.deadline_ms must be below server.request_timeout_ms",
        ));
    }

    if cfg.sync.prune_batch_size == 0 {
        return Err(ConfigError::Invalid("sync.prune_batch_size must be > 0"));
    }

    Ok(())
}

/// Returns a complete sample configuration.
pub fn example() -> &'static str {
    r#"app:
  data_dir: "./data"

server:
  listen_addr: "127.0.0.1:8080"
  cors_allow:
    - "*"
  request_timeout_ms: 30000
  max_body_bytes: 16777216

sync:
  deadline_ms: 20000
  prune_batch_size: 200
"#
}
