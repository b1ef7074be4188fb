//! Configuration
//!
//! Loaded from a TOML file when one is given, otherwise from defaults.
//! Environment variables prefixed `CHAT_GATEWAY_` override either source.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::connection::Keepalive;

/// Main configuration structure
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub connection: ConnectionConfig,

    #[serde(default)]
    pub credentials: CredentialConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Listener and upgrade settings
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_addr")]
    pub addr: String,

    /// Exact `Origin` header values allowed to upgrade
    #[serde(default = "default_allowed_origins")]
    pub allowed_origins: Vec<String>,

    /// Query parameter carrying the credential token
    #[serde(default = "default_token_param")]
    pub token_param: String,
}

fn default_addr() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_allowed_origins() -> Vec<String> {
    vec!["http://localhost:8888".to_string()]
}

fn default_token_param() -> String {
    "otp".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: default_addr(),
            allowed_origins: default_allowed_origins(),
            token_param: default_token_param(),
        }
    }
}

/// Per-connection limits and keepalive
#[derive(Debug, Clone, Deserialize)]
pub struct ConnectionConfig {
    /// Read deadline; pings go out every 9/10 of this
    #[serde(default = "default_pong_wait")]
    pub pong_wait_ms: u64,

    /// Largest inbound message or frame, in bytes
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,

    /// Events buffered per connection before new ones are dropped
    #[serde(default = "default_outbound_capacity")]
    pub outbound_capacity: usize,
}

fn default_pong_wait() -> u64 {
    10_000 // 10 seconds
}

fn default_max_message_size() -> usize {
    512
}

fn default_outbound_capacity() -> usize {
    32
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            pong_wait_ms: default_pong_wait(),
            max_message_size: default_max_message_size(),
            outbound_capacity: default_outbound_capacity(),
        }
    }
}

impl ConnectionConfig {
    pub fn keepalive(&self) -> Keepalive {
        Keepalive::from_pong_wait(Duration::from_millis(self.pong_wait_ms))
    }
}

/// One-time credential lifetime
#[derive(Debug, Clone, Deserialize)]
pub struct CredentialConfig {
    #[serde(default = "default_retention")]
    pub retention_ms: u64,

    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_ms: u64,
}

fn default_retention() -> u64 {
    5_000 // 5 seconds
}

fn default_sweep_interval() -> u64 {
    400
}

impl Default for CredentialConfig {
    fn default() -> Self {
        Self {
            retention_ms: default_retention(),
            sweep_interval_ms: default_sweep_interval(),
        }
    }
}

impl CredentialConfig {
    pub fn retention(&self) -> Duration {
        Duration::from_millis(self.retention_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}

/// Storage backend settings
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,
}

fn default_database_path() -> PathBuf {
    PathBuf::from("chat_gateway.db")
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    /// `pretty` or `json`
    #[serde(default = "default_log_format")]
    pub format: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl Config {
    /// Load configuration from a file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            error: e.to_string(),
        })?;

        Self::parse(&content).map_err(|e| match e {
            ConfigError::Parse { error, .. } => ConfigError::Parse {
                path: path.to_path_buf(),
                error,
            },
            other => other,
        })
    }

    /// Parse configuration from TOML text
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::Parse {
            path: PathBuf::new(),
            error: e.to_string(),
        })
    }

    /// Apply `CHAT_GATEWAY_*` environment overrides
    pub fn with_env_overrides(self) -> Result<Self, ConfigError> {
        self.with_overrides(|key| std::env::var(key).ok())
    }

    fn with_overrides(
        mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        if let Some(addr) = lookup("CHAT_GATEWAY_ADDR") {
            self.server.addr = addr;
        }
        if let Some(origins) = lookup("CHAT_GATEWAY_ALLOWED_ORIGINS") {
            self.server.allowed_origins = origins
                .split(',')
                .map(str::trim)
                .filter(|o| !o.is_empty())
                .map(String::from)
                .collect();
        }
        if let Some(path) = lookup("CHAT_GATEWAY_DATABASE") {
            self.storage.database_path = PathBuf::from(path);
        }
        if let Some(level) = lookup("CHAT_GATEWAY_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Some(format) = lookup("CHAT_GATEWAY_LOG_FORMAT") {
            self.logging.format = format;
        }
        if let Some(value) = lookup("CHAT_GATEWAY_PONG_WAIT_MS") {
            self.connection.pong_wait_ms = parse_number("CHAT_GATEWAY_PONG_WAIT_MS", &value)?;
        }
        if let Some(value) = lookup("CHAT_GATEWAY_RETENTION_MS") {
            self.credentials.retention_ms = parse_number("CHAT_GATEWAY_RETENTION_MS", &value)?;
        }
        Ok(self)
    }

    /// Reject settings the gateway cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.allowed_origins.is_empty() {
            return Err(ConfigError::Invalid(
                "server.allowed_origins must list at least one origin".to_string(),
            ));
        }
        if self.server.token_param.is_empty() {
            return Err(ConfigError::Invalid("server.token_param is empty".to_string()));
        }
        if self.connection.pong_wait_ms == 0 {
            return Err(ConfigError::Invalid("connection.pong_wait_ms must be > 0".to_string()));
        }
        if self.connection.outbound_capacity == 0 {
            return Err(ConfigError::Invalid(
                "connection.outbound_capacity must be > 0".to_string(),
            ));
        }
        if self.credentials.sweep_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "credentials.sweep_interval_ms must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value
        .parse()
        .map_err(|_| ConfigError::Invalid(format!("{} is not a number: {:?}", key, value)))
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {error}")]
    Io { path: PathBuf, error: String },

    #[error("Failed to parse config file {path}: {error}")]
    Parse { path: PathBuf, error: String },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.server.addr, "127.0.0.1:8080");
        assert_eq!(config.server.token_param, "otp");
        assert_eq!(config.connection.keepalive().ping_interval, Duration::from_secs(9));
        assert_eq!(config.credentials.retention(), Duration::from_secs(5));
        assert_eq!(config.credentials.sweep_interval(), Duration::from_millis(400));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_partial_file() {
        let config = Config::parse(
            r#"
            [server]
            addr = "0.0.0.0:9000"
            allowed_origins = ["https://chat.example"]

            [connection]
            outbound_capacity = 4
            "#,
        )
        .unwrap();

        assert_eq!(config.server.addr, "0.0.0.0:9000");
        assert_eq!(config.server.allowed_origins, vec!["https://chat.example"]);
        assert_eq!(config.server.token_param, "otp");
        assert_eq!(config.connection.outbound_capacity, 4);
        assert_eq!(config.connection.max_message_size, 512);
    }

    #[test]
    fn test_parse_error() {
        assert!(matches!(
            Config::parse("[server]\naddr = 5"),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("CHAT_GATEWAY_ADDR", "0.0.0.0:1234"),
            ("CHAT_GATEWAY_ALLOWED_ORIGINS", "https://a.example, https://b.example"),
            ("CHAT_GATEWAY_PONG_WAIT_MS", "2000"),
        ]
        .into_iter()
        .collect();

        let config = Config::default()
            .with_overrides(|key| env.get(key).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.server.addr, "0.0.0.0:1234");
        assert_eq!(
            config.server.allowed_origins,
            vec!["https://a.example", "https://b.example"]
        );
        assert_eq!(config.connection.pong_wait_ms, 2000);
    }

    #[test]
    fn test_env_override_rejects_garbage_number() {
        let result = Config::default().with_overrides(|key| {
            (key == "CHAT_GATEWAY_RETENTION_MS").then(|| "soon".to_string())
        });
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_validate_rejects_empty_allow_list() {
        let mut config = Config::default();
        config.server.allowed_origins.clear();
        assert!(config.validate().is_err());
    }
}
