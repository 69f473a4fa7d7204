//! Configuration for tether

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::connection::{ClientConfig, RetryBudget, DEFAULT_RECONNECT_SCHEDULE_SECS};
use crate::error::ClientError;

/// Default config file location
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("tether")
        .join("config.toml")
}

/// Configuration file contents
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Endpoint prefix, e.g. `ws://localhost:5010/`
    #[serde(default = "default_endpoint")]
    pub endpoint: String,

    /// Platform identifier presented at login
    #[serde(default = "default_platform")]
    pub platform: String,

    /// Credential token (unset = current unix millis at startup)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,

    /// Default request timeout in milliseconds
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// Send retries while the connection is not ready (-1 = no queueing)
    #[serde(default = "default_retry_budget")]
    pub retry_budget: i32,

    /// Delay between send retries in milliseconds
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,

    /// How long login waits for the connection to become ready again
    #[serde(default = "default_login_timeout_ms")]
    pub login_timeout_ms: u64,

    /// Reconnect delays in seconds; the last one repeats
    #[serde(default = "default_reconnect_schedule_secs")]
    pub reconnect_schedule_secs: Vec<u64>,
}

fn default_endpoint() -> String {
    "ws://localhost:5010/".to_string()
}

fn default_platform() -> String {
    "guest".to_string()
}

fn default_request_timeout_ms() -> u64 {
    5000
}

fn default_retry_budget() -> i32 {
    4
}

fn default_retry_delay_ms() -> u64 {
    1000
}

fn default_login_timeout_ms() -> u64 {
    5000
}

fn default_reconnect_schedule_secs() -> Vec<u64> {
    DEFAULT_RECONNECT_SCHEDULE_SECS.to_vec()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            platform: default_platform(),
            token: None,
            request_timeout_ms: default_request_timeout_ms(),
            retry_budget: default_retry_budget(),
            retry_delay_ms: default_retry_delay_ms(),
            login_timeout_ms: default_login_timeout_ms(),
            reconnect_schedule_secs: default_reconnect_schedule_secs(),
        }
    }
}

impl Config {
    /// Load config from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ClientError> {
        let content = std::fs::read_to_string(path)?;
        let config: Config =
            toml::from_str(&content).map_err(|e| ClientError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Save config to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), ClientError> {
        let content =
            toml::to_string_pretty(self).map_err(|e| ClientError::Config(e.to_string()))?;
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ClientError> {
        if !(self.endpoint.starts_with("ws://") || self.endpoint.starts_with("wss://")) {
            return Err(ClientError::Config(format!(
                "endpoint must be a ws:// or wss:// URL, got {}",
                self.endpoint
            )));
        }
        if self.platform.is_empty() {
            return Err(ClientError::Config("platform must not be empty".into()));
        }
        Ok(())
    }

    /// Runtime client configuration
    pub fn client_config(&self) -> ClientConfig {
        ClientConfig {
            endpoint: self.endpoint.clone(),
            platform: self.platform.clone(),
            token: self.token.clone(),
            request_timeout: Duration::from_millis(self.request_timeout_ms),
            retry_budget: RetryBudget::from(self.retry_budget),
            retry_delay: Duration::from_millis(self.retry_delay_ms),
            login_timeout: Duration::from_millis(self.login_timeout_ms),
            reconnect_schedule: self
                .reconnect_schedule_secs
                .iter()
                .map(|s| Duration::from_secs(*s))
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_file_uses_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_partial_file() {
        let config: Config = toml::from_str(
            r#"
            endpoint = "wss://example.com/socket/"
            platform = "dingtaxi"
            token = "abc"
            retry_budget = -1
            "#,
        )
        .unwrap();

        let client = config.client_config();
        assert_eq!(client.endpoint, "wss://example.com/socket/");
        assert_eq!(client.token.as_deref(), Some("abc"));
        assert_eq!(client.retry_budget, RetryBudget::Bypass);
        assert_eq!(client.request_timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let mut config = Config::default();
        config.platform = "alice".to_string();
        config.reconnect_schedule_secs = vec![1, 5];
        config.save(&path).unwrap();

        assert_eq!(Config::load(&path).unwrap(), config);
    }

    #[test]
    fn test_validate_rejects_http_endpoint() {
        let config = Config {
            endpoint: "http://localhost:5010/".to_string(),
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(ClientError::Config(_))));
    }
}
