use config::{Config as ConfigBuilder, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub logging: LoggingConfig,
    pub hub: HubConfig,
    pub upstream: UpstreamConfig,
    pub bus: BusConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub http_port: u16,
    /// Directory served at `/` for the demo client, disabled when unset
    pub static_dir: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            http_port: 5000,
            static_dir: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String, // "json" or "pretty"
    pub file_path: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file_path: None,
        }
    }
}

/// Broadcast hub tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    /// Outbound queue depth per session before deliveries are dropped
    pub session_buffer: usize,
    /// How long a snapshot nobody observes is kept around
    pub orphan_ttl_seconds: u64,
    pub sweep_interval_seconds: u64,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            session_buffer: 64,
            orphan_ttl_seconds: 60,
            sweep_interval_seconds: 15,
        }
    }
}

impl HubConfig {
    #[must_use]
    pub const fn orphan_ttl(&self) -> Duration {
        Duration::from_secs(self.orphan_ttl_seconds)
    }

    #[must_use]
    pub const fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_seconds)
    }
}

/// Which transport carries upstream requests and updates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpstreamMode {
    /// Requests go to the fetcher over HTTP, updates arrive on `POST /broadcast`
    #[default]
    Http,
    /// Requests and updates travel over Redis pub/sub channels
    Redis,
}

impl std::fmt::Display for UpstreamMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Http => write!(f, "http"),
            Self::Redis => write!(f, "redis"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    pub mode: UpstreamMode,
    /// Base URL the resource id is appended to, e.g. `http://fetcher/fetchlist/new/`
    pub fetcher_url: String,
    /// Credential presented to the fetcher
    pub fetcher_key: String,
    /// Credential producers must present on `POST /broadcast`
    pub push_key: String,
    pub request_queue_capacity: usize,
    pub update_queue_capacity: usize,
    /// Upstream requests allowed in flight at once; the queue backs up beyond it
    pub max_inflight_requests: usize,
    pub request_timeout_seconds: u64,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            mode: UpstreamMode::Http,
            fetcher_url: "http://localhost:5001/fetchlist/new/".to_string(),
            fetcher_key: String::new(),
            push_key: String::new(),
            request_queue_capacity: 1024,
            update_queue_capacity: 1024,
            max_inflight_requests: 64,
            request_timeout_seconds: 5,
        }
    }
}

impl UpstreamConfig {
    #[must_use]
    pub const fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_seconds)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    pub url: String,
    pub request_channel: String,
    pub update_channel: String,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            url: "redis://localhost:6379".to_string(),
            request_channel: "feedrelay:resource:requested".to_string(),
            update_channel: "feedrelay:resource:updated".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from multiple sources with priority:
    /// 1. Environment variables (highest priority)
    /// 2. Config file (if provided)
    /// 3. Defaults (lowest priority)
    pub fn load(config_file: Option<&str>) -> Result<Self, ConfigError> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_file {
            if Path::new(path).exists() {
                builder = builder.add_source(File::with_name(path));
            }
        }

        // FEEDRELAY_SERVER__HTTP_PORT, FEEDRELAY_UPSTREAM__MODE, ...
        builder = builder.add_source(
            Environment::with_prefix("FEEDRELAY")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }

    /// Load from environment variables only (for Docker/K8s)
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(None)
    }

    /// Load from file path
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        Self::load(Some(path))
    }

    /// Get HTTP address
    #[must_use]
    pub fn http_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.http_port)
    }

    /// Check the settings the active upstream mode depends on.
    ///
    /// Returns every problem found rather than stopping at the first one.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.server.http_port == 0 {
            errors.push("server.http_port must be greater than 0".to_string());
        }
        if !matches!(self.logging.format.as_str(), "json" | "pretty") {
            errors.push(format!(
                "logging.format must be \"json\" or \"pretty\", got {:?}",
                self.logging.format
            ));
        }
        if self.hub.session_buffer == 0 {
            errors.push("hub.session_buffer must be greater than 0".to_string());
        }
        if self.hub.sweep_interval_seconds == 0 {
            errors.push("hub.sweep_interval_seconds must be greater than 0".to_string());
        }
        if self.upstream.request_queue_capacity == 0 || self.upstream.update_queue_capacity == 0 {
            errors.push("upstream queue capacities must be greater than 0".to_string());
        }
        if self.upstream.max_inflight_requests == 0 {
            errors.push("upstream.max_inflight_requests must be greater than 0".to_string());
        }

        match self.upstream.mode {
            UpstreamMode::Http => {
                if self.upstream.push_key.is_empty() {
                    errors.push("upstream.push_key is required in http mode".to_string());
                }
                if self.upstream.fetcher_url.is_empty() {
                    errors.push("upstream.fetcher_url is required in http mode".to_string());
                }
            }
            UpstreamMode::Redis => {
                if self.bus.url.is_empty() {
                    errors.push("bus.url is required in redis mode".to_string());
                }
                if self.bus.request_channel.is_empty() || self.bus.update_channel.is_empty() {
                    errors.push("bus channels must not be empty".to_string());
                }
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn http_config() -> Config {
        let mut config = Config::default();
        config.upstream.push_key = "bm9kZS1mZXRjaGVy".to_string();
        config
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();

        assert_eq!(config.upstream.mode, UpstreamMode::Http);
        assert!(config.server.http_port > 0);
        assert!(config.hub.session_buffer > 0);
        assert!(config.server.static_dir.is_none());
    }

    #[test]
    fn test_http_address() {
        let mut config = Config::default();
        config.server.host = "127.0.0.1".to_string();
        config.server.http_port = 8080;

        assert_eq!(config.http_address(), "127.0.0.1:8080");
    }

    #[test]
    fn test_http_mode_requires_push_key() {
        let errors = Config::default().validate().unwrap_err();
        assert!(errors.iter().any(|e| e.contains("push_key")));

        assert!(http_config().validate().is_ok());
    }

    #[test]
    fn test_inflight_cap_must_be_positive() {
        let mut config = http_config();
        config.upstream.max_inflight_requests = 0;

        let errors = config.validate().unwrap_err();
        assert!(errors.iter().any(|e| e.contains("max_inflight_requests")));
    }

    #[test]
    fn test_redis_mode_ignores_push_key() {
        let mut config = Config::default();
        config.upstream.mode = UpstreamMode::Redis;

        assert!(config.validate().is_ok());

        config.bus.url.clear();
        let errors = config.validate().unwrap_err();
        assert_eq!(errors.len(), 1);
    }

    #[test]
    fn test_validate_collects_all_errors() {
        let mut config = http_config();
        config.hub.session_buffer = 0;
        config.logging.format = "xml".to_string();

        let errors = config.validate().unwrap_err();
        assert_eq!(errors.len(), 2);
    }

    #[test]
    fn test_mode_deserializes_lowercase() {
        let mode: UpstreamMode = serde_json::from_str("\"redis\"").unwrap();
        assert_eq!(mode, UpstreamMode::Redis);
        assert_eq!(mode.to_string(), "redis");
    }
}
