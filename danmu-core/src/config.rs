use config::{Config as ConfigBuilder, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Lowest accepted heartbeat period, in seconds.
pub const MIN_HEARTBEAT_INTERVAL_SECS: u64 = 5;
/// Highest accepted heartbeat period, in seconds.
pub const MAX_HEARTBEAT_INTERVAL_SECS: u64 = 30;

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub client: ClientConfig,
    pub logging: LoggingConfig,
    pub signer: SignerConfig,
    pub provider: ProviderConfig,
}

/// What to do with like events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LikePolicy {
    #[default]
    Keep,
    Drop,
}

/// Settings consumed by the connection lifecycle manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub buffer_capacity: usize,
    /// Overrides the platform's keepalive period when set.
    pub heartbeat_interval_seconds: Option<u64>,
    pub connect_timeout_seconds: u64,
    pub max_reconnect_attempts: u32,
    /// `http://host:port` CONNECT proxy.
    pub proxy_address: Option<String>,
    pub entry_grace_period_ms: u64,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub like_policy: LikePolicy,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            buffer_capacity: 1000,
            heartbeat_interval_seconds: None,
            connect_timeout_seconds: 10,
            max_reconnect_attempts: 3,
            proxy_address: None,
            entry_grace_period_ms: 2000,
            initial_backoff_ms: 1000,
            max_backoff_ms: 30_000,
            like_policy: LikePolicy::Keep,
        }
    }
}

impl ClientConfig {
    #[must_use]
    pub fn heartbeat_interval(&self, platform_default: Duration) -> Duration {
        self.heartbeat_interval_seconds
            .map_or(platform_default, Duration::from_secs)
    }

    #[must_use]
    pub const fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_seconds)
    }

    #[must_use]
    pub const fn entry_grace_period(&self) -> Duration {
        Duration::from_millis(self.entry_grace_period_ms)
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

/// External script runtime used to produce request signatures.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SignerConfig {
    pub runtime: String,
    pub script_path: Option<String>,
    pub timeout_seconds: u64,
}

impl Default for SignerConfig {
    fn default() -> Self {
        Self {
            runtime: "node".to_string(),
            script_path: None,
            timeout_seconds: 10,
        }
    }
}

/// HTTP settings for room discovery.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    pub user_agent: String,
    pub cookie: Option<String>,
    pub request_timeout_seconds: u64,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            user_agent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
                         (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36"
                .to_string(),
            cookie: None,
            request_timeout_seconds: 10,
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

        // DANMU_CLIENT__BUFFER_CAPACITY, DANMU_LOGGING__LEVEL, ...
        builder = builder.add_source(
            Environment::with_prefix("DANMU")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }

    /// Load from environment variables only
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(None)
    }

    /// Load from file path
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        Self::load(Some(path))
    }

    /// Check value ranges, collecting every violation.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();
        let client = &self.client;

        if client.buffer_capacity == 0 {
            errors.push("client.buffer_capacity must be greater than 0".to_string());
        }
        if let Some(secs) = client.heartbeat_interval_seconds {
            if !(MIN_HEARTBEAT_INTERVAL_SECS..=MAX_HEARTBEAT_INTERVAL_SECS).contains(&secs) {
                errors.push(format!(
                    "client.heartbeat_interval_seconds must be within \
                     {MIN_HEARTBEAT_INTERVAL_SECS}..={MAX_HEARTBEAT_INTERVAL_SECS}, got {secs}"
                ));
            }
        }
        if client.connect_timeout_seconds == 0 {
            errors.push("client.connect_timeout_seconds must be greater than 0".to_string());
        }
        if client.initial_backoff_ms > client.max_backoff_ms {
            errors.push("client.initial_backoff_ms must not exceed client.max_backoff_ms".to_string());
        }
        if let Some(proxy) = &client.proxy_address {
            if url::Url::parse(proxy).is_err() {
                errors.push(format!("client.proxy_address is not a valid URL: {proxy}"));
            }
        }
        if !matches!(self.logging.format.as_str(), "json" | "pretty") {
            errors.push(format!(
                "logging.format must be \"json\" or \"pretty\", got {:?}",
                self.logging.format
            ));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}
