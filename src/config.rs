use crate::idempotency::KeyCodecConfig;
use serde::Deserialize;
use std::time::Duration;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub idempotency: IdempotencySettings,
    pub store: StoreSettings,
    pub redis: RedisSettings,
    pub logging: LoggingSettings,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct IdempotencySettings {
    pub default_ttl_secs: u64,
    /// Header / query parameter name the key is read from.
    pub key_name: String,
    pub require_key: bool,
    pub allow_query_key: bool,
    pub allow_body_key: bool,
}

impl Default for IdempotencySettings {
    fn default() -> Self {
        Self {
            default_ttl_secs: 86400, // 24 hours
            key_name: "Idempotency-Key".to_string(),
            require_key: true,
            allow_query_key: true,
            allow_body_key: true,
        }
    }
}

impl IdempotencySettings {
    pub fn default_ttl(&self) -> Duration {
        Duration::from_secs(self.default_ttl_secs)
    }

    pub fn key_codec_config(&self) -> KeyCodecConfig {
        KeyCodecConfig {
            key_name: self.key_name.clone(),
            require_key: self.require_key,
            allow_query_key: self.allow_query_key,
            allow_body_key: self.allow_body_key,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Local,
    Redis,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreSettings {
    pub backend: StoreBackend,
    /// Interval of the local store's expiry sweep; 0 disables it.
    pub sweep_interval_secs: u64,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Local,
            sweep_interval_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RedisSettings {
    pub url: String,
    pub key_prefix: String,
}

impl Default for RedisSettings {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
            key_prefix: crate::store::redis::DEFAULT_KEY_PREFIX.to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    pub level: String,
    pub format: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

impl Settings {
    pub fn new() -> Result<Self, config::ConfigError> {
        let builder = config::Config::builder()
            .add_source(config::File::with_name("config/default").required(false))
            .add_source(config::File::with_name("config/local").required(false))
            .add_source(config::Environment::with_prefix("APP").separator("__"));

        builder.build()?.try_deserialize()
    }
}
