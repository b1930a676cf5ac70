//! Service configuration with layered loading.
//!
//! Loading flow:
//! 1. Start with compiled [`CourierConfig::default()`]
//! 2. If a config file is given and exists, deep-merge its values over defaults
//! 3. Apply `COURIER_*` environment overrides (highest priority)
//!
//! Command-line flags are applied by the binary on top of the result.

use std::path::Path;

use courier_broker::BrokerConfig;
use courier_coord::DispatchConfig;
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

/// Errors that can occur when loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid config value: {0}")]
    InvalidValue(String),
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Per-connection outbound queue depth. Frames beyond it are dropped.
    pub max_send_queue: usize,
    /// Interval between transport-level pings, and between roster refreshes.
    pub heartbeat_interval_secs: u64,
    /// A connection that sends nothing for this long is closed.
    pub idle_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 8000,
            max_send_queue: 256,
            heartbeat_interval_secs: 30,
            idle_timeout_secs: 90,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// HMAC secret for bearer tokens. Without one, every token is refused.
    #[serde(skip_serializing)]
    pub jwt_secret: Option<SecretString>,
    pub jwt_algorithm: String,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            jwt_secret: None,
            jwt_algorithm: "HS256".into(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CourierConfig {
    pub server: ServerConfig,
    pub broker: BrokerConfig,
    pub dispatch: DispatchConfig,
    pub auth: AuthConfig,
    /// Shared secret required on `/internal/*` in the `x-internal-token` header.
    pub internal_token: Option<String>,
    pub log_level: String,
}

impl Default for CourierConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            broker: BrokerConfig::default(),
            dispatch: DispatchConfig::default(),
            auth: AuthConfig::default(),
            internal_token: None,
            log_level: "info".into(),
        }
    }
}

impl CourierConfig {
    /// Reject values that parse but cannot work.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.max_send_queue == 0 {
            return Err(ConfigError::InvalidValue("server.max_send_queue must be positive".into()));
        }
        if self.server.heartbeat_interval_secs == 0 {
            return Err(ConfigError::InvalidValue(
                "server.heartbeat_interval_secs must be positive".into(),
            ));
        }
        if self.server.idle_timeout_secs <= self.server.heartbeat_interval_secs {
            return Err(ConfigError::InvalidValue(
                "server.idle_timeout_secs must exceed the heartbeat interval".into(),
            ));
        }
        if self.dispatch.lock_ttl_secs == 0 || self.dispatch.viewer_ttl_secs == 0 {
            return Err(ConfigError::InvalidValue("dispatch TTLs must be positive".into()));
        }
        // Roster entries are refreshed once per heartbeat and must outlive the gap.
        if self.dispatch.roster_ttl_secs <= self.server.heartbeat_interval_secs {
            return Err(ConfigError::InvalidValue(
                "dispatch.roster_ttl_secs must exceed the heartbeat interval".into(),
            ));
        }
        if self.broker.op_timeout_ms == 0 || self.broker.connect_timeout_ms == 0 {
            return Err(ConfigError::InvalidValue("broker timeouts must be positive".into()));
        }
        if self.auth.jwt_algorithm != "HS256" {
            return Err(ConfigError::InvalidValue(format!(
                "unsupported auth.jwt_algorithm `{}`",
                self.auth.jwt_algorithm
            )));
        }
        Ok(())
    }
}

/// Load configuration from an optional file, then apply environment overrides.
///
/// A missing file yields defaults. Invalid JSON is an error.
pub fn load_config(path: Option<&Path>) -> Result<CourierConfig, ConfigError> {
    let defaults = serde_json::to_value(CourierConfig::default())?;

    let merged = match path {
        Some(path) if path.exists() => {
            debug!(?path, "loading config from file");
            let content = std::fs::read_to_string(path)?;
            let file: Value = serde_json::from_str(&content)?;
            deep_merge(defaults, file)
        }
        Some(path) => {
            debug!(?path, "config file not found, using defaults");
            defaults
        }
        None => defaults,
    };

    let mut config: CourierConfig = serde_json::from_value(merged)?;
    apply_env_overrides(&mut config, |name| std::env::var(name).ok());
    config.validate()?;
    Ok(config)
}

/// Recursive merge of two JSON values.
///
/// Objects merge per key, arrays and primitives are replaced by `source`,
/// and nulls in `source` are skipped.
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = match target_map.remove(&key) {
                    Some(target_val) => deep_merge(target_val, source_val),
                    None => source_val,
                };
                let _ = target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Apply environment overrides read through `lookup`.
///
/// Integers must parse and fall in range; invalid values are ignored with a
/// warning and the file/default value stays.
pub fn apply_env_overrides<F>(config: &mut CourierConfig, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    let env = EnvReader { lookup };

    if let Some(v) = env.string("COURIER_HOST") {
        config.server.host = v;
    }
    if let Some(v) = env.u16("COURIER_PORT", 1, 65535) {
        config.server.port = v;
    }
    if let Some(v) = env.string("COURIER_REDIS_URL").or_else(|| env.string("REDIS_URL")) {
        config.broker.redis_url = Some(v);
    }
    if let Some(v) = env.u64("COURIER_BROKER_TIMEOUT_MS", 10, 60_000) {
        config.broker.op_timeout_ms = v;
    }
    if let Some(v) = env.string("COURIER_JWT_SECRET").or_else(|| env.string("SECRET_KEY")) {
        config.auth.jwt_secret = Some(SecretString::from(v));
    }
    if let Some(v) = env.u64("COURIER_LOCK_TTL_SECS", 1, 3_600) {
        config.dispatch.lock_ttl_secs = v;
    }
    if let Some(v) = env.u64("COURIER_VIEWER_TTL_SECS", 1, 86_400) {
        config.dispatch.viewer_ttl_secs = v;
    }
    if let Some(v) = env.string("COURIER_INTERNAL_TOKEN") {
        config.internal_token = Some(v);
    }
    if let Some(v) = env.string("COURIER_LOG_LEVEL") {
        config.log_level = v;
    }
}

/// Parse a string as a `u16` within a range.
pub fn parse_u16_range(val: &str, min: u16, max: u16) -> Option<u16> {
    let n: u16 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

/// Parse a string as a `u64` within a range.
pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

struct EnvReader<F> {
    lookup: F,
}

impl<F: Fn(&str) -> Option<String>> EnvReader<F> {
    fn string(&self, name: &str) -> Option<String> {
        (self.lookup)(name).filter(|v| !v.is_empty())
    }

    fn u16(&self, name: &str, min: u16, max: u16) -> Option<u16> {
        let val = (self.lookup)(name)?;
        let result = parse_u16_range(&val, min, max);
        if result.is_none() {
            tracing::warn!(key = name, value = %val, "invalid u16 env var, ignoring");
        }
        result
    }

    fn u64(&self, name: &str, min: u64, max: u64) -> Option<u64> {
        let val = (self.lookup)(name)?;
        let result = parse_u64_range(&val, min, max);
        if result.is_none() {
            tracing::warn!(key = name, value = %val, "invalid u64 env var, ignoring");
        }
        result
    }
}
