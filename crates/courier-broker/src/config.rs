use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Broker connection settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// `redis://host:port/db`. `None` runs standalone.
    pub redis_url: Option<String>,
    /// Prefix for every channel and key this service writes.
    pub channel_prefix: String,
    /// Upper bound on any single broker call.
    pub op_timeout_ms: u64,
    /// Upper bound on the startup connectivity probe.
    pub connect_timeout_ms: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            redis_url: None,
            channel_prefix: "courier".into(),
            op_timeout_ms: 500,
            connect_timeout_ms: 2_000,
        }
    }
}

impl BrokerConfig {
    pub fn op_timeout(&self) -> Duration {
        Duration::from_millis(self.op_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}
