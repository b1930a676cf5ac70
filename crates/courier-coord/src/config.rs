use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Lifetimes of dispatch coordination state.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// How long a granted offer lock lives. Never renewed.
    pub lock_ttl_secs: u64,
    /// Sliding expiry of one fulfiller viewing one offer.
    pub viewer_ttl_secs: u64,
    /// Sliding expiry of one online participant entry.
    pub roster_ttl_secs: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            lock_ttl_secs: 5,
            viewer_ttl_secs: 300,
            roster_ttl_secs: 90,
        }
    }
}

impl DispatchConfig {
    pub fn lock_ttl(&self) -> Duration {
        Duration::from_secs(self.lock_ttl_secs)
    }

    pub fn viewer_ttl(&self) -> Duration {
        Duration::from_secs(self.viewer_ttl_secs)
    }

    pub fn roster_ttl(&self) -> Duration {
        Duration::from_secs(self.roster_ttl_secs)
    }
}
