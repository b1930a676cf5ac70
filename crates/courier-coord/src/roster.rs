//! Online participants per role, for the stats endpoint.
//!
//! Each connected identity is a member of an expiring set per role. Live
//! connections refresh their entry on every heartbeat; a crashed instance's
//! entries age out on their own.

use std::sync::Arc;
use std::time::Duration;

use courier_broker::Brokers;
use courier_core::{Identity, Role};
use courier_telemetry::DispatchMetrics;

use crate::note_fallback;

pub struct Roster {
    brokers: Brokers,
    ttl: Duration,
    prefix: String,
    metrics: Arc<DispatchMetrics>,
}

impl Roster {
    pub fn new(brokers: Brokers, ttl: Duration, prefix: impl Into<String>, metrics: Arc<DispatchMetrics>) -> Self {
        Self {
            brokers,
            ttl,
            prefix: prefix.into(),
            metrics,
        }
    }

    fn key(&self, role: Role) -> String {
        format!("{}:online:{}", self.prefix, role)
    }

    /// Mark `identity` online, or keep it online for another TTL.
    pub async fn refresh(&self, identity: &Identity) {
        if !self.brokers.is_distributed() {
            return;
        }
        let key = self.key(identity.role);
        if let Err(e) = self.brokers.shared.touch_member(&key, identity.id.as_str(), self.ttl).await {
            note_fallback(&self.metrics, "touch_member", &key, &e);
        }
    }

    /// Remove `identity` once its last local connection is gone.
    pub async fn leave(&self, identity: &Identity) {
        if !self.brokers.is_distributed() {
            return;
        }
        let key = self.key(identity.role);
        if let Err(e) = self.brokers.shared.remove_member(&key, identity.id.as_str()).await {
            note_fallback(&self.metrics, "remove_member", &key, &e);
        }
    }

    /// Cross-instance online count for `role`. `None` when standalone or the
    /// broker does not answer; callers then report their local count.
    pub async fn count(&self, role: Role) -> Option<u64> {
        if !self.brokers.is_distributed() {
            return None;
        }
        let key = self.key(role);
        match self.brokers.shared.live_members(&key).await {
            Ok(n) => Some(n),
            Err(e) => {
                note_fallback(&self.metrics, "live_members", &key, &e);
                None
            }
        }
    }
}
