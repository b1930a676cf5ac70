//! Which fulfillers are looking at which offer.
//!
//! Each (offer, fulfiller) pair has a sliding expiry so a client that
//! vanishes without saying so stops being counted. Mutations are mirrored
//! into the local store in distributed mode, which is what
//! [`PresenceTracker::viewer_count`] reports when the shared broker fails.

use std::sync::Arc;
use std::time::Duration;

use courier_broker::Brokers;
use courier_core::{IdentityId, OfferId};
use courier_telemetry::DispatchMetrics;

use crate::note_fallback;

pub struct PresenceTracker {
    brokers: Brokers,
    ttl: Duration,
    prefix: String,
    metrics: Arc<DispatchMetrics>,
}

impl PresenceTracker {
    pub fn new(brokers: Brokers, ttl: Duration, prefix: impl Into<String>, metrics: Arc<DispatchMetrics>) -> Self {
        Self {
            brokers,
            ttl,
            prefix: prefix.into(),
            metrics,
        }
    }

    fn key(&self, offer: OfferId) -> String {
        format!("{}:viewers:order:{}", self.prefix, offer)
    }

    /// Insert or refresh `fulfiller` as a viewer of `offer`.
    pub async fn mark_viewing(&self, offer: OfferId, fulfiller: &IdentityId) {
        let key = self.key(offer);
        if self.brokers.is_distributed() {
            if let Err(e) = self.brokers.shared.touch_member(&key, fulfiller.as_str(), self.ttl).await {
                note_fallback(&self.metrics, "touch_member", &key, &e);
            }
        }
        self.brokers.local.touch(&key, fulfiller.as_str(), self.ttl);
        tracing::debug!(order_id = %offer, identity_id = %fulfiller, "Viewing order");
    }

    pub async fn stop_viewing(&self, offer: OfferId, fulfiller: &IdentityId) {
        let key = self.key(offer);
        if self.brokers.is_distributed() {
            if let Err(e) = self.brokers.shared.remove_member(&key, fulfiller.as_str()).await {
                note_fallback(&self.metrics, "remove_member", &key, &e);
            }
        }
        self.brokers.local.remove(&key, fulfiller.as_str());
        tracing::debug!(order_id = %offer, identity_id = %fulfiller, "Stopped viewing order");
    }

    /// Live viewers of `offer`: across every instance when the shared
    /// broker answers, this instance only otherwise.
    pub async fn viewer_count(&self, offer: OfferId) -> u64 {
        let key = self.key(offer);
        if self.brokers.is_distributed() {
            match self.brokers.shared.live_members(&key).await {
                Ok(n) => return n,
                Err(e) => note_fallback(&self.metrics, "live_members", &key, &e),
            }
        }
        self.brokers.local.count(&key)
    }
}
