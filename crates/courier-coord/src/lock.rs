//! Time-bounded mutual exclusion per offer.
//!
//! A lock is a lease keyed by offer id whose value is the holder's identity.
//! It is never renewed: it disappears after its TTL or on an explicit
//! [`LockCoordinator::release`].
//!
//! In distributed mode every grant the shared broker makes is also written
//! to the local lease table. If the shared broker later fails mid-call, the
//! local answer still refuses other identities for the rest of that TTL.

use std::sync::Arc;
use std::time::Duration;

use courier_broker::Brokers;
use courier_core::{IdentityId, OfferId};
use courier_telemetry::DispatchMetrics;

use crate::note_fallback;

pub struct LockCoordinator {
    brokers: Brokers,
    ttl: Duration,
    prefix: String,
    metrics: Arc<DispatchMetrics>,
}

impl LockCoordinator {
    pub fn new(brokers: Brokers, ttl: Duration, prefix: impl Into<String>, metrics: Arc<DispatchMetrics>) -> Self {
        Self {
            brokers,
            ttl,
            prefix: prefix.into(),
            metrics,
        }
    }

    fn key(&self, offer: OfferId) -> String {
        format!("{}:lock:order:{}", self.prefix, offer)
    }

    /// Try to become the only identity allowed to accept `offer`.
    ///
    /// True if the lock was free or is already held by `identity`. Asking
    /// again while holding does not extend the lock.
    pub async fn try_acquire(&self, offer: OfferId, identity: &IdentityId) -> bool {
        let key = self.key(offer);
        let holder = identity.as_str();

        let granted = if self.brokers.is_distributed() {
            match self.brokers.shared.acquire_lease(&key, holder, self.ttl).await {
                Ok(true) => {
                    self.brokers.local.put_lease(&key, holder, self.ttl);
                    true
                }
                Ok(false) => false,
                Err(e) => {
                    note_fallback(&self.metrics, "acquire_lease", &key, &e);
                    self.brokers.local.try_lease(&key, holder, self.ttl)
                }
            }
        } else {
            self.brokers.local.try_lease(&key, holder, self.ttl)
        };

        self.metrics.lock_outcome(granted);
        tracing::debug!(order_id = %offer, identity_id = %identity, granted, "Lock requested");
        granted
    }

    /// Drop the lock on `offer`, whoever holds it.
    pub async fn release(&self, offer: OfferId) {
        let key = self.key(offer);
        if self.brokers.is_distributed() {
            if let Err(e) = self.brokers.shared.release_lease(&key).await {
                note_fallback(&self.metrics, "release_lease", &key, &e);
            }
        }
        self.brokers.local.drop_lease(&key);
        self.metrics.lock_released();
        tracing::debug!(order_id = %offer, "Lock released");
    }

    /// Current holder of `offer`'s lock, if any.
    pub async fn holder(&self, offer: OfferId) -> Option<IdentityId> {
        let key = self.key(offer);
        let holder = if self.brokers.is_distributed() {
            match self.brokers.shared.lease_holder(&key).await {
                Ok(holder) => holder,
                Err(e) => {
                    note_fallback(&self.metrics, "lease_holder", &key, &e);
                    self.brokers.local.holder(&key)
                }
            }
        } else {
            self.brokers.local.holder(&key)
        };
        holder.map(IdentityId::from_raw)
    }
}
