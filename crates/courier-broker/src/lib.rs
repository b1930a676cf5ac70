//! Cross-instance fanout transport and shared key/value primitives.
//!
//! Two backends sit behind [`Broker`]: [`RedisBroker`] when a broker URL is
//! configured and reachable at startup, [`MemoryBroker`] otherwise. The
//! in-memory broker doubles as the per-process fallback store used when the
//! distributed backend fails mid-call.

mod config;
mod distributed;
mod errors;
mod memory;
pub mod testing;

pub use config::BrokerConfig;
pub use distributed::RedisBroker;
pub use errors::BrokerError;
pub use memory::MemoryBroker;

use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use serde::Serialize;

/// Whether shared state is visible to other instances.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BrokerMode {
    Distributed,
    Standalone,
}

impl std::fmt::Display for BrokerMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Distributed => f.write_str("distributed"),
            Self::Standalone => f.write_str("standalone"),
        }
    }
}

/// One published message as seen by a subscriber.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FanoutMessage {
    pub channel: String,
    pub payload: Bytes,
}

pub type FanoutStream = Pin<Box<dyn Stream<Item = FanoutMessage> + Send>>;

/// Publish/subscribe plus the atomic key/value operations shared state is
/// built from. Implementations must make every call bounded in time.
#[async_trait]
pub trait Broker: Send + Sync {
    fn mode(&self) -> BrokerMode;

    /// Liveness probe.
    async fn ping(&self) -> Result<(), BrokerError>;

    /// Best-effort publish. No delivery acknowledgement.
    async fn publish(&self, channel: &str, payload: Bytes) -> Result<(), BrokerError>;

    /// Subscribe to `channels`. The stream ends if the transport drops.
    async fn subscribe(&self, channels: &[String]) -> Result<FanoutStream, BrokerError>;

    /// Atomically take `key` for `holder` for `ttl`.
    ///
    /// Returns true if the key was free, or is already held by the same
    /// `holder` (the existing expiry is left untouched). Returns false if a
    /// different holder owns a live lease.
    async fn acquire_lease(&self, key: &str, holder: &str, ttl: Duration) -> Result<bool, BrokerError>;

    async fn release_lease(&self, key: &str) -> Result<(), BrokerError>;

    async fn lease_holder(&self, key: &str) -> Result<Option<String>, BrokerError>;

    /// Insert or refresh `member` in the expiring set at `key`.
    async fn touch_member(&self, key: &str, member: &str, ttl: Duration) -> Result<(), BrokerError>;

    async fn remove_member(&self, key: &str, member: &str) -> Result<(), BrokerError>;

    /// Number of unexpired members in the set at `key`.
    async fn live_members(&self, key: &str) -> Result<u64, BrokerError>;
}

/// The broker pair every coordinator is built from.
///
/// `shared` is authoritative; `local` is this process's own store, used on
/// its own in standalone mode and as the fallback when `shared` errors.
/// In standalone mode both point at the same [`MemoryBroker`].
#[derive(Clone)]
pub struct Brokers {
    pub shared: Arc<dyn Broker>,
    pub local: Arc<MemoryBroker>,
}

impl Brokers {
    pub fn standalone() -> Self {
        let local = Arc::new(MemoryBroker::new());
        Self {
            shared: local.clone(),
            local,
        }
    }

    pub fn with_shared(shared: Arc<dyn Broker>) -> Self {
        Self {
            shared,
            local: Arc::new(MemoryBroker::new()),
        }
    }

    pub fn mode(&self) -> BrokerMode {
        self.shared.mode()
    }

    pub fn is_distributed(&self) -> bool {
        self.mode() == BrokerMode::Distributed
    }
}

/// Probe the configured broker once. Any failure leaves the process in
/// standalone mode for its whole lifetime.
pub async fn connect(config: &BrokerConfig) -> Brokers {
    let Some(url) = config.redis_url.as_deref() else {
        tracing::info!(mode = %BrokerMode::Standalone, "No broker configured");
        return Brokers::standalone();
    };

    match RedisBroker::connect(url, config).await {
        Ok(broker) => {
            tracing::info!(mode = %BrokerMode::Distributed, "Broker connected");
            Brokers::with_shared(Arc::new(broker))
        }
        Err(e) => {
            tracing::warn!(
                error = %e,
                mode = %BrokerMode::Standalone,
                "Broker unreachable at startup, continuing standalone"
            );
            Brokers::standalone()
        }
    }
}
