use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;

use crate::{Broker, BrokerError, BrokerMode, FanoutMessage, FanoutStream};

const BUS_CAPACITY: usize = 1024;

struct Lease {
    holder: String,
    expires_at: Instant,
}

/// Single-process broker. Pub/sub over a tokio broadcast channel, leases and
/// expiring sets in mutex-guarded maps. Never fails.
///
/// Uses `tokio::time::Instant`, so paused-clock tests can drive expiry.
pub struct MemoryBroker {
    bus: broadcast::Sender<FanoutMessage>,
    leases: Mutex<HashMap<String, Lease>>,
    sets: Mutex<HashMap<String, HashMap<String, Instant>>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        let (bus, _) = broadcast::channel(BUS_CAPACITY);
        Self {
            bus,
            leases: Mutex::new(HashMap::new()),
            sets: Mutex::new(HashMap::new()),
        }
    }

    /// Take `key` for `holder` unless someone else holds a live lease.
    pub fn try_lease(&self, key: &str, holder: &str, ttl: Duration) -> bool {
        let now = Instant::now();
        let mut leases = self.leases.lock();
        if let Some(lease) = leases.get(key) {
            if lease.expires_at > now {
                return lease.holder == holder;
            }
        }
        leases.insert(
            key.to_owned(),
            Lease {
                holder: holder.to_owned(),
                expires_at: now + ttl,
            },
        );
        true
    }

    /// Record `holder` as owner of `key` regardless of the current owner.
    /// Used to mirror grants made by an authoritative broker.
    pub fn put_lease(&self, key: &str, holder: &str, ttl: Duration) {
        self.leases.lock().insert(
            key.to_owned(),
            Lease {
                holder: holder.to_owned(),
                expires_at: Instant::now() + ttl,
            },
        );
    }

    pub fn drop_lease(&self, key: &str) {
        self.leases.lock().remove(key);
    }

    pub fn holder(&self, key: &str) -> Option<String> {
        let now = Instant::now();
        let mut leases = self.leases.lock();
        match leases.get(key) {
            Some(lease) if lease.expires_at > now => Some(lease.holder.clone()),
            Some(_) => {
                leases.remove(key);
                None
            }
            None => None,
        }
    }

    pub fn touch(&self, key: &str, member: &str, ttl: Duration) {
        self.sets
            .lock()
            .entry(key.to_owned())
            .or_default()
            .insert(member.to_owned(), Instant::now() + ttl);
    }

    pub fn remove(&self, key: &str, member: &str) {
        let mut sets = self.sets.lock();
        if let Some(set) = sets.get_mut(key) {
            set.remove(member);
            if set.is_empty() {
                sets.remove(key);
            }
        }
    }

    /// Prune expired members, then count the rest.
    pub fn count(&self, key: &str) -> u64 {
        let now = Instant::now();
        let mut sets = self.sets.lock();
        let Some(set) = sets.get_mut(key) else {
            return 0;
        };
        set.retain(|_, expires_at| *expires_at > now);
        let n = set.len() as u64;
        if n == 0 {
            sets.remove(key);
        }
        n
    }

    /// Drop every expired lease and set member. Returns how many were removed.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut removed = 0;

        let mut leases = self.leases.lock();
        let before = leases.len();
        leases.retain(|_, lease| lease.expires_at > now);
        removed += before - leases.len();
        drop(leases);

        let mut sets = self.sets.lock();
        for set in sets.values_mut() {
            let before = set.len();
            set.retain(|_, expires_at| *expires_at > now);
            removed += before - set.len();
        }
        sets.retain(|_, set| !set.is_empty());
        removed
    }

    pub fn send(&self, channel: &str, payload: Bytes) {
        // No receivers is not an error: nobody is listening yet.
        let _ = self.bus.send(FanoutMessage {
            channel: channel.to_owned(),
            payload,
        });
    }

    pub fn stream(&self, channels: &[String]) -> FanoutStream {
        let channels = channels.to_vec();
        let stream = BroadcastStream::new(self.bus.subscribe()).filter_map(move |item| match item {
            Ok(msg) if channels.contains(&msg.channel) => Some(msg),
            Ok(_) => None,
            Err(BroadcastStreamRecvError::Lagged(n)) => {
                tracing::warn!(skipped = n, "In-process fanout lagged, dropped messages");
                None
            }
        });
        Box::pin(stream)
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    fn mode(&self) -> BrokerMode {
        BrokerMode::Standalone
    }

    async fn ping(&self) -> Result<(), BrokerError> {
        Ok(())
    }

    async fn publish(&self, channel: &str, payload: Bytes) -> Result<(), BrokerError> {
        self.send(channel, payload);
        Ok(())
    }

    async fn subscribe(&self, channels: &[String]) -> Result<FanoutStream, BrokerError> {
        Ok(self.stream(channels))
    }

    async fn acquire_lease(&self, key: &str, holder: &str, ttl: Duration) -> Result<bool, BrokerError> {
        Ok(self.try_lease(key, holder, ttl))
    }

    async fn release_lease(&self, key: &str) -> Result<(), BrokerError> {
        self.drop_lease(key);
        Ok(())
    }

    async fn lease_holder(&self, key: &str) -> Result<Option<String>, BrokerError> {
        Ok(self.holder(key))
    }

    async fn touch_member(&self, key: &str, member: &str, ttl: Duration) -> Result<(), BrokerError> {
        self.touch(key, member, ttl);
        Ok(())
    }

    async fn remove_member(&self, key: &str, member: &str) -> Result<(), BrokerError> {
        self.remove(key, member);
        Ok(())
    }

    async fn live_members(&self, key: &str) -> Result<u64, BrokerError> {
        Ok(self.count(key))
    }
}
