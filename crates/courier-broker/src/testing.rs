//! Broker double with switchable failures, for exercising fallback paths
//! without a network.

use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use crate::{Broker, BrokerError, BrokerMode, FanoutStream, MemoryBroker};

/// How the next calls behave.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum Failure {
    /// Calls go through.
    Healthy = 0,
    /// Calls fail without side effects.
    Down = 1,
    /// Calls take effect, then report failure (lost acknowledgement).
    AckLost = 2,
}

/// A [`MemoryBroker`] that reports itself as distributed and can be told
/// to fail. Share one instance between several coordinators to model
/// several instances talking to one broker.
pub struct FlakyBroker {
    inner: MemoryBroker,
    failure: AtomicU8,
}

impl FlakyBroker {
    pub fn new() -> Self {
        Self {
            inner: MemoryBroker::new(),
            failure: AtomicU8::new(Failure::Healthy as u8),
        }
    }

    pub fn set_failure(&self, failure: Failure) {
        self.failure.store(failure as u8, Ordering::SeqCst);
    }

    pub fn failure(&self) -> Failure {
        match self.failure.load(Ordering::SeqCst) {
            1 => Failure::Down,
            2 => Failure::AckLost,
            _ => Failure::Healthy,
        }
    }

    /// Underlying store, for assertions.
    pub fn inner(&self) -> &MemoryBroker {
        &self.inner
    }

    fn before(&self) -> Result<(), BrokerError> {
        match self.failure() {
            Failure::Down => Err(BrokerError::Unavailable("injected outage".into())),
            Failure::Healthy | Failure::AckLost => Ok(()),
        }
    }

    fn after<T>(&self, value: T) -> Result<T, BrokerError> {
        match self.failure() {
            Failure::AckLost => Err(BrokerError::Timeout {
                op: "injected",
                after: Duration::ZERO,
            }),
            Failure::Healthy | Failure::Down => Ok(value),
        }
    }
}

impl Default for FlakyBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Broker for FlakyBroker {
    fn mode(&self) -> BrokerMode {
        BrokerMode::Distributed
    }

    async fn ping(&self) -> Result<(), BrokerError> {
        self.before()?;
        self.after(())
    }

    async fn publish(&self, channel: &str, payload: Bytes) -> Result<(), BrokerError> {
        self.before()?;
        self.inner.send(channel, payload);
        self.after(())
    }

    async fn subscribe(&self, channels: &[String]) -> Result<FanoutStream, BrokerError> {
        self.before()?;
        let stream = self.inner.stream(channels);
        self.after(stream)
    }

    async fn acquire_lease(&self, key: &str, holder: &str, ttl: Duration) -> Result<bool, BrokerError> {
        self.before()?;
        let granted = self.inner.try_lease(key, holder, ttl);
        self.after(granted)
    }

    async fn release_lease(&self, key: &str) -> Result<(), BrokerError> {
        self.before()?;
        self.inner.drop_lease(key);
        self.after(())
    }

    async fn lease_holder(&self, key: &str) -> Result<Option<String>, BrokerError> {
        self.before()?;
        let holder = self.inner.holder(key);
        self.after(holder)
    }

    async fn touch_member(&self, key: &str, member: &str, ttl: Duration) -> Result<(), BrokerError> {
        self.before()?;
        self.inner.touch(key, member, ttl);
        self.after(())
    }

    async fn remove_member(&self, key: &str, member: &str) -> Result<(), BrokerError> {
        self.before()?;
        self.inner.remove(key, member);
        self.after(())
    }

    async fn live_members(&self, key: &str) -> Result<u64, BrokerError> {
        self.before()?;
        let n = self.inner.count(key);
        self.after(n)
    }
}
