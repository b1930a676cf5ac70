use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// In-memory counter. Monotonically increasing.
struct Counter {
    value: AtomicU64,
}

impl Counter {
    fn new() -> Self {
        Self {
            value: AtomicU64::new(0),
        }
    }
    fn increment(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }
    fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Point-in-time copy of every dispatch counter.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub connections_opened: u64,
    pub connections_closed: u64,
    pub auth_failures: u64,
    pub protocol_violations: u64,
    pub locks_granted: u64,
    pub locks_contended: u64,
    pub locks_released: u64,
    pub fanout_published: u64,
    pub fanout_local_fallbacks: u64,
    pub broker_errors: u64,
}

/// Process-local counters for the dispatch path. Not aggregated across
/// instances; each instance reports its own.
pub struct DispatchMetrics {
    connections_opened: Counter,
    connections_closed: Counter,
    auth_failures: Counter,
    protocol_violations: Counter,
    locks_granted: Counter,
    locks_contended: Counter,
    locks_released: Counter,
    fanout_published: Counter,
    fanout_local_fallbacks: Counter,
    broker_errors: Counter,
}

impl DispatchMetrics {
    pub fn new() -> Self {
        Self {
            connections_opened: Counter::new(),
            connections_closed: Counter::new(),
            auth_failures: Counter::new(),
            protocol_violations: Counter::new(),
            locks_granted: Counter::new(),
            locks_contended: Counter::new(),
            locks_released: Counter::new(),
            fanout_published: Counter::new(),
            fanout_local_fallbacks: Counter::new(),
            broker_errors: Counter::new(),
        }
    }

    pub fn connection_opened(&self) {
        self.connections_opened.increment();
    }

    pub fn connection_closed(&self) {
        self.connections_closed.increment();
    }

    pub fn auth_failed(&self) {
        self.auth_failures.increment();
    }

    pub fn protocol_violation(&self) {
        self.protocol_violations.increment();
    }

    pub fn lock_outcome(&self, granted: bool) {
        if granted {
            self.locks_granted.increment();
        } else {
            self.locks_contended.increment();
        }
    }

    pub fn lock_released(&self) {
        self.locks_released.increment();
    }

    pub fn fanout_published(&self) {
        self.fanout_published.increment();
    }

    pub fn fanout_fell_back(&self) {
        self.fanout_local_fallbacks.increment();
    }

    pub fn broker_error(&self) {
        self.broker_errors.increment();
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            connections_opened: self.connections_opened.get(),
            connections_closed: self.connections_closed.get(),
            auth_failures: self.auth_failures.get(),
            protocol_violations: self.protocol_violations.get(),
            locks_granted: self.locks_granted.get(),
            locks_contended: self.locks_contended.get(),
            locks_released: self.locks_released.get(),
            fanout_published: self.fanout_published.get(),
            fanout_local_fallbacks: self.fanout_local_fallbacks.get(),
            broker_errors: self.broker_errors.get(),
        }
    }
}

impl Default for DispatchMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_start_at_zero() {
        let metrics = DispatchMetrics::new();
        assert_eq!(metrics.snapshot(), MetricsSnapshot::default());
    }

    #[test]
    fn lock_outcome_splits_granted_and_contended() {
        let metrics = DispatchMetrics::new();
        metrics.lock_outcome(true);
        metrics.lock_outcome(false);
        metrics.lock_outcome(false);
        let snap = metrics.snapshot();
        assert_eq!(snap.locks_granted, 1);
        assert_eq!(snap.locks_contended, 2);
    }

    #[test]
    fn snapshot_serializes_with_field_names() {
        let metrics = DispatchMetrics::new();
        metrics.fanout_fell_back();
        let json = serde_json::to_value(metrics.snapshot()).unwrap();
        assert_eq!(json["fanout_local_fallbacks"], 1);
        assert_eq!(json["broker_errors"], 0);
    }

    #[test]
    fn concurrent_increments_are_not_lost() {
        let metrics = std::sync::Arc::new(DispatchMetrics::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let m = std::sync::Arc::clone(&metrics);
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        m.connection_opened();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(metrics.snapshot().connections_opened, 8000);
    }
}
