//! `/health` and `/ws/stats` bodies.

use std::time::Instant;

use courier_broker::BrokerMode;
use courier_telemetry::MetricsSnapshot;
use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// `"ok"`, or `"degraded"` when a configured broker stopped answering.
    pub status: &'static str,
    pub mode: BrokerMode,
    pub uptime_secs: u64,
    /// Live connections on this instance.
    pub connections: usize,
}

pub fn health_check(start_time: Instant, mode: BrokerMode, broker_ok: bool, connections: usize) -> HealthResponse {
    HealthResponse {
        status: if broker_ok { "ok" } else { "degraded" },
        mode,
        uptime_secs: start_time.elapsed().as_secs(),
        connections,
    }
}

/// Participant counts. Cross-instance when the broker answers, this
/// instance's own otherwise.
#[derive(Debug, Clone, Serialize)]
pub struct StatsResponse {
    pub active_drivers: u64,
    pub active_users: u64,
    pub total_connections: u64,
    pub local_connections: usize,
    pub mode: BrokerMode,
    pub metrics: MetricsSnapshot,
}
