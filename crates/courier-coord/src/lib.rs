//! Cross-instance coordination state for offer dispatch.
//!
//! Everything here is built on a [`courier_broker::Brokers`] pair: the shared
//! broker is asked first, and any broker error drops that one call back to
//! this process's local store. No operation in this crate returns an error.

mod config;
pub mod lock;
pub mod presence;
pub mod roster;

pub use config::DispatchConfig;
pub use lock::LockCoordinator;
pub use presence::PresenceTracker;
pub use roster::Roster;

use courier_broker::BrokerError;
use courier_telemetry::DispatchMetrics;

/// Log and count a broker failure that is about to be answered locally.
pub(crate) fn note_fallback(metrics: &DispatchMetrics, op: &'static str, key: &str, error: &BrokerError) {
    metrics.broker_error();
    tracing::warn!(
        op,
        key,
        error = %error,
        error_kind = error.error_kind(),
        "Broker call failed, using local state"
    );
}
