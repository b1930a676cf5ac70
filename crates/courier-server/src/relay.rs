//! Broker subscription that hands every received envelope to local
//! connections.

use std::sync::Arc;
use std::time::Duration;

use courier_broker::FanoutStream;
use courier_core::Envelope;
use futures::StreamExt;
use rand::Rng;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::fanout::Fanout;

const RETRY_BASE: Duration = Duration::from_millis(250);
const RETRY_MAX: Duration = Duration::from_secs(10);

/// Subscribe to every fanout channel, then keep the subscription alive in a
/// tracked task until `shutdown` fires.
///
/// The first subscription is made before returning so frames published right
/// after startup are not missed. If it fails, the task keeps retrying with
/// backoff; local delivery still works through [`Fanout`]'s fallback.
pub async fn start(fanout: Arc<Fanout>, tracker: &TaskTracker, shutdown: CancellationToken) {
    let channels = fanout.channels();
    let first = match fanout.brokers().shared.subscribe(&channels).await {
        Ok(stream) => {
            tracing::info!(channels = ?channels, mode = %fanout.brokers().mode(), "Relay subscribed");
            Some(stream)
        }
        Err(e) => {
            tracing::warn!(error = %e, "Relay subscription failed, retrying in background");
            None
        }
    };

    tracker.spawn(run(fanout, channels, first, shutdown));
}

async fn run(fanout: Arc<Fanout>, channels: Vec<String>, mut stream: Option<FanoutStream>, shutdown: CancellationToken) {
    let mut attempt: u32 = 0;
    loop {
        if let Some(s) = stream.take() {
            attempt = 0;
            if forward(&fanout, s, &shutdown).await {
                break;
            }
            tracing::warn!("Relay subscription ended, resubscribing");
        }

        let delay = backoff(attempt);
        attempt = attempt.saturating_add(1);
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }

        match fanout.brokers().shared.subscribe(&channels).await {
            Ok(s) => {
                tracing::info!(attempt, "Relay resubscribed");
                stream = Some(s);
            }
            Err(e) => tracing::warn!(attempt, error = %e, "Relay resubscribe failed"),
        }
    }
    tracing::info!("Relay stopped");
}

/// Deliver until the stream ends (false) or shutdown fires (true).
async fn forward(fanout: &Fanout, mut stream: FanoutStream, shutdown: &CancellationToken) -> bool {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return true,
            msg = stream.next() => {
                let Some(msg) = msg else {
                    return false;
                };
                match Envelope::from_bytes(&msg.payload) {
                    Ok(envelope) => {
                        let delivered = fanout.deliver_local(&envelope);
                        tracing::trace!(channel = %msg.channel, delivered, "Relayed");
                    }
                    Err(e) => {
                        tracing::warn!(channel = %msg.channel, error = %e, "Dropping undecodable fanout message");
                    }
                }
            }
        }
    }
}

fn backoff(attempt: u32) -> Duration {
    let exp = RETRY_BASE.saturating_mul(2u32.saturating_pow(attempt.min(16)));
    let capped = exp.min(RETRY_MAX);
    let jitter_ms = rand::thread_rng().gen_range(0..=capped.as_millis() as u64 / 2);
    capped + Duration::from_millis(jitter_ms)
}
