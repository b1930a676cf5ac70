//! Publishing frames to an audience on every instance.

use std::sync::Arc;

use bytes::Bytes;
use courier_broker::Brokers;
use courier_core::{Audience, Envelope, OutboundFrame, Role};
use courier_telemetry::DispatchMetrics;

use crate::registry::ConnectionRegistry;

/// Front for cross-instance delivery.
///
/// Frames go out through the shared broker and come back to every instance,
/// this one included, through the [`crate::relay`]. When the broker refuses
/// a publish the frame is delivered to local connections directly, so this
/// instance's clients still see it.
pub struct Fanout {
    brokers: Brokers,
    registry: Arc<ConnectionRegistry>,
    prefix: String,
    metrics: Arc<DispatchMetrics>,
}

impl Fanout {
    pub fn new(
        brokers: Brokers,
        registry: Arc<ConnectionRegistry>,
        prefix: impl Into<String>,
        metrics: Arc<DispatchMetrics>,
    ) -> Self {
        Self {
            brokers,
            registry,
            prefix: prefix.into(),
            metrics,
        }
    }

    pub fn channel_for(&self, audience: &Audience) -> String {
        format!("{}:{}", self.prefix, audience.channel())
    }

    /// Every channel the relay must listen on.
    pub fn channels(&self) -> Vec<String> {
        Audience::CHANNELS
            .iter()
            .map(|suffix| format!("{}:{}", self.prefix, suffix))
            .collect()
    }

    pub fn brokers(&self) -> &Brokers {
        &self.brokers
    }

    pub async fn publish(&self, audience: Audience, frame: &OutboundFrame) {
        let encoded = match frame.encode() {
            Ok(encoded) => encoded,
            Err(e) => {
                tracing::error!(frame_type = frame.frame_type(), error = %e, "Failed to encode frame");
                return;
            }
        };
        let envelope = Envelope::new(audience, encoded);
        let payload = match envelope.to_bytes() {
            Ok(payload) => Bytes::from(payload),
            Err(e) => {
                tracing::error!(frame_type = frame.frame_type(), error = %e, "Failed to encode envelope");
                return;
            }
        };

        let channel = self.channel_for(&envelope.audience);
        match self.brokers.shared.publish(&channel, payload).await {
            Ok(()) => {
                self.metrics.fanout_published();
                tracing::debug!(channel = %channel, frame_type = frame.frame_type(), "Published");
            }
            Err(e) => {
                self.metrics.broker_error();
                self.metrics.fanout_fell_back();
                tracing::warn!(
                    channel = %channel,
                    frame_type = frame.frame_type(),
                    error = %e,
                    mode = %self.brokers.mode(),
                    "Publish failed, delivering to local connections only"
                );
                self.deliver_local(&envelope);
            }
        }
    }

    /// Hand an envelope to this instance's connections. Returns how many
    /// connections accepted the frame.
    pub fn deliver_local(&self, envelope: &Envelope) -> usize {
        match &envelope.audience {
            Audience::AllFulfillers => self.registry.broadcast_local(Role::Fulfiller, &envelope.frame),
            Audience::AllRequesters => self.registry.broadcast_local(Role::Requester, &envelope.frame),
            Audience::Identity { identity } => self.registry.deliver_local(identity, &envelope.frame),
        }
    }
}
