use std::sync::Arc;

use courier_core::DomainEvent;
use tokio_util::task::TaskTracker;

use crate::fanout::Fanout;

/// Entry point for domain events raised outside this service.
#[derive(Clone)]
pub struct PushGateway {
    fanout: Arc<Fanout>,
    tracker: TaskTracker,
}

impl PushGateway {
    pub fn new(fanout: Arc<Fanout>, tracker: TaskTracker) -> Self {
        Self { fanout, tracker }
    }

    /// Publish every frame `event` maps to, in order.
    pub async fn push(&self, event: &DomainEvent) {
        let deliveries = event.deliveries();
        tracing::info!(
            event_type = event.event_type(),
            order_id = ?event.order_id(),
            audiences = deliveries.len(),
            "Pushing domain event"
        );
        for (audience, frame) in deliveries {
            self.fanout.publish(audience, &frame).await;
        }
    }

    /// Push in a tracked background task. Shutdown waits for it.
    pub fn dispatch(&self, event: DomainEvent) {
        let this = self.clone();
        self.tracker.spawn(async move {
            this.push(&event).await;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_broker::Brokers;
    use courier_core::{Audience, Envelope, Identity, IdentityId, OfferId};
    use courier_telemetry::DispatchMetrics;
    use futures::StreamExt;
    use serde_json::json;

    use crate::registry::ConnectionRegistry;

    fn gateway() -> (PushGateway, Brokers, TaskTracker) {
        let brokers = Brokers::standalone();
        let fanout = Arc::new(Fanout::new(
            brokers.clone(),
            Arc::new(ConnectionRegistry::new(8)),
            "t",
            Arc::new(DispatchMetrics::new()),
        ));
        let tracker = TaskTracker::new();
        (PushGateway::new(fanout, tracker.clone()), brokers, tracker)
    }

    #[tokio::test]
    async fn accepted_order_goes_to_fulfillers_and_requester() {
        let (push, brokers, _) = gateway();
        let mut stream = brokers.local.stream(&["t:fulfillers".into(), "t:direct".into()]);

        push.push(&DomainEvent::OrderAccepted {
            order_id: OfferId(42),
            order_type: None,
            requester_id: IdentityId::from(100),
            driver_id: IdentityId::from(7),
            driver: json!({"name": "Aziz"}),
        })
        .await;

        let first = stream.next().await.unwrap();
        let second = stream.next().await.unwrap();
        assert_eq!(first.channel, "t:fulfillers");
        assert_eq!(second.channel, "t:direct");

        let direct = Envelope::from_bytes(&second.payload).unwrap();
        assert_eq!(
            direct.audience,
            Audience::Identity {
                identity: Identity::requester(100)
            }
        );
        assert!(direct.frame.contains(r#""driver":{"name":"Aziz"}"#));
    }

    #[tokio::test]
    async fn dispatch_is_tracked() {
        let (push, brokers, tracker) = gateway();
        let mut stream = brokers.local.stream(&["t:fulfillers".into()]);

        push.dispatch(DomainEvent::OrderCancelled { order_id: OfferId(42) });
        tracker.close();
        tracker.wait().await;

        let msg = stream.next().await.unwrap();
        let envelope = Envelope::from_bytes(&msg.payload).unwrap();
        assert_eq!(envelope.frame, r#"{"type":"order_cancelled","order_id":42}"#);
    }
}
