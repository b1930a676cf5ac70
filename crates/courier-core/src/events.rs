use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::envelope::Audience;
use crate::identity::Identity;
use crate::ids::{IdentityId, OfferId};
use crate::protocol::{OrderType, OutboundFrame};

/// Domain events raised by the order workflows outside this service.
///
/// Each event fans out to one or more audiences; see [`DomainEvent::deliveries`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DomainEvent {
    /// A new offer is open for acceptance. `order` is passed through verbatim.
    NewOrder { order: Value },

    OrderAccepted {
        order_id: OfferId,
        #[serde(default)]
        order_type: Option<OrderType>,
        requester_id: IdentityId,
        driver_id: IdentityId,
        /// Driver details shown to the requester (name, car, phone...).
        #[serde(default)]
        driver: Value,
    },

    OrderCompleted {
        order_id: OfferId,
        requester_id: IdentityId,
    },

    OrderCancelled { order_id: OfferId },
}

impl DomainEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::NewOrder { .. } => "new_order",
            Self::OrderAccepted { .. } => "order_accepted",
            Self::OrderCompleted { .. } => "order_completed",
            Self::OrderCancelled { .. } => "order_cancelled",
        }
    }

    pub fn order_id(&self) -> Option<OfferId> {
        match self {
            Self::NewOrder { order } => order.get("id").and_then(Value::as_i64).map(OfferId),
            Self::OrderAccepted { order_id, .. }
            | Self::OrderCompleted { order_id, .. }
            | Self::OrderCancelled { order_id } => Some(*order_id),
        }
    }

    /// Frames to publish for this event, one per audience.
    pub fn deliveries(&self) -> Vec<(Audience, OutboundFrame)> {
        match self {
            Self::NewOrder { order } => vec![(
                Audience::AllFulfillers,
                OutboundFrame::NewOrder {
                    order: order.clone(),
                },
            )],
            Self::OrderAccepted {
                order_id,
                order_type,
                requester_id,
                driver_id,
                driver,
            } => vec![
                (
                    Audience::AllFulfillers,
                    OutboundFrame::OrderAccepted {
                        order_id: *order_id,
                        order_type: *order_type,
                        driver_id: Some(driver_id.clone()),
                        driver: None,
                    },
                ),
                (
                    Audience::Identity {
                        identity: Identity::requester(requester_id.clone()),
                    },
                    OutboundFrame::OrderAccepted {
                        order_id: *order_id,
                        order_type: *order_type,
                        driver_id: None,
                        driver: Some(driver.clone()),
                    },
                ),
            ],
            Self::OrderCompleted {
                order_id,
                requester_id,
            } => vec![(
                Audience::Identity {
                    identity: Identity::requester(requester_id.clone()),
                },
                OutboundFrame::OrderCompleted { order_id: *order_id },
            )],
            Self::OrderCancelled { order_id } => vec![(
                Audience::AllFulfillers,
                OutboundFrame::OrderCancelled { order_id: *order_id },
            )],
        }
    }
}
