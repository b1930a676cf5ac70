//! JSON frames exchanged with connected clients.
//!
//! Every frame is an object with a `type` discriminator. Inbound decoding is
//! deliberately lenient: only a payload that is not a JSON object is an
//! error, everything else either decodes into a known frame or is dropped.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::ProtocolError;
use crate::ids::{IdentityId, OfferId};

pub const CONNECTED_MESSAGE: &str = "WebSocket connected successfully";
pub const LOCK_ACQUIRED_MESSAGE: &str = "You can now accept this order";
pub const LOCK_FAILED_MESSAGE: &str = "Another driver is accepting this order";

#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderType {
    Taxi,
    Delivery,
}

/// Frames a client may send once its connection is active.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundFrame {
    Ping,
    ViewingOrder {
        #[serde(default)]
        order_id: Option<OfferId>,
        #[serde(default)]
        order_type: Option<String>,
    },
    StopViewingOrder {
        #[serde(default)]
        order_id: Option<OfferId>,
    },
    RequestLock {
        #[serde(default)]
        order_id: Option<OfferId>,
    },
    #[serde(other)]
    Unknown,
}

impl InboundFrame {
    /// Decode one text frame.
    ///
    /// `Ok(None)` means the frame is a JSON object this server does not
    /// understand (missing or unknown `type`, mistyped fields) and should be
    /// ignored. `Err` means the payload is not a JSON object at all.
    pub fn decode(text: &str) -> Result<Option<Self>, ProtocolError> {
        let value: Value = serde_json::from_str(text)?;
        if !value.is_object() {
            return Err(ProtocolError::NotAnObject);
        }
        match serde_json::from_value::<Self>(value) {
            Ok(Self::Unknown) | Err(_) => Ok(None),
            Ok(frame) => Ok(Some(frame)),
        }
    }

    pub fn frame_type(&self) -> &'static str {
        match self {
            Self::Ping => "ping",
            Self::ViewingOrder { .. } => "viewing_order",
            Self::StopViewingOrder { .. } => "stop_viewing_order",
            Self::RequestLock { .. } => "request_lock",
            Self::Unknown => "unknown",
        }
    }

    /// Whether only fulfillers may send this frame.
    pub fn is_fulfiller_only(&self) -> bool {
        matches!(
            self,
            Self::ViewingOrder { .. } | Self::StopViewingOrder { .. } | Self::RequestLock { .. }
        )
    }
}

/// Frames the server pushes to clients.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundFrame {
    Connected {
        identity_id: IdentityId,
        message: String,
    },
    Pong,
    NewOrder {
        order: Value,
    },
    /// Fulfillers get `driver_id`; the requester gets the `driver` details.
    OrderAccepted {
        order_id: OfferId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        order_type: Option<OrderType>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        driver_id: Option<IdentityId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        driver: Option<Value>,
    },
    OrderCancelled {
        order_id: OfferId,
    },
    OrderCompleted {
        order_id: OfferId,
    },
    ViewerCount {
        order_id: OfferId,
        count: u64,
    },
    LockAcquired {
        order_id: OfferId,
        message: String,
    },
    LockFailed {
        order_id: OfferId,
        message: String,
    },
}

impl OutboundFrame {
    pub fn connected(identity_id: IdentityId) -> Self {
        Self::Connected {
            identity_id,
            message: CONNECTED_MESSAGE.into(),
        }
    }

    pub fn lock_result(order_id: OfferId, acquired: bool) -> Self {
        if acquired {
            Self::LockAcquired {
                order_id,
                message: LOCK_ACQUIRED_MESSAGE.into(),
            }
        } else {
            Self::LockFailed {
                order_id,
                message: LOCK_FAILED_MESSAGE.into(),
            }
        }
    }

    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn frame_type(&self) -> &'static str {
        match self {
            Self::Connected { .. } => "connected",
            Self::Pong => "pong",
            Self::NewOrder { .. } => "new_order",
            Self::OrderAccepted { .. } => "order_accepted",
            Self::OrderCancelled { .. } => "order_cancelled",
            Self::OrderCompleted { .. } => "order_completed",
            Self::ViewerCount { .. } => "viewer_count",
            Self::LockAcquired { .. } => "lock_acquired",
            Self::LockFailed { .. } => "lock_failed",
        }
    }
}
