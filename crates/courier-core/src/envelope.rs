use serde::{Deserialize, Serialize};

use crate::identity::Identity;

/// Who a fanned-out frame is for.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Audience {
    AllFulfillers,
    AllRequesters,
    Identity { identity: Identity },
}

impl Audience {
    /// Every channel suffix an audience can map to.
    pub const CHANNELS: [&'static str; 3] = ["fulfillers", "requesters", "direct"];

    /// Channel suffix this audience is published on.
    pub fn channel(&self) -> &'static str {
        match self {
            Self::AllFulfillers => "fulfillers",
            Self::AllRequesters => "requesters",
            Self::Identity { .. } => "direct",
        }
    }
}

/// Payload of every fanout message: an already-encoded frame plus its audience.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub audience: Audience,
    pub frame: String,
}

impl Envelope {
    pub fn new(audience: Audience, frame: impl Into<String>) -> Self {
        Self {
            audience,
            frame: frame.into(),
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}
