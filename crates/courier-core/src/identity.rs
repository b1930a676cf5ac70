use serde::{Deserialize, Serialize};

use crate::ids::IdentityId;

/// Which side of the marketplace a participant is on.
///
/// Wire names follow the client apps: fulfillers are "driver", requesters
/// are "user".
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub enum Role {
    #[serde(rename = "driver")]
    Fulfiller,
    #[serde(rename = "user")]
    Requester,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Fulfiller => "driver",
            Self::Requester => "user",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An authenticated participant. Resolved externally, once per connection.
#[derive(Clone, Debug, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct Identity {
    pub id: IdentityId,
    pub role: Role,
}

impl Identity {
    pub fn fulfiller(id: impl Into<IdentityId>) -> Self {
        Self {
            id: id.into(),
            role: Role::Fulfiller,
        }
    }

    pub fn requester(id: impl Into<IdentityId>) -> Self {
        Self {
            id: id.into(),
            role: Role::Requester,
        }
    }

    pub fn is_fulfiller(&self) -> bool {
        self.role == Role::Fulfiller
    }
}

impl std::fmt::Display for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.role, self.id)
    }
}
