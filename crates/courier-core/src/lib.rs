pub mod envelope;
pub mod errors;
pub mod events;
pub mod identity;
pub mod ids;
pub mod protocol;

pub use envelope::{Audience, Envelope};
pub use errors::ProtocolError;
pub use events::DomainEvent;
pub use identity::{Identity, Role};
pub use ids::{ConnectionId, IdentityId, OfferId};
pub use protocol::{InboundFrame, OrderType, OutboundFrame};
