/// Inbound frame rejected at the decode boundary.
///
/// Only a frame that is not a JSON object at all is a violation; a valid
/// object with an unknown `type` is tolerated by the decoder.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("frame is not a JSON object")]
    NotAnObject,
}
