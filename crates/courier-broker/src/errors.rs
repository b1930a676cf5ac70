use std::time::Duration;

/// Failure of a single broker call. Callers treat every variant the same
/// way (fall back to local state); the split exists for logs.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("broker unavailable: {0}")]
    Unavailable(String),
    #[error("broker call `{op}` timed out after {after:?}")]
    Timeout { op: &'static str, after: Duration },
    #[error("broker command failed: {0}")]
    Command(#[from] redis::RedisError),
}

impl BrokerError {
    /// Short classification string for logging.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Unavailable(_) => "unavailable",
            Self::Timeout { .. } => "timeout",
            Self::Command(_) => "command",
        }
    }
}
