use thiserror::Error;

/// A failed weight write.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TrafficError {
    /// Another write for the same rollout is in flight.
    #[error("a weight change is already in flight")]
    Busy,

    #[error("canary weight {0} is outside 0-100")]
    InvalidWeight(u8),

    #[error("unknown service: {0}")]
    UnknownService(String),

    #[error("invalid backend address {0:?}, expected host:port")]
    InvalidBackend(String),

    /// The routing layer rejected or failed the write. Transient.
    #[error("routing backend error: {0}")]
    Backend(String),
}
