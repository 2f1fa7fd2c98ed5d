use thiserror::Error;

use crate::store::StoreError;

/// Errors surfaced by the limiter core.
///
/// Every kind propagates to the caller unchanged; the only internal recovery
/// is the fungible refill step, which logs and swallows store failures
/// because the consume has already counted.
#[derive(Error, Debug)]
pub enum RateLimitError {
    /// No token is available right now, or the account is blacklisted.
    /// Callers should back off.
    #[error("capacity exhausted for {0}")]
    CapacityExhausted(String),

    /// The store reported transient overload. Callers may retry.
    #[error("store throttled: {0}")]
    Throttled(String),

    /// A promote targeted a reservation that no longer exists.
    #[error("reservation not found: {0}")]
    ReservationNotFound(String),

    /// A reservation was promoted or cancelled more than once.
    #[error("invalid reservation state: {0}")]
    InvalidState(String),

    /// A termination event is missing required fields.
    #[error("cannot process event: {0}")]
    InvalidEvent(String),

    /// No processor is registered for the event's source.
    #[error("no processor for event source: {0}")]
    UnknownSource(String),

    /// Invalid or unresolvable configuration.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Unrecoverable store failure.
    #[error("storage backend error: {0}")]
    Store(StoreError),
}

impl From<StoreError> for RateLimitError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Throttled(msg) => RateLimitError::Throttled(msg),
            other => RateLimitError::Store(other),
        }
    }
}

pub type Result<T> = std::result::Result<T, RateLimitError>;
