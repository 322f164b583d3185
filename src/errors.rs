//! Watch Client Error Hierarchy
//!
//! Errors are split by concern: [`WatchError`] covers everything the watch
//! core can report at runtime, [`TransportError`] is what the network
//! collaborator hands back, and [`Error`] wraps both together with
//! configuration failures for callers that load settings.

use config::ConfigError;

#[doc(hidden)]
pub type Result<T> = std::result::Result<T, Error>;

/// Result type returned by every watch-core operation.
pub type WatchResult<T> = std::result::Result<T, WatchError>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Watch subsystem failures
    #[error(transparent)]
    Watch(#[from] WatchError),

    /// Client configuration loading or validation failures
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Runtime failures of the watch subsystem.
///
/// `Clone` because the outcome of one coalesced batch flush is delivered to
/// every caller whose request went into that batch.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WatchError {
    /// Referenced record or subscription is absent on the server
    #[error("Not found: {0}")]
    NotFound(String),

    /// The server invalidated an open subscription. Terminal for every Watch
    /// sharing it; nothing in this crate resubscribes automatically.
    #[error("Subscription {handle} was lost by the server")]
    SubscriptionLost { handle: String },

    /// Operation attempted on a closed Watch or Subject
    #[error("{0} is closed")]
    Closed(&'static str),

    /// Network or codec failure reported by the transport collaborator
    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl WatchError {
    /// Terminal errors stop the recurring poll loop.
    pub fn is_terminal(&self) -> bool {
        matches!(self, WatchError::SubscriptionLost { .. } | WatchError::Closed(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// Request did not complete within the transport's deadline
    #[error("Request timed out")]
    Timeout,

    /// Endpoint could not be reached
    #[error("Network unreachable: {0}")]
    Unreachable(String),

    /// Server answered with a non-success status
    #[error("Server responded with status {code}: {message}")]
    Status { code: u16, message: String },

    /// Response body could not be decoded
    #[error("Failed to decode response: {0}")]
    Decode(String),
}
