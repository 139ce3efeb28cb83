//! Error types for the relay core.
//!
//! Transport failures are converted into [`RelayError`] at the producer cache
//! and consumer registry boundary; nothing below that boundary is allowed to
//! escape into a delivery task.

use crate::transport::TransportError;

/// Result type for relay operations.
pub type Result<T> = std::result::Result<T, RelayError>;

/// Errors surfaced by the relay service.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    /// Operation attempted while the broker connection is not ready.
    #[error("Relay not initialized")]
    NotInitialized,

    /// Operation attempted after shutdown began.
    #[error("Relay shutdown in progress")]
    ShutdownInProgress,

    /// The recipient could not be mapped to a destination name.
    #[error("Cannot resolve destination: {0}")]
    DestinationResolution(String),

    /// Establishing the shared broker connection failed.
    #[error("Connection failed")]
    Connection(#[source] TransportError),

    /// The transport rejected or timed out a send. The producer was evicted.
    #[error("Send to '{destination}' failed")]
    SendFailure {
        destination: String,
        #[source]
        source: TransportError,
    },

    /// The transport could not create a consumer. No state was mutated.
    #[error("Subscribe to '{destination}' failed")]
    SubscribeFailure {
        destination: String,
        #[source]
        source: TransportError,
    },

    /// A listener failed during dispatch. Isolated and non-fatal.
    #[error("Listener failed on '{destination}': {message}")]
    ListenerFailure { destination: String, message: String },

    #[error("Configuration error: {0}")]
    Config(#[from] ::config::ConfigError),
}

impl RelayError {
    /// True for the two fail-fast lifecycle errors.
    pub fn is_lifecycle(&self) -> bool {
        matches!(self, Self::NotInitialized | Self::ShutdownInProgress)
    }
}
