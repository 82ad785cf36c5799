//! Error types for transport operations.

use std::time::Duration;
use thiserror::Error;

/// Failure of a transport operation or of building a transport
///
/// Cancellation is never represented here: a cancelled operation reports a
/// cancellation event and returns its benign result instead.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Queue '{queue_name}' does not exist")]
    QueueNotFound { queue_name: String },

    #[error("Message '{message_id}' is no longer in the queue")]
    MessageNotFound { message_id: String },

    #[error("Lease on message '{message_id}' is no longer held (lease receipt mismatch)")]
    LeaseLost { message_id: String },

    #[error("Backend call did not finish within {duration:?}")]
    Timeout { duration: Duration },

    #[error("Could not reach the queue service: {message}")]
    ConnectionFailed { message: String },

    #[error("Queue service rejected the credentials: {message}")]
    AuthenticationFailed { message: String },

    #[error("Encoded message is {size} bytes; the queue accepts at most {max_size}")]
    MessageTooLarge { size: usize, max_size: usize },

    #[error("{provider} rejected the request with {code}: {message}")]
    ProviderError {
        provider: String,
        code: String,
        message: String,
    },

    #[error("Transport '{uri}' has been disposed")]
    Disposed { uri: String },

    #[error("Message content could not be processed: {0}")]
    SerializationError(#[from] SerializationError),

    #[error("Transport is misconfigured: {0}")]
    ConfigurationError(#[from] ConfigurationError),

    #[error("Invalid queue address: {0}")]
    ValidationError(#[from] ValidationError),
}

impl TransportError {
    /// Whether repeating the same call may succeed
    ///
    /// The transport itself never retries; this classification is for callers
    /// that implement their own retry policy.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Timeout { .. } | Self::ConnectionFailed { .. } | Self::ProviderError { .. }
        )
    }

    /// Alias of [`is_transient`](Self::is_transient) for retry loops
    pub fn should_retry(&self) -> bool {
        self.is_transient()
    }
}

/// Errors while encoding or decoding message content
#[derive(Debug, Error)]
pub enum SerializationError {
    #[error("Message text is not valid base64: {message}")]
    InvalidBase64 { message: String },

    #[error("Response XML could not be parsed: {message}")]
    InvalidXml { message: String },

    #[error("Response is missing required field '{field}'")]
    MissingField { field: String },
}

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error("Invalid configuration: {message}")]
    Invalid { message: String },

    #[error("Missing required configuration: {key}")]
    Missing { key: String },

    #[error("Configuration parsing failed: {message}")]
    Parsing { message: String },

    #[error("No transport configuration named '{name}'")]
    UnknownConfiguration { name: String },

    #[error("Unsupported scheme '{scheme}' (expected '{expected}')")]
    UnsupportedScheme { scheme: String, expected: String },
}

/// Queue name rule violations
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("queue name '{name}' must be 3-63 characters long")]
    QueueNameLength { name: String },

    #[error("queue name '{name}' may only contain lowercase letters, digits and single inner hyphens")]
    QueueNameCharacters { name: String },
}

#[cfg(test)]
#[path = "error_tests.rs"]
mod tests;
