//! Message types for transport operations including core domain identifiers.

use crate::error::{SerializationError, ValidationError};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

// ============================================================================
// Core Domain Identifiers
// ============================================================================

/// Validated storage queue name
///
/// Storage queues accept 3-63 characters of lowercase ASCII letters, digits and
/// single hyphens, starting and ending with a letter or digit.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QueueName(String);

impl QueueName {
    /// Create new queue name with validation
    pub fn new(name: String) -> Result<Self, ValidationError> {
        if !(3..=63).contains(&name.len()) {
            return Err(ValidationError::QueueNameLength { name });
        }

        let allowed = name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-');
        if !allowed || name.starts_with('-') || name.ends_with('-') || name.contains("--") {
            return Err(ValidationError::QueueNameCharacters { name });
        }

        Ok(Self(name))
    }

    /// Get queue name as string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for QueueName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for QueueName {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s.to_string())
    }
}

/// Identity of a [`TransportMessage`] envelope, assigned by the sender
///
/// Unrelated to the id the backend assigns to the stored message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EnvelopeId(uuid::Uuid);

impl EnvelopeId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &uuid::Uuid {
        &self.0
    }
}

impl Default for EnvelopeId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for EnvelopeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

// ============================================================================
// Payload Encoding
// ============================================================================

/// Encode a payload as the text accepted by the queue backend
pub fn encode_payload(payload: &[u8]) -> String {
    STANDARD.encode(payload)
}

/// Decode backend message text back into the original payload
pub fn decode_payload(text: &str) -> Result<Bytes, SerializationError> {
    STANDARD
        .decode(text)
        .map(Bytes::from)
        .map_err(|e| SerializationError::InvalidBase64 {
            message: e.to_string(),
        })
}

// ============================================================================
// Message Types
// ============================================================================

/// Envelope metadata supplied by the pipeline alongside a payload
///
/// The transport forwards it to observers and never inspects it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransportMessage {
    pub message_id: EnvelopeId,
    pub message_type: String,
    pub correlation_id: Option<String>,
    pub headers: HashMap<String, String>,
}

impl TransportMessage {
    /// Create new message envelope for a message type
    pub fn new(message_type: impl Into<String>) -> Self {
        Self {
            message_id: EnvelopeId::new(),
            message_type: message_type.into(),
            correlation_id: None,
            headers: HashMap::new(),
        }
    }

    /// Add correlation ID for tracking
    pub fn with_correlation_id(mut self, correlation_id: String) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }

    /// Add a header
    pub fn with_header(mut self, key: String, value: String) -> Self {
        self.headers.insert(key, value);
        self
    }
}

impl Default for TransportMessage {
    fn default() -> Self {
        Self::new(String::new())
    }
}

/// The backend's temporary grant of exclusive visibility over one message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    id: String,
    payload_text: String,
    lease_receipt: String,
}

impl Lease {
    /// Create new lease
    pub fn new(id: String, payload_text: String, lease_receipt: String) -> Self {
        Self {
            id,
            payload_text,
            lease_receipt,
        }
    }

    /// Backend message identifier
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Message text exactly as stored by the backend
    pub fn payload_text(&self) -> &str {
        &self.payload_text
    }

    /// Receipt that must be presented to delete the message
    pub fn lease_receipt(&self) -> &str {
        &self.lease_receipt
    }
}

/// Opaque caller-held reference correlating a delivered message to its lease
///
/// Tokens are cheap to clone. A transport only recognizes tokens that wrap a
/// [`Lease`] it still holds; anything else is ignored.
#[derive(Clone)]
pub struct AcknowledgementToken(Arc<dyn Any + Send + Sync>);

impl AcknowledgementToken {
    /// Wrap any value as a token
    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        Self(Arc::new(value))
    }

    /// Borrow the wrapped value if it has type `T`
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.0.downcast_ref::<T>()
    }

    /// Borrow the wrapped lease, if this token wraps one
    pub fn lease(&self) -> Option<&Lease> {
        self.downcast_ref::<Lease>()
    }
}

impl From<Lease> for AcknowledgementToken {
    fn from(lease: Lease) -> Self {
        Self::new(lease)
    }
}

impl fmt::Debug for AcknowledgementToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.lease() {
            Some(lease) => f
                .debug_tuple("AcknowledgementToken")
                .field(&lease.id())
                .finish(),
            None => f.write_str("AcknowledgementToken(<foreign>)"),
        }
    }
}

/// A message delivered to a caller together with its acknowledgement token
#[derive(Debug, Clone)]
pub struct ReceivedMessage {
    pub payload: Bytes,
    pub token: AcknowledgementToken,
}

impl ReceivedMessage {
    /// Create new received message
    pub fn new(payload: Bytes, token: AcknowledgementToken) -> Self {
        Self { payload, token }
    }

    /// Backend message identifier, when the token wraps a lease
    pub fn message_id(&self) -> Option<&str> {
        self.token.lease().map(Lease::id)
    }
}

// ============================================================================
// Receive Options
// ============================================================================

/// Largest batch a storage queue returns from one receive call
pub const MAX_BATCH_SIZE: u32 = 32;

/// Settings controlling how the transport refills its receive buffer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiveOptions {
    /// Maximum number of messages fetched per backend round trip
    pub max_messages: u32,
    /// Visibility timeout applied to fetched messages (backend default when absent)
    pub visibility_timeout: Option<Duration>,
}

impl Default for ReceiveOptions {
    fn default() -> Self {
        Self {
            max_messages: MAX_BATCH_SIZE,
            visibility_timeout: None,
        }
    }
}

impl ReceiveOptions {
    /// Create new receive options with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Set maximum number of messages per fetch, clamped to `1..=32`
    pub fn with_max_messages(mut self, max: u32) -> Self {
        self.max_messages = max.clamp(1, MAX_BATCH_SIZE);
        self
    }

    /// Set visibility timeout for fetched messages
    pub fn with_visibility_timeout(mut self, timeout: Duration) -> Self {
        self.visibility_timeout = Some(timeout);
        self
    }
}

#[cfg(test)]
#[path = "message_tests.rs"]
mod tests;
