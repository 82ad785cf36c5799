//! Remote queue capability consumed by the transport.

use crate::error::TransportError;
use crate::message::Lease;
use async_trait::async_trait;
use std::time::Duration;

/// Time-to-live requested when publishing a message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageTimeToLive {
    /// Message never expires
    Infinite,
    /// Backend's default expiry
    Default,
}

/// A message fetched from the backend under a fresh lease
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseMessage {
    pub id: String,
    pub text: String,
    pub lease_receipt: String,
    pub dequeue_count: u32,
}

impl From<LeaseMessage> for Lease {
    fn from(message: LeaseMessage) -> Self {
        Lease::new(message.id, message.text, message.lease_receipt)
    }
}

/// Operations a lease-based polling queue must support
///
/// Every call is remote and may fail. Dropping a returned future cancels the call.
/// Implementations must be safe to share between many transports.
#[async_trait]
pub trait QueueBackend: Send + Sync {
    /// Ensure the queue exists
    async fn create_if_not_exists(&self) -> Result<(), TransportError>;

    /// Remove the queue if it exists
    async fn delete_if_exists(&self) -> Result<(), TransportError>;

    /// Remove every message from the queue
    async fn clear(&self) -> Result<(), TransportError>;

    /// Approximate number of messages in the queue, visible or not
    async fn approximate_message_count(&self) -> Result<u64, TransportError>;

    /// Publish a text message
    async fn send(&self, text: &str, ttl: MessageTimeToLive) -> Result<(), TransportError>;

    /// Fetch up to `max_count` messages, hiding them for `visibility_timeout`
    async fn receive_batch(
        &self,
        max_count: u32,
        visibility_timeout: Option<Duration>,
    ) -> Result<Vec<LeaseMessage>, TransportError>;

    /// Delete a message by presenting its current lease receipt
    async fn delete(&self, id: &str, lease_receipt: &str) -> Result<(), TransportError>;
}
