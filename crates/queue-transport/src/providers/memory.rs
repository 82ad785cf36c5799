//! In-memory queue backend for testing and development.
//!
//! A single-queue, thread-safe backend that behaves like a storage queue:
//! - The queue must be created before messages can be sent or received
//! - Every delivery hides the message for a visibility timeout and issues a
//!   fresh pop receipt; deleting requires the latest receipt
//! - Messages expire after their time-to-live
//!
//! Time is read from `tokio::time`, so tests can pause and advance the clock.

use crate::backend::{LeaseMessage, MessageTimeToLive, QueueBackend};
use crate::error::TransportError;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use tokio::time::Instant;

#[cfg(test)]
#[path = "memory_tests.rs"]
mod tests;

const PROVIDER: &str = "memory";

/// In-memory backend configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InMemoryConfig {
    /// Queue name reported in `QueueNotFound` errors
    pub queue_name: String,
    /// Visibility timeout used when a receive does not specify one
    pub default_visibility_timeout: Duration,
    /// Expiry applied to messages sent with [`MessageTimeToLive::Default`]
    pub default_message_ttl: Option<Duration>,
}

impl Default for InMemoryConfig {
    fn default() -> Self {
        Self {
            queue_name: "in-memory".to_string(),
            default_visibility_timeout: Duration::from_secs(30),
            default_message_ttl: Some(Duration::from_secs(7 * 24 * 60 * 60)),
        }
    }
}

// ============================================================================
// Internal Storage Structures
// ============================================================================

#[derive(Default)]
struct QueueStorage {
    exists: bool,
    messages: VecDeque<StoredMessage>,
}

impl QueueStorage {
    fn remove_expired(&mut self, now: Instant) {
        self.messages.retain(|m| !m.is_expired(now));
    }
}

struct StoredMessage {
    id: String,
    text: String,
    pop_receipt: Option<String>,
    visible_at: Instant,
    dequeue_count: u32,
    expires_at: Option<Instant>,
}

impl StoredMessage {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|expires_at| now >= expires_at)
    }

    fn is_visible(&self, now: Instant) -> bool {
        now >= self.visible_at
    }
}

// ============================================================================
// InMemoryQueueBackend
// ============================================================================

/// In-memory storage queue
///
/// Clones share the same queue.
#[derive(Clone)]
pub struct InMemoryQueueBackend {
    storage: Arc<RwLock<QueueStorage>>,
    config: InMemoryConfig,
}

impl InMemoryQueueBackend {
    pub fn new(config: InMemoryConfig) -> Self {
        Self {
            storage: Arc::new(RwLock::new(QueueStorage::default())),
            config,
        }
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, QueueStorage>, TransportError> {
        self.storage.read().map_err(|_| lock_poisoned())
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, QueueStorage>, TransportError> {
        self.storage.write().map_err(|_| lock_poisoned())
    }

    /// Write access to an existing queue
    fn existing(&self) -> Result<RwLockWriteGuard<'_, QueueStorage>, TransportError> {
        let storage = self.write()?;
        if !storage.exists {
            return Err(TransportError::QueueNotFound {
                queue_name: self.config.queue_name.clone(),
            });
        }
        Ok(storage)
    }

    // Inspection helpers

    pub fn exists(&self) -> bool {
        self.read().map(|s| s.exists).unwrap_or(false)
    }

    /// Messages stored, visible or not
    pub fn message_count(&self) -> usize {
        self.read().map(|s| s.messages.len()).unwrap_or(0)
    }

    /// Messages currently hidden by a lease
    pub fn in_flight_count(&self) -> usize {
        let now = Instant::now();
        self.read()
            .map(|s| s.messages.iter().filter(|m| !m.is_visible(now)).count())
            .unwrap_or(0)
    }

    /// Text of every stored message in queue order
    pub fn message_texts(&self) -> Vec<String> {
        self.read()
            .map(|s| s.messages.iter().map(|m| m.text.clone()).collect())
            .unwrap_or_default()
    }

    /// Dequeue count of a stored message
    pub fn dequeue_count(&self, id: &str) -> Option<u32> {
        self.read()
            .ok()?
            .messages
            .iter()
            .find(|m| m.id == id)
            .map(|m| m.dequeue_count)
    }

    /// Make every hidden message visible again, as if its lease had run out
    pub fn expire_visibility(&self) {
        let now = Instant::now();
        if let Ok(mut storage) = self.write() {
            for message in storage.messages.iter_mut() {
                message.visible_at = now;
            }
        }
    }
}

impl Default for InMemoryQueueBackend {
    fn default() -> Self {
        Self::new(InMemoryConfig::default())
    }
}

fn lock_poisoned() -> TransportError {
    TransportError::ProviderError {
        provider: PROVIDER.to_string(),
        code: "LockPoisoned".to_string(),
        message: "in-memory queue storage lock was poisoned".to_string(),
    }
}

#[async_trait]
impl QueueBackend for InMemoryQueueBackend {
    async fn create_if_not_exists(&self) -> Result<(), TransportError> {
        self.write()?.exists = true;
        Ok(())
    }

    async fn delete_if_exists(&self) -> Result<(), TransportError> {
        let mut storage = self.write()?;
        storage.exists = false;
        storage.messages.clear();
        Ok(())
    }

    async fn clear(&self) -> Result<(), TransportError> {
        self.existing()?.messages.clear();
        Ok(())
    }

    async fn approximate_message_count(&self) -> Result<u64, TransportError> {
        let mut storage = self.existing()?;
        storage.remove_expired(Instant::now());
        Ok(storage.messages.len() as u64)
    }

    async fn send(&self, text: &str, ttl: MessageTimeToLive) -> Result<(), TransportError> {
        let now = Instant::now();
        let expires_at = match ttl {
            MessageTimeToLive::Infinite => None,
            MessageTimeToLive::Default => self.config.default_message_ttl.map(|ttl| now + ttl),
        };

        self.existing()?.messages.push_back(StoredMessage {
            id: uuid::Uuid::new_v4().to_string(),
            text: text.to_string(),
            pop_receipt: None,
            visible_at: now,
            dequeue_count: 0,
            expires_at,
        });

        Ok(())
    }

    async fn receive_batch(
        &self,
        max_count: u32,
        visibility_timeout: Option<Duration>,
    ) -> Result<Vec<LeaseMessage>, TransportError> {
        let now = Instant::now();
        let hidden_until =
            now + visibility_timeout.unwrap_or(self.config.default_visibility_timeout);

        let mut storage = self.existing()?;
        storage.remove_expired(now);

        let mut batch = Vec::new();
        for message in storage.messages.iter_mut() {
            if batch.len() >= max_count as usize {
                break;
            }
            if !message.is_visible(now) {
                continue;
            }

            let receipt = uuid::Uuid::new_v4().to_string();
            message.pop_receipt = Some(receipt.clone());
            message.visible_at = hidden_until;
            message.dequeue_count += 1;

            batch.push(LeaseMessage {
                id: message.id.clone(),
                text: message.text.clone(),
                lease_receipt: receipt,
                dequeue_count: message.dequeue_count,
            });
        }

        Ok(batch)
    }

    async fn delete(&self, id: &str, lease_receipt: &str) -> Result<(), TransportError> {
        let mut storage = self.existing()?;

        let position = storage
            .messages
            .iter()
            .position(|m| m.id == id)
            .ok_or_else(|| TransportError::MessageNotFound {
                message_id: id.to_string(),
            })?;

        if storage.messages[position].pop_receipt.as_deref() != Some(lease_receipt) {
            return Err(TransportError::LeaseLost {
                message_id: id.to_string(),
            });
        }

        storage.messages.remove(position);
        Ok(())
    }
}
