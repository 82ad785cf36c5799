//! Common test utilities for queue-transport integration tests
//!
//! This module provides:
//! - Transports wired to the in-memory backend with event capture
//! - A backend wrapper that records concurrent fetches

use async_trait::async_trait;
use queue_transport::{
    ChannelObserver, InMemoryQueueBackend, LeaseMessage, MessageTimeToLive, ObserverSet,
    QueueBackend, ReceiveOptions, StorageQueueTransport, TransportError, TransportEvent,
    TransportUri,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;

pub type EventReceiver = UnboundedReceiver<(TransportUri, TransportEvent)>;

/// Transport over `backend` with every event captured in a channel
pub fn transport_over(
    uri: &str,
    backend: Arc<dyn QueueBackend>,
) -> (StorageQueueTransport, EventReceiver) {
    let (observer, events) = ChannelObserver::new();
    let transport = StorageQueueTransport::new(
        TransportUri::parse(uri).expect("test URI is valid"),
        backend,
        ReceiveOptions::default(),
        ObserverSet::new().with_observer(Arc::new(observer)),
    );
    (transport, events)
}

/// Transport over a freshly created in-memory queue
#[allow(dead_code)]
pub async fn memory_transport() -> (StorageQueueTransport, Arc<InMemoryQueueBackend>, EventReceiver)
{
    let backend = Arc::new(InMemoryQueueBackend::default());
    backend
        .create_if_not_exists()
        .await
        .expect("in-memory queue can be created");
    let (transport, events) = transport_over("azuresq://local/integration", backend.clone());
    (transport, backend, events)
}

/// Stage tags of every event emitted so far
#[allow(dead_code)]
pub fn stages(events: &mut EventReceiver) -> Vec<String> {
    let mut stages = Vec::new();
    while let Ok((_, event)) = events.try_recv() {
        stages.push(event.to_string());
    }
    stages
}

// ============================================================================
// Counting Backend
// ============================================================================

/// In-memory backend that slows fetches down and records their overlap
#[derive(Default)]
#[allow(dead_code)]
pub struct CountingBackend {
    pub inner: InMemoryQueueBackend,
    fetch_delay: Duration,
    active_fetches: AtomicUsize,
    max_concurrent_fetches: AtomicUsize,
    total_fetches: AtomicUsize,
}

#[allow(dead_code)]
impl CountingBackend {
    pub fn with_fetch_delay(fetch_delay: Duration) -> Self {
        Self {
            fetch_delay,
            ..Self::default()
        }
    }

    pub fn max_concurrent_fetches(&self) -> usize {
        self.max_concurrent_fetches.load(Ordering::SeqCst)
    }

    pub fn total_fetches(&self) -> usize {
        self.total_fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl QueueBackend for CountingBackend {
    async fn create_if_not_exists(&self) -> Result<(), TransportError> {
        self.inner.create_if_not_exists().await
    }

    async fn delete_if_exists(&self) -> Result<(), TransportError> {
        self.inner.delete_if_exists().await
    }

    async fn clear(&self) -> Result<(), TransportError> {
        self.inner.clear().await
    }

    async fn approximate_message_count(&self) -> Result<u64, TransportError> {
        self.inner.approximate_message_count().await
    }

    async fn send(&self, text: &str, ttl: MessageTimeToLive) -> Result<(), TransportError> {
        self.inner.send(text, ttl).await
    }

    async fn receive_batch(
        &self,
        max_count: u32,
        visibility_timeout: Option<Duration>,
    ) -> Result<Vec<LeaseMessage>, TransportError> {
        let active = self.active_fetches.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_concurrent_fetches.fetch_max(active, Ordering::SeqCst);
        self.total_fetches.fetch_add(1, Ordering::SeqCst);

        tokio::time::sleep(self.fetch_delay).await;
        let result = self.inner.receive_batch(max_count, visibility_timeout).await;

        self.active_fetches.fetch_sub(1, Ordering::SeqCst);
        result
    }

    async fn delete(&self, id: &str, lease_receipt: &str) -> Result<(), TransportError> {
        self.inner.delete(id, lease_receipt).await
    }
}
