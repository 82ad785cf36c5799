//! Lease-managing transport over a polling queue backend.
//!
//! [`StorageQueueTransport`] owns a local receive buffer and a lease registry and
//! guards both with a single async mutex. Every operation holds that gate for its
//! whole body, so a backend call and the local bookkeeping that follows it are
//! never interleaved with another caller's work.
//!
//! Cancellation is reported, not raised: a cancelled operation emits its
//! `*/cancelled` event and returns a benign value (`None`, `true` or `()`).

use crate::backend::{MessageTimeToLive, QueueBackend};
use crate::buffer::ReceiveBuffer;
use crate::error::TransportError;
use crate::events::{ObserverSet, Operation, TransportEvent};
use crate::message::{
    decode_payload, encode_payload, AcknowledgementToken, Lease, ReceiveOptions,
    ReceivedMessage, TransportMessage,
};
use crate::registry::LeaseRegistry;
use crate::uri::TransportUri;
use async_trait::async_trait;
use bytes::Bytes;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

// ============================================================================
// Transport Trait
// ============================================================================

/// Message lifecycle operations offered to a processing pipeline
#[async_trait]
pub trait Transport: Send + Sync {
    /// Identity of this transport
    fn uri(&self) -> &TransportUri;

    /// Ensure the queue exists
    async fn create(&self, cancel: &CancellationToken) -> Result<(), TransportError>;

    /// Remove the queue if it exists
    async fn drop_queue(&self, cancel: &CancellationToken) -> Result<(), TransportError>;

    /// Remove every message held by the backend
    async fn purge(&self, cancel: &CancellationToken) -> Result<(), TransportError>;

    /// Whether the backend reports any messages
    async fn has_pending(&self, cancel: &CancellationToken) -> Result<bool, TransportError>;

    /// Publish a payload
    async fn send(
        &self,
        message: &TransportMessage,
        payload: Bytes,
        cancel: &CancellationToken,
    ) -> Result<(), TransportError>;

    /// Take the next message, fetching a new batch when the local buffer is empty
    async fn receive(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Option<ReceivedMessage>, TransportError>;

    /// Permanently remove a delivered message
    async fn acknowledge(
        &self,
        token: &AcknowledgementToken,
        cancel: &CancellationToken,
    ) -> Result<(), TransportError>;

    /// Return a delivered message to the queue for redelivery
    async fn release(
        &self,
        token: &AcknowledgementToken,
        cancel: &CancellationToken,
    ) -> Result<(), TransportError>;

    /// Return every outstanding lease to the queue and shut the transport down
    async fn dispose(&self);
}

// ============================================================================
// Storage Queue Transport
// ============================================================================

#[derive(Debug, Default)]
struct TransportState {
    buffer: ReceiveBuffer,
    leases: LeaseRegistry,
    disposed: bool,
}

/// Outcome of racing a future against cancellation
enum Step<T> {
    Done(T),
    Cancelled,
}

async fn until_cancelled<T, F>(cancel: &CancellationToken, future: F) -> Step<T>
where
    F: Future<Output = T>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Step::Cancelled,
        output = future => Step::Done(output),
    }
}

/// Transport over a lease-based polling queue
pub struct StorageQueueTransport {
    uri: TransportUri,
    backend: Arc<dyn QueueBackend>,
    receive_options: ReceiveOptions,
    observers: ObserverSet,
    state: Mutex<TransportState>,
}

impl StorageQueueTransport {
    /// Create a transport over `backend`
    pub fn new(
        uri: TransportUri,
        backend: Arc<dyn QueueBackend>,
        receive_options: ReceiveOptions,
        observers: ObserverSet,
    ) -> Self {
        Self {
            uri,
            backend,
            receive_options,
            observers,
            state: Mutex::new(TransportState::default()),
        }
    }

    pub fn receive_options(&self) -> &ReceiveOptions {
        &self.receive_options
    }

    /// Number of leases currently held, waiting for the gate
    pub async fn outstanding_leases(&self) -> usize {
        self.state.lock().await.leases.len()
    }

    /// Number of fetched messages not yet delivered, waiting for the gate
    pub async fn buffered_messages(&self) -> usize {
        self.state.lock().await.buffer.len()
    }

    pub async fn is_disposed(&self) -> bool {
        self.state.lock().await.disposed
    }

    fn emit(&self, event: TransportEvent) {
        self.observers.emit(&self.uri, event);
    }

    /// Wait for the gate; `None` when cancelled first
    async fn acquire(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Option<MutexGuard<'_, TransportState>>, TransportError> {
        let guard = match until_cancelled(cancel, self.state.lock()).await {
            Step::Done(guard) => guard,
            Step::Cancelled => return Ok(None),
        };

        if guard.disposed {
            return Err(TransportError::Disposed {
                uri: self.uri.to_string(),
            });
        }

        Ok(Some(guard))
    }

    /// Shared shape of create, drop and purge
    async fn queue_operation<F>(
        &self,
        operation: Operation,
        cancel: &CancellationToken,
        call: F,
    ) -> Result<(), TransportError>
    where
        F: Future<Output = Result<(), TransportError>> + Send,
    {
        self.emit(TransportEvent::Starting(operation));

        let outcome = match self.acquire(cancel).await? {
            Some(_guard) => until_cancelled(cancel, call).await,
            None => Step::Cancelled,
        };

        match outcome {
            Step::Done(result) => result?,
            Step::Cancelled => self.emit(TransportEvent::Cancelled(operation)),
        }

        self.emit(TransportEvent::Completed(operation));
        Ok(())
    }

    /// Lease carried by `token` if this transport still holds it
    fn current_lease<'a>(
        &self,
        state: &TransportState,
        token: &'a AcknowledgementToken,
    ) -> Option<&'a Lease> {
        let lease = token.lease()?;
        if state.leases.is_current(lease) {
            Some(lease)
        } else {
            debug!(
                queue = %self.uri,
                message_id = %lease.id(),
                "Ignoring token for a lease this transport no longer holds"
            );
            None
        }
    }
}

#[async_trait]
impl Transport for StorageQueueTransport {
    fn uri(&self) -> &TransportUri {
        &self.uri
    }

    async fn create(&self, cancel: &CancellationToken) -> Result<(), TransportError> {
        info!(queue = %self.uri, "Creating queue");
        self.queue_operation(Operation::Create, cancel, self.backend.create_if_not_exists())
            .await
    }

    async fn drop_queue(&self, cancel: &CancellationToken) -> Result<(), TransportError> {
        info!(queue = %self.uri, "Dropping queue");
        self.queue_operation(Operation::Drop, cancel, self.backend.delete_if_exists())
            .await
    }

    async fn purge(&self, cancel: &CancellationToken) -> Result<(), TransportError> {
        info!(queue = %self.uri, "Purging queue");
        self.queue_operation(Operation::Purge, cancel, self.backend.clear())
            .await
    }

    async fn has_pending(&self, cancel: &CancellationToken) -> Result<bool, TransportError> {
        self.emit(TransportEvent::Starting(Operation::HasPending));

        let outcome = match self.acquire(cancel).await? {
            Some(_guard) => until_cancelled(cancel, self.backend.approximate_message_count()).await,
            None => Step::Cancelled,
        };

        match outcome {
            Step::Done(count) => {
                let result = count? > 0;
                self.emit(TransportEvent::HasPending { result });
                Ok(result)
            }
            Step::Cancelled => {
                self.emit(TransportEvent::HasPendingCancelled { result: true });
                Ok(true)
            }
        }
    }

    async fn send(
        &self,
        message: &TransportMessage,
        payload: Bytes,
        cancel: &CancellationToken,
    ) -> Result<(), TransportError> {
        let text = encode_payload(&payload);

        let Some(_guard) = self.acquire(cancel).await? else {
            self.emit(TransportEvent::Cancelled(Operation::Enqueue));
            return Ok(());
        };

        match until_cancelled(cancel, self.backend.send(&text, MessageTimeToLive::Infinite)).await {
            Step::Done(result) => {
                result?;
                self.emit(TransportEvent::MessageSent {
                    message: message.clone(),
                    payload,
                });
            }
            Step::Cancelled => self.emit(TransportEvent::Cancelled(Operation::Enqueue)),
        }

        Ok(())
    }

    async fn receive(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Option<ReceivedMessage>, TransportError> {
        let Some(mut state) = self.acquire(cancel).await? else {
            self.emit(TransportEvent::Cancelled(Operation::Receive));
            return Ok(None);
        };

        if state.buffer.is_empty() {
            let fetch = self.backend.receive_batch(
                self.receive_options.max_messages,
                self.receive_options.visibility_timeout,
            );

            let fetched = match until_cancelled(cancel, fetch).await {
                Step::Done(result) => result?,
                Step::Cancelled => {
                    self.emit(TransportEvent::Cancelled(Operation::Receive));
                    return Ok(None);
                }
            };

            debug!(queue = %self.uri, count = fetched.len(), "Fetched message batch");

            let mut batch = Vec::with_capacity(fetched.len());
            for message in fetched {
                // Undecodable messages are left leased and reappear after the visibility timeout
                let payload = match decode_payload(&message.text) {
                    Ok(payload) => payload,
                    Err(e) => {
                        warn!(
                            queue = %self.uri,
                            message_id = %message.id,
                            dequeue_count = message.dequeue_count,
                            error = %e,
                            "Skipping message with undecodable payload"
                        );
                        continue;
                    }
                };

                let lease = Lease::from(message);
                if state.leases.put(lease.clone()) {
                    self.emit(TransportEvent::Refreshed {
                        message_id: lease.id().to_string(),
                    });
                }

                batch.push(ReceivedMessage::new(payload, AcknowledgementToken::from(lease)));
            }

            state.buffer.extend(batch);
        }

        let message = state.buffer.pop_front();
        if let Some(message) = &message {
            self.emit(TransportEvent::MessageReceived {
                message: message.clone(),
            });
        }

        Ok(message)
    }

    async fn acknowledge(
        &self,
        token: &AcknowledgementToken,
        cancel: &CancellationToken,
    ) -> Result<(), TransportError> {
        if token.lease().is_none() {
            debug!(queue = %self.uri, "Ignoring unrecognized acknowledgement token");
            return Ok(());
        }

        let Some(mut state) = self.acquire(cancel).await? else {
            self.emit(TransportEvent::Cancelled(Operation::Acknowledge));
            return Ok(());
        };

        let Some(lease) = self.current_lease(&state, token) else {
            return Ok(());
        };

        let outcome = until_cancelled(
            cancel,
            self.backend.delete(lease.id(), lease.lease_receipt()),
        )
        .await;

        let result = match outcome {
            Step::Done(Ok(())) => {
                self.emit(TransportEvent::MessageAcknowledged {
                    token: token.clone(),
                });
                Ok(())
            }
            Step::Done(Err(e)) => Err(e),
            Step::Cancelled => {
                self.emit(TransportEvent::Cancelled(Operation::Acknowledge));
                Ok(())
            }
        };

        state.leases.remove(lease.id());
        result
    }

    async fn release(
        &self,
        token: &AcknowledgementToken,
        cancel: &CancellationToken,
    ) -> Result<(), TransportError> {
        if token.lease().is_none() {
            debug!(queue = %self.uri, "Ignoring unrecognized acknowledgement token");
            return Ok(());
        }

        let Some(mut state) = self.acquire(cancel).await? else {
            self.emit(TransportEvent::Cancelled(Operation::Release));
            return Ok(());
        };

        let Some(lease) = self.current_lease(&state, token) else {
            return Ok(());
        };

        let requeue = async {
            self.backend
                .send(lease.payload_text(), MessageTimeToLive::Default)
                .await?;
            self.backend.delete(lease.id(), lease.lease_receipt()).await
        };

        let result = match until_cancelled(cancel, requeue).await {
            Step::Done(Ok(())) => {
                self.emit(TransportEvent::MessageReleased {
                    token: token.clone(),
                });
                Ok(())
            }
            Step::Done(Err(e)) => Err(e),
            Step::Cancelled => {
                self.emit(TransportEvent::Cancelled(Operation::Release));
                Ok(())
            }
        };

        state.leases.remove(lease.id());
        result
    }

    async fn dispose(&self) {
        let mut state = self.state.lock().await;
        if state.disposed {
            return;
        }

        state.disposed = true;
        state.buffer.clear();

        if !state.leases.is_empty() {
            info!(
                queue = %self.uri,
                count = state.leases.len(),
                "Returning outstanding leases to the queue"
            );
        }

        for lease in state.leases.values() {
            if let Err(e) = self
                .backend
                .send(lease.payload_text(), MessageTimeToLive::Default)
                .await
            {
                warn!(
                    queue = %self.uri,
                    message_id = %lease.id(),
                    error = %e,
                    "Failed to re-publish leased message during dispose"
                );
                continue;
            }

            if let Err(e) = self.backend.delete(lease.id(), lease.lease_receipt()).await {
                warn!(
                    queue = %self.uri,
                    message_id = %lease.id(),
                    error = %e,
                    "Failed to delete original leased message during dispose"
                );
            }
        }

        state.leases.clear();
    }
}

impl Drop for StorageQueueTransport {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        if !state.disposed && !state.leases.is_empty() {
            warn!(
                queue = %self.uri,
                outstanding = state.leases.len(),
                "Transport dropped without dispose; leased messages reappear after their visibility timeout"
            );
        }
    }
}

impl std::fmt::Debug for StorageQueueTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageQueueTransport")
            .field("uri", &self.uri)
            .field("receive_options", &self.receive_options)
            .field("observers", &self.observers)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[path = "transport_tests.rs"]
mod tests;
