//! Lifecycle events and the observers that receive them.
//!
//! The transport reports every lifecycle stage through an [`ObserverSet`]. Observers
//! run synchronously, in registration order, while the transport still holds its
//! gate, so they must not call back into the transport.

use crate::message::{AcknowledgementToken, ReceivedMessage, TransportMessage};
use crate::uri::TransportUri;
use bytes::Bytes;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

// ============================================================================
// Event Types
// ============================================================================

/// Transport operation an event belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Create,
    Drop,
    Purge,
    HasPending,
    Receive,
    Release,
    Acknowledge,
    Enqueue,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Drop => "drop",
            Self::Purge => "purge",
            Self::HasPending => "has-pending",
            Self::Receive => "receive",
            Self::Release => "release",
            Self::Acknowledge => "acknowledge",
            Self::Enqueue => "enqueue",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A lifecycle point reached by a transport
///
/// `Display` renders the stage tag, e.g. `create/starting` or `message-received`.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    Starting(Operation),
    Cancelled(Operation),
    Completed(Operation),
    HasPending { result: bool },
    HasPendingCancelled { result: bool },
    Refreshed { message_id: String },
    MessageReceived { message: ReceivedMessage },
    MessageReleased { token: AcknowledgementToken },
    MessageAcknowledged { token: AcknowledgementToken },
    MessageSent {
        message: TransportMessage,
        payload: Bytes,
    },
}

impl TransportEvent {
    /// Operation the event belongs to
    pub fn operation(&self) -> Operation {
        match self {
            Self::Starting(op) | Self::Cancelled(op) | Self::Completed(op) => *op,
            Self::HasPending { .. } | Self::HasPendingCancelled { .. } => Operation::HasPending,
            Self::Refreshed { .. } | Self::MessageReceived { .. } => Operation::Receive,
            Self::MessageReleased { .. } => Operation::Release,
            Self::MessageAcknowledged { .. } => Operation::Acknowledge,
            Self::MessageSent { .. } => Operation::Enqueue,
        }
    }

    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled(_) | Self::HasPendingCancelled { .. })
    }
}

impl fmt::Display for TransportEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Starting(op) => write!(f, "{}/starting", op),
            Self::Cancelled(op) => write!(f, "{}/cancelled", op),
            Self::Completed(op) => write!(f, "{}/completed", op),
            Self::HasPending { .. } => f.write_str("has-pending"),
            Self::HasPendingCancelled { .. } => f.write_str("has-pending/cancelled"),
            Self::Refreshed { .. } => f.write_str("receive/refreshed"),
            Self::MessageReceived { .. } => f.write_str("message-received"),
            Self::MessageReleased { .. } => f.write_str("message-released"),
            Self::MessageAcknowledged { .. } => f.write_str("message-acknowledged"),
            Self::MessageSent { .. } => f.write_str("message-sent"),
        }
    }
}

// ============================================================================
// Observers
// ============================================================================

/// Receiver of transport lifecycle events
pub trait TransportObserver: Send + Sync {
    fn on_event(&self, uri: &TransportUri, event: &TransportEvent);
}

/// Observer backed by a closure
pub struct FnObserver<F>(F);

impl<F> FnObserver<F>
where
    F: Fn(&TransportUri, &TransportEvent) + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

impl<F> TransportObserver for FnObserver<F>
where
    F: Fn(&TransportUri, &TransportEvent) + Send + Sync,
{
    fn on_event(&self, uri: &TransportUri, event: &TransportEvent) {
        (self.0)(uri, event)
    }
}

/// Observer forwarding every event into an unbounded channel
#[derive(Clone)]
pub struct ChannelObserver {
    sender: mpsc::UnboundedSender<(TransportUri, TransportEvent)>,
}

impl ChannelObserver {
    /// Create the observer and the receiving half of its channel
    pub fn new() -> (Self, mpsc::UnboundedReceiver<(TransportUri, TransportEvent)>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

impl TransportObserver for ChannelObserver {
    fn on_event(&self, uri: &TransportUri, event: &TransportEvent) {
        // A closed receiver only means nobody is listening any more
        let _ = self.sender.send((uri.clone(), event.clone()));
    }
}

/// Ordered collection of observers shared by transports
#[derive(Clone, Default)]
pub struct ObserverSet {
    observers: Vec<Arc<dyn TransportObserver>>,
}

impl ObserverSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, observer: Arc<dyn TransportObserver>) {
        self.observers.push(observer);
    }

    /// Builder form of [`ObserverSet::register`]
    pub fn with_observer(mut self, observer: Arc<dyn TransportObserver>) -> Self {
        self.register(observer);
        self
    }

    /// Register a closure as an observer
    pub fn with_fn<F>(self, f: F) -> Self
    where
        F: Fn(&TransportUri, &TransportEvent) + Send + Sync + 'static,
    {
        self.with_observer(Arc::new(FnObserver::new(f)))
    }

    pub fn len(&self) -> usize {
        self.observers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observers.is_empty()
    }

    /// Deliver an event to every observer in registration order
    pub fn emit(&self, uri: &TransportUri, event: TransportEvent) {
        debug!(queue = %uri, stage = %event, "Transport event");

        for observer in &self.observers {
            observer.on_event(uri, &event);
        }
    }
}

impl fmt::Debug for ObserverSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObserverSet")
            .field("observers", &self.observers.len())
            .finish()
    }
}

#[cfg(test)]
#[path = "events_tests.rs"]
mod tests;
