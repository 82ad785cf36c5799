//! # Queue Transport
//!
//! Lease-based polling queue transport for message-processing pipelines, with an
//! Azure Queue Storage backend and an in-memory backend.
//!
//! This library provides:
//! - A local receive buffer that batches remote fetches
//! - A lease registry tracking which delivered messages are still checked out
//! - A single exclusive gate serializing remote calls and local bookkeeping
//! - Cancellation reported through lifecycle events instead of errors
//! - Best-effort return of outstanding leases on dispose
//!
//! ## Module Organization
//!
//! - [`error`] - Error types for all transport operations
//! - [`message`] - Payloads, leases, tokens and queue names
//! - [`backend`] - The remote queue capability the transport consumes
//! - [`transport`] - The lease-managing transport
//! - [`events`] - Lifecycle events and observers
//! - [`options`] - Storage queue options and settings loading
//! - [`uri`] - `azuresq://` addressing
//! - [`factory`] - Building transports from URIs and settings
//! - [`providers`] - Azure Queue Storage and in-memory backends

pub mod backend;
pub mod buffer;
pub mod error;
pub mod events;
pub mod factory;
pub mod message;
pub mod options;
pub mod providers;
pub mod registry;
pub mod transport;
pub mod uri;

// Re-export commonly used types at crate root for convenience
pub use backend::{LeaseMessage, MessageTimeToLive, QueueBackend};
pub use buffer::ReceiveBuffer;
pub use error::{ConfigurationError, SerializationError, TransportError, ValidationError};
pub use events::{
    ChannelObserver, FnObserver, ObserverSet, Operation, TransportEvent, TransportObserver,
};
pub use factory::{StorageQueueTransportFactory, TransportFactory};
pub use message::{
    decode_payload, encode_payload, AcknowledgementToken, EnvelopeId, Lease, QueueName,
    ReceiveOptions, ReceivedMessage, TransportMessage, MAX_BATCH_SIZE,
};
pub use options::{ClientConfigurator, StorageQueueOptions, TransportSettings};
pub use providers::{AzureStorageQueueBackend, InMemoryConfig, InMemoryQueueBackend};
pub use registry::LeaseRegistry;
pub use transport::{StorageQueueTransport, Transport};
pub use uri::{TransportUri, SCHEME};

/// Cancellation handle accepted by every transport operation
pub use tokio_util::sync::CancellationToken;

#[cfg(test)]
#[path = "lib_tests.rs"]
mod tests;
