//! Queue backend implementations.

pub mod azure;
pub mod memory;

pub use azure::{AzureError, AzureStorageQueueBackend, StorageConnectionString, StorageCredential};
pub use memory::{InMemoryConfig, InMemoryQueueBackend};
