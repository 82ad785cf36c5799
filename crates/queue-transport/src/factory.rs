//! Construction of transports from URIs and named settings.

use crate::backend::QueueBackend;
use crate::error::{ConfigurationError, TransportError};
use crate::events::ObserverSet;
use crate::message::ReceiveOptions;
use crate::options::{ClientConfigurator, StorageQueueOptions, TransportSettings};
use crate::providers::AzureStorageQueueBackend;
use crate::transport::{StorageQueueTransport, Transport};
use crate::uri::{TransportUri, SCHEME};
use std::sync::Arc;
use tracing::info;

/// Builds transports for the URIs of one scheme
pub trait TransportFactory: Send + Sync {
    /// URI scheme this factory handles
    fn scheme(&self) -> &'static str;

    /// Build a transport for `uri`
    fn create_transport(&self, uri: &TransportUri) -> Result<Arc<dyn Transport>, TransportError>;
}

/// Factory for `azuresq://` transports
#[derive(Debug, Clone, Default)]
pub struct StorageQueueTransportFactory {
    settings: TransportSettings,
    observers: ObserverSet,
    client_configurator: ClientConfigurator,
}

impl StorageQueueTransportFactory {
    pub fn new(settings: TransportSettings) -> Self {
        Self {
            settings,
            observers: ObserverSet::new(),
            client_configurator: ClientConfigurator::default(),
        }
    }

    /// Observers attached to every transport this factory builds
    pub fn with_observers(mut self, observers: ObserverSet) -> Self {
        self.observers = observers;
        self
    }

    /// Customise the HTTP client of every backend this factory builds
    pub fn with_client_configurator(mut self, configurator: ClientConfigurator) -> Self {
        self.client_configurator = configurator;
        self
    }

    pub fn settings(&self) -> &TransportSettings {
        &self.settings
    }

    /// Resolve and validate the options named by `uri`
    pub fn options_for(&self, uri: &TransportUri) -> Result<&StorageQueueOptions, TransportError> {
        let name = uri.configuration();
        let options = self
            .settings
            .storage_queue(name)
            .ok_or_else(|| ConfigurationError::UnknownConfiguration {
                name: name.to_string(),
            })?;

        options.validate(name)?;
        Ok(options)
    }

    /// Build a transport backed by Azure Queue Storage
    pub fn create(&self, uri: &TransportUri) -> Result<StorageQueueTransport, TransportError> {
        let options = self.options_for(uri)?;
        let backend = AzureStorageQueueBackend::from_options_with(
            options,
            uri.queue().clone(),
            &self.client_configurator,
        )?;

        info!(
            queue = %uri,
            endpoint = %backend.queue_endpoint(),
            custom_client = self.client_configurator.is_set(),
            "Created storage queue transport"
        );

        Ok(StorageQueueTransport::new(
            uri.clone(),
            Arc::new(backend),
            options.receive_options(),
            self.observers.clone(),
        ))
    }

    /// Parse `uri` and build a transport for it
    pub fn create_from_str(&self, uri: &str) -> Result<StorageQueueTransport, TransportError> {
        self.create(&TransportUri::parse(uri)?)
    }

    /// Build a transport over a caller-supplied backend
    ///
    /// Receive settings come from the named configuration when one exists.
    pub fn create_with_backend(
        &self,
        uri: &TransportUri,
        backend: Arc<dyn QueueBackend>,
    ) -> StorageQueueTransport {
        let receive_options = self
            .settings
            .storage_queue(uri.configuration())
            .map(StorageQueueOptions::receive_options)
            .unwrap_or_else(ReceiveOptions::default);

        StorageQueueTransport::new(uri.clone(), backend, receive_options, self.observers.clone())
    }
}

impl TransportFactory for StorageQueueTransportFactory {
    fn scheme(&self) -> &'static str {
        SCHEME
    }

    fn create_transport(&self, uri: &TransportUri) -> Result<Arc<dyn Transport>, TransportError> {
        Ok(Arc::new(self.create(uri)?))
    }
}

#[cfg(test)]
#[path = "factory_tests.rs"]
mod tests;
