//! Storage queue options and named transport settings.

use crate::error::ConfigurationError;
use crate::message::{ReceiveOptions, MAX_BATCH_SIZE};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Environment variable prefix for transport settings
pub const ENV_PREFIX: &str = "QT";

fn default_max_messages() -> u32 {
    MAX_BATCH_SIZE
}

fn default_request_timeout_seconds() -> u64 {
    30
}

/// Options for one storage queue configuration entry
///
/// Either `connection_string` or `storage_account` must be set. When both are,
/// the storage account wins and authenticates through Azure AD.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageQueueOptions {
    pub connection_string: Option<String>,
    pub storage_account: Option<String>,
    #[serde(default = "default_max_messages")]
    pub max_messages: u32,
    pub visibility_timeout_seconds: Option<u64>,
    #[serde(default = "default_request_timeout_seconds")]
    pub request_timeout_seconds: u64,
}

impl Default for StorageQueueOptions {
    fn default() -> Self {
        Self {
            connection_string: None,
            storage_account: None,
            max_messages: default_max_messages(),
            visibility_timeout_seconds: None,
            request_timeout_seconds: default_request_timeout_seconds(),
        }
    }
}

impl StorageQueueOptions {
    /// Options using a storage connection string
    pub fn from_connection_string(connection_string: impl Into<String>) -> Self {
        Self {
            connection_string: Some(connection_string.into()),
            ..Self::default()
        }
    }

    /// Options using a storage account name and Azure AD credentials
    pub fn from_storage_account(storage_account: impl Into<String>) -> Self {
        Self {
            storage_account: Some(storage_account.into()),
            ..Self::default()
        }
    }

    pub fn with_max_messages(mut self, max_messages: u32) -> Self {
        self.max_messages = max_messages;
        self
    }

    pub fn with_visibility_timeout(mut self, timeout: Duration) -> Self {
        self.visibility_timeout_seconds = Some(timeout.as_secs());
        self
    }

    /// Check that the entry named `name` can produce a backend
    pub fn validate(&self, name: &str) -> Result<(), ConfigurationError> {
        if name.trim().is_empty() {
            return Err(ConfigurationError::Missing {
                key: "name".to_string(),
            });
        }

        if is_blank(&self.connection_string) && is_blank(&self.storage_account) {
            return Err(ConfigurationError::Invalid {
                message: format!(
                    "storage queue configuration '{}' requires either 'connection_string' or 'storage_account'",
                    name
                ),
            });
        }

        if self.request_timeout_seconds == 0 {
            return Err(ConfigurationError::Invalid {
                message: format!(
                    "storage queue configuration '{}' has a zero request timeout",
                    name
                ),
            });
        }

        Ok(())
    }

    /// Receive settings with the batch size clamped to what the backend allows
    pub fn receive_options(&self) -> ReceiveOptions {
        let options = ReceiveOptions::new().with_max_messages(self.max_messages);
        match self.visibility_timeout_seconds {
            Some(seconds) => options.with_visibility_timeout(Duration::from_secs(seconds)),
            None => options,
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_seconds)
    }
}

fn is_blank(value: &Option<String>) -> bool {
    value.as_deref().map_or(true, |v| v.trim().is_empty())
}

impl fmt::Debug for StorageQueueOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StorageQueueOptions")
            .field(
                "connection_string",
                &self.connection_string.as_ref().map(|_| "<redacted>"),
            )
            .field("storage_account", &self.storage_account)
            .field("max_messages", &self.max_messages)
            .field("visibility_timeout_seconds", &self.visibility_timeout_seconds)
            .field("request_timeout_seconds", &self.request_timeout_seconds)
            .finish()
    }
}

/// Hook that customises the HTTP client of each storage queue backend
///
/// Runs after the request timeout is applied, so it can add proxies, default
/// headers or TLS settings on top of it.
#[derive(Clone, Default)]
pub struct ClientConfigurator(
    Option<Arc<dyn Fn(reqwest::ClientBuilder) -> reqwest::ClientBuilder + Send + Sync>>,
);

impl ClientConfigurator {
    pub fn new<F>(configure: F) -> Self
    where
        F: Fn(reqwest::ClientBuilder) -> reqwest::ClientBuilder + Send + Sync + 'static,
    {
        Self(Some(Arc::new(configure)))
    }

    pub fn is_set(&self) -> bool {
        self.0.is_some()
    }

    /// Apply the hook to `builder`, or return it unchanged when none is set
    pub fn apply(&self, builder: reqwest::ClientBuilder) -> reqwest::ClientBuilder {
        match &self.0 {
            Some(configure) => configure(builder),
            None => builder,
        }
    }
}

impl fmt::Debug for ClientConfigurator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ClientConfigurator")
            .field(&if self.is_set() { "<custom>" } else { "<default>" })
            .finish()
    }
}

/// Named storage queue configurations
///
/// Loaded from an optional YAML/TOML/JSON file followed by environment variables
/// prefixed `QT__`, e.g. `QT__STORAGE_QUEUES__AZURE__CONNECTION_STRING`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportSettings {
    pub storage_queues: HashMap<String, StorageQueueOptions>,
}

impl TransportSettings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_storage_queue(mut self, name: impl Into<String>, options: StorageQueueOptions) -> Self {
        self.storage_queues.insert(name.into(), options);
        self
    }

    /// Look up a configuration entry
    ///
    /// Keys loaded through the `config` crate are lower-cased, so the lookup
    /// falls back to the lower-case form of `name`.
    pub fn storage_queue(&self, name: &str) -> Option<&StorageQueueOptions> {
        self.storage_queues
            .get(name)
            .or_else(|| self.storage_queues.get(&name.to_ascii_lowercase()))
    }

    /// Load settings from an optional file and the environment
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigurationError> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            info!(path = %path.display(), "Loading transport settings from file");
            builder = builder.add_source(config::File::from(path).required(true));
        }

        let config = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| ConfigurationError::Parsing {
                message: e.to_string(),
            })?;

        config
            .try_deserialize()
            .map_err(|e| ConfigurationError::Parsing {
                message: e.to_string(),
            })
    }
}

#[cfg(test)]
#[path = "options_tests.rs"]
mod tests;
