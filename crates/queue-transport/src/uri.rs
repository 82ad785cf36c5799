//! Transport addressing: `azuresq://<configuration-name>/<queue-name>`.

use crate::error::{ConfigurationError, TransportError};
use crate::message::QueueName;
use std::fmt;
use std::str::FromStr;
use url::Url;

/// URI scheme handled by the storage queue transport
pub const SCHEME: &str = "azuresq";

/// Identity of one transport instance
///
/// The host names a configuration entry in the transport settings; the single
/// path segment names the queue.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TransportUri {
    configuration: String,
    queue: QueueName,
}

impl TransportUri {
    /// Create from parts
    pub fn new(configuration: impl Into<String>, queue: QueueName) -> Result<Self, TransportError> {
        let configuration = configuration.into();
        if configuration.trim().is_empty() {
            return Err(ConfigurationError::Invalid {
                message: "transport URI must name a configuration".to_string(),
            }
            .into());
        }

        Ok(Self {
            configuration,
            queue,
        })
    }

    /// Parse `azuresq://<configuration>/<queue>`
    pub fn parse(input: &str) -> Result<Self, TransportError> {
        let url = Url::parse(input).map_err(|e| ConfigurationError::Invalid {
            message: format!("invalid transport URI '{}': {}", input, e),
        })?;

        if url.scheme() != SCHEME {
            return Err(ConfigurationError::UnsupportedScheme {
                scheme: url.scheme().to_string(),
                expected: SCHEME.to_string(),
            }
            .into());
        }

        let configuration = url.host_str().unwrap_or_default();

        let segments: Vec<&str> = url
            .path_segments()
            .map(|segments| segments.collect())
            .unwrap_or_default();

        let queue = match segments.as_slice() {
            [queue] if !queue.is_empty() => QueueName::new(queue.to_string())?,
            _ => {
                return Err(ConfigurationError::Invalid {
                    message: format!("transport URI '{}' must name exactly one queue", input),
                }
                .into())
            }
        };

        Self::new(configuration, queue)
    }

    /// Configuration entry the transport is built from
    pub fn configuration(&self) -> &str {
        &self.configuration
    }

    pub fn queue(&self) -> &QueueName {
        &self.queue
    }
}

impl fmt::Display for TransportUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}/{}", SCHEME, self.configuration, self.queue)
    }
}

impl FromStr for TransportUri {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

#[cfg(test)]
#[path = "uri_tests.rs"]
mod tests;
