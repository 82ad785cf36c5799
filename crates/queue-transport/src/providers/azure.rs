//! Azure Queue Storage backend over the REST API.
//!
//! This module talks to the Queue service directly with `reqwest`:
//! - Shared Key request signing (HMAC-SHA256) for connection strings with an account key
//! - SAS query tokens for connection strings with a shared access signature
//! - Azure AD bearer tokens for a bare storage account name
//!
//! ## Connection strings
//!
//! The usual storage connection string keys are understood:
//! `DefaultEndpointsProtocol`, `AccountName`, `AccountKey`, `EndpointSuffix`,
//! `QueueEndpoint`, `SharedAccessSignature` and `UseDevelopmentStorage=true`.
//!
//! ## References
//!
//! - [Queue Service REST API](https://learn.microsoft.com/rest/api/storageservices/queue-service-rest-api)
//! - [Authorize with Shared Key](https://learn.microsoft.com/rest/api/storageservices/authorize-with-shared-key)

use crate::backend::{LeaseMessage, MessageTimeToLive, QueueBackend};
use crate::error::{ConfigurationError, SerializationError, TransportError};
use crate::message::QueueName;
use crate::options::{ClientConfigurator, StorageQueueOptions};
use async_trait::async_trait;
use azure_core::auth::TokenCredential;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::Utc;
use hmac::{Hmac, Mac};
use reqwest::header::HeaderMap;
use reqwest::{Client as HttpClient, Method, StatusCode};
use sha2::Sha256;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument};
use url::Url;

#[cfg(test)]
#[path = "azure_tests.rs"]
mod tests;

const PROVIDER: &str = "AzureStorageQueue";

/// REST API version sent with every request
pub const API_VERSION: &str = "2021-08-06";

/// Largest message text the service accepts
pub const MAX_MESSAGE_TEXT_BYTES: usize = 64 * 1024;

/// OAuth scope for storage data plane tokens
const STORAGE_SCOPE: &str = "https://storage.azure.com/.default";

const DEV_STORAGE_ACCOUNT: &str = "devstoreaccount1";
const DEV_STORAGE_KEY: &str =
    "Eby8vdM02xNOcqFlqUwJPLlmEtlCDXJ1OUzFT50uSRZ6IFsuFq2UVErCz4I6tq/K1SZFPTOtr/KBHBeksoGMGw==";
const DEV_STORAGE_QUEUE_ENDPOINT: &str = "http://127.0.0.1:10001/devstoreaccount1";

// ============================================================================
// Error Types
// ============================================================================

/// Azure Queue Storage specific errors
#[derive(Debug, thiserror::Error)]
pub enum AzureError {
    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    #[error("Queue not found: {0}")]
    QueueNotFound(String),

    #[error("Message not found: {0}")]
    MessageNotFound(String),

    #[error("Pop receipt mismatch: {0}")]
    PopReceiptMismatch(String),

    #[error("Message too large: {size} bytes (max: {max_size})")]
    MessageTooLarge { size: usize, max_size: usize },

    #[error("Storage service error ({status}): {code} - {message}")]
    ServiceError {
        status: u16,
        code: String,
        message: String,
    },

    #[error("Invalid configuration: {0}")]
    ConfigurationError(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),
}

impl AzureError {
    /// Check if error is transient and should be retried
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Authentication(_) => false,
            Self::NetworkError(_) => true,
            Self::Timeout(_) => true,
            Self::QueueNotFound(_) => false,
            Self::MessageNotFound(_) => false,
            Self::PopReceiptMismatch(_) => false,
            Self::MessageTooLarge { .. } => false,
            Self::ServiceError { status, .. } => *status >= 500 || *status == 408 || *status == 429,
            Self::ConfigurationError(_) => false,
            Self::SerializationError(_) => false,
        }
    }

    /// Map Azure error to TransportError
    pub fn to_transport_error(self) -> TransportError {
        match self {
            Self::Authentication(message) => TransportError::AuthenticationFailed { message },
            Self::NetworkError(message) => TransportError::ConnectionFailed { message },
            Self::Timeout(duration) => TransportError::Timeout { duration },
            Self::QueueNotFound(queue_name) => TransportError::QueueNotFound { queue_name },
            Self::MessageNotFound(message_id) => TransportError::MessageNotFound { message_id },
            Self::PopReceiptMismatch(message_id) => TransportError::LeaseLost { message_id },
            Self::MessageTooLarge { size, max_size } => {
                TransportError::MessageTooLarge { size, max_size }
            }
            Self::ServiceError { code, message, .. } => TransportError::ProviderError {
                provider: PROVIDER.to_string(),
                code,
                message,
            },
            Self::ConfigurationError(message) => {
                TransportError::ConfigurationError(ConfigurationError::Invalid { message })
            }
            Self::SerializationError(message) => {
                TransportError::SerializationError(SerializationError::InvalidXml { message })
            }
        }
    }
}

impl From<AzureError> for TransportError {
    fn from(error: AzureError) -> Self {
        error.to_transport_error()
    }
}

// ============================================================================
// Connection Strings
// ============================================================================

/// Parsed storage account connection string
#[derive(Clone, PartialEq, Eq)]
pub struct StorageConnectionString {
    pub account_name: Option<String>,
    pub account_key: Option<String>,
    pub shared_access_signature: Option<String>,
    pub queue_endpoint: Url,
}

impl StorageConnectionString {
    /// Parse a `Key=Value;Key=Value` connection string
    pub fn parse(connection_string: &str) -> Result<Self, AzureError> {
        let mut protocol = None;
        let mut account_name = None;
        let mut account_key = None;
        let mut endpoint_suffix = None;
        let mut queue_endpoint = None;
        let mut shared_access_signature = None;
        let mut development = false;

        for part in connection_string.split(';').map(str::trim) {
            if part.is_empty() {
                continue;
            }

            let (key, value) = part.split_once('=').ok_or_else(|| {
                AzureError::ConfigurationError(format!(
                    "connection string segment '{}' is not a Key=Value pair",
                    key_only(part)
                ))
            })?;
            let value = value.trim().to_string();

            match key.trim().to_ascii_lowercase().as_str() {
                "defaultendpointsprotocol" => protocol = Some(value),
                "accountname" => account_name = Some(value),
                "accountkey" => account_key = Some(value),
                "endpointsuffix" => endpoint_suffix = Some(value),
                "queueendpoint" => queue_endpoint = Some(value),
                "sharedaccesssignature" => {
                    shared_access_signature = Some(value.trim_start_matches('?').to_string())
                }
                "usedevelopmentstorage" => development = value.eq_ignore_ascii_case("true"),
                other => debug!(key = other, "Ignoring connection string key"),
            }
        }

        if development {
            return Ok(Self {
                account_name: Some(DEV_STORAGE_ACCOUNT.to_string()),
                account_key: Some(DEV_STORAGE_KEY.to_string()),
                shared_access_signature: None,
                queue_endpoint: parse_endpoint(DEV_STORAGE_QUEUE_ENDPOINT)?,
            });
        }

        let queue_endpoint = match queue_endpoint {
            Some(endpoint) => parse_endpoint(&endpoint)?,
            None => {
                let account = account_name.as_deref().ok_or_else(|| {
                    AzureError::ConfigurationError(
                        "connection string requires AccountName or QueueEndpoint".to_string(),
                    )
                })?;
                parse_endpoint(&format!(
                    "{}://{}.queue.{}",
                    protocol.as_deref().unwrap_or("https"),
                    account,
                    endpoint_suffix.as_deref().unwrap_or("core.windows.net")
                ))?
            }
        };

        if account_key.is_some() && account_name.is_none() {
            return Err(AzureError::ConfigurationError(
                "connection string has AccountKey without AccountName".to_string(),
            ));
        }

        if account_key.is_none() && shared_access_signature.is_none() {
            return Err(AzureError::ConfigurationError(
                "connection string requires AccountKey or SharedAccessSignature".to_string(),
            ));
        }

        Ok(Self {
            account_name,
            account_key,
            shared_access_signature,
            queue_endpoint,
        })
    }
}

/// Key of a malformed segment, so secrets never reach error messages
fn key_only(segment: &str) -> &str {
    segment.split('=').next().unwrap_or_default()
}

fn parse_endpoint(endpoint: &str) -> Result<Url, AzureError> {
    let url = Url::parse(endpoint)
        .map_err(|e| AzureError::ConfigurationError(format!("invalid queue endpoint: {}", e)))?;

    if url.cannot_be_a_base() {
        return Err(AzureError::ConfigurationError(format!(
            "queue endpoint '{}' is not a base URL",
            endpoint
        )));
    }

    Ok(url)
}

impl fmt::Debug for StorageConnectionString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StorageConnectionString")
            .field("account_name", &self.account_name)
            .field("account_key", &self.account_key.as_ref().map(|_| "<redacted>"))
            .field(
                "shared_access_signature",
                &self.shared_access_signature.as_ref().map(|_| "<redacted>"),
            )
            .field("queue_endpoint", &self.queue_endpoint.as_str())
            .finish()
    }
}

// ============================================================================
// Shared Key Signing
// ============================================================================

type HmacSha256 = Hmac<Sha256>;

/// Shared Key signer for storage requests
///
/// The string to sign is the verb, twelve standard header slots (only
/// Content-Length and Content-Type are ever populated here), the canonicalized
/// `x-ms-*` headers and the canonicalized resource.
#[derive(Clone)]
pub struct SharedKeySigner {
    account: String,
    key: Vec<u8>,
}

impl SharedKeySigner {
    /// Create from an account name and its base64 account key
    pub fn new(account: impl Into<String>, account_key: &str) -> Result<Self, AzureError> {
        let key = STANDARD.decode(account_key.trim()).map_err(|_| {
            AzureError::ConfigurationError("AccountKey is not valid base64".to_string())
        })?;

        Ok(Self {
            account: account.into(),
            key,
        })
    }

    pub fn account(&self) -> &str {
        &self.account
    }

    /// Build the canonical string for a request
    pub fn string_to_sign(
        &self,
        method: &Method,
        url: &Url,
        ms_headers: &[(&str, &str)],
        content_length: usize,
        content_type: &str,
    ) -> String {
        let content_length = if content_length == 0 {
            String::new()
        } else {
            content_length.to_string()
        };

        let mut headers: Vec<(String, &str)> = ms_headers
            .iter()
            .map(|(name, value)| (name.to_ascii_lowercase(), value.trim()))
            .collect();
        headers.sort_by(|a, b| a.0.cmp(&b.0));
        let canonical_headers: String = headers
            .iter()
            .map(|(name, value)| format!("{}:{}\n", name, value))
            .collect();

        let mut params: Vec<(String, String)> = url
            .query_pairs()
            .map(|(k, v)| (k.to_ascii_lowercase(), v.into_owned()))
            .collect();
        params.sort();

        let mut canonical_resource = format!("/{}{}", self.account, url.path());
        let mut index = 0;
        while index < params.len() {
            let name = &params[index].0;
            let values: Vec<&str> = params[index..]
                .iter()
                .take_while(|(n, _)| n == name)
                .map(|(_, v)| v.as_str())
                .collect();
            index += values.len();
            canonical_resource.push_str(&format!("\n{}:{}", name, values.join(",")));
        }

        format!(
            "{}\n\n\n{}\n\n{}\n\n\n\n\n\n\n{}{}",
            method.as_str(),
            content_length,
            content_type,
            canonical_headers,
            canonical_resource
        )
    }

    /// Sign a canonical string, returning the base64 signature
    pub fn sign(&self, string_to_sign: &str) -> Result<String, AzureError> {
        let mut mac = HmacSha256::new_from_slice(&self.key)
            .map_err(|e| AzureError::ConfigurationError(format!("invalid account key: {}", e)))?;
        mac.update(string_to_sign.as_bytes());
        Ok(STANDARD.encode(mac.finalize().into_bytes()))
    }

    /// `Authorization` header value for a request
    pub fn authorization(
        &self,
        method: &Method,
        url: &Url,
        ms_headers: &[(&str, &str)],
        content_length: usize,
        content_type: &str,
    ) -> Result<String, AzureError> {
        let string_to_sign =
            self.string_to_sign(method, url, ms_headers, content_length, content_type);
        Ok(format!("SharedKey {}:{}", self.account, self.sign(&string_to_sign)?))
    }
}

/// How requests to the queue service are authorized
#[derive(Clone)]
pub enum StorageCredential {
    SharedKey(SharedKeySigner),
    Sas(String),
    Token(Arc<dyn TokenCredential>),
}

impl fmt::Debug for StorageCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SharedKey(signer) => write!(f, "SharedKey({})", signer.account()),
            Self::Sas(_) => write!(f, "Sas(<redacted>)"),
            Self::Token(_) => write!(f, "Token"),
        }
    }
}

// ============================================================================
// Azure Storage Queue Backend
// ============================================================================

fn connection_string_credential(
    connection_string: &str,
) -> Result<(Url, StorageCredential), AzureError> {
    let parsed = StorageConnectionString::parse(connection_string)?;

    let credential = match (&parsed.account_name, &parsed.account_key) {
        (Some(account), Some(key)) => {
            StorageCredential::SharedKey(SharedKeySigner::new(account.clone(), key)?)
        }
        _ => match parsed.shared_access_signature {
            Some(sas) => StorageCredential::Sas(sas),
            None => {
                return Err(AzureError::ConfigurationError(
                    "connection string carries no usable credential".to_string(),
                ))
            }
        },
    };

    Ok((parsed.queue_endpoint, credential))
}

fn storage_account_credential(
    storage_account: &str,
) -> Result<(Url, StorageCredential), AzureError> {
    let endpoint = parse_endpoint(&format!(
        "https://{}.queue.core.windows.net",
        storage_account.trim()
    ))?;

    let credential = azure_identity::create_credential().map_err(|e| {
        AzureError::Authentication(format!("Failed to create Azure credential: {}", e))
    })?;

    Ok((endpoint, StorageCredential::Token(credential)))
}

struct StorageResponse {
    status: StatusCode,
    headers: HeaderMap,
    body: String,
}

/// One storage queue accessed over the REST API
///
/// Thread-safe; share it between transports with `Arc`.
pub struct AzureStorageQueueBackend {
    http_client: HttpClient,
    queue_endpoint: Url,
    queue_name: QueueName,
    credential: StorageCredential,
    request_timeout: Duration,
}

impl AzureStorageQueueBackend {
    /// Create backend with an explicit credential
    pub fn new(
        queue_endpoint: Url,
        queue_name: QueueName,
        credential: StorageCredential,
        request_timeout: Duration,
    ) -> Result<Self, AzureError> {
        Self::with_client_configurator(
            queue_endpoint,
            queue_name,
            credential,
            request_timeout,
            &ClientConfigurator::default(),
        )
    }

    /// Create backend whose HTTP client is customised by `configurator`
    pub fn with_client_configurator(
        queue_endpoint: Url,
        queue_name: QueueName,
        credential: StorageCredential,
        request_timeout: Duration,
        configurator: &ClientConfigurator,
    ) -> Result<Self, AzureError> {
        let http_client = configurator
            .apply(HttpClient::builder().timeout(request_timeout))
            .build()
            .map_err(|e| AzureError::NetworkError(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            http_client,
            queue_endpoint,
            queue_name,
            credential,
            request_timeout,
        })
    }

    /// Create backend from a storage connection string
    pub fn from_connection_string(
        connection_string: &str,
        queue_name: QueueName,
        request_timeout: Duration,
    ) -> Result<Self, AzureError> {
        let (endpoint, credential) = connection_string_credential(connection_string)?;
        Self::new(endpoint, queue_name, credential, request_timeout)
    }

    /// Create backend for a storage account authenticated through Azure AD
    pub fn from_storage_account(
        storage_account: &str,
        queue_name: QueueName,
        request_timeout: Duration,
    ) -> Result<Self, AzureError> {
        let (endpoint, credential) = storage_account_credential(storage_account)?;
        Self::new(endpoint, queue_name, credential, request_timeout)
    }

    /// Create backend from transport options
    ///
    /// A configured storage account takes precedence over a connection string.
    pub fn from_options(
        options: &StorageQueueOptions,
        queue_name: QueueName,
    ) -> Result<Self, AzureError> {
        Self::from_options_with(options, queue_name, &ClientConfigurator::default())
    }

    /// Create backend from transport options with a customised HTTP client
    pub fn from_options_with(
        options: &StorageQueueOptions,
        queue_name: QueueName,
        configurator: &ClientConfigurator,
    ) -> Result<Self, AzureError> {
        let account = options
            .storage_account
            .as_deref()
            .filter(|a| !a.trim().is_empty());
        let connection_string = options
            .connection_string
            .as_deref()
            .filter(|c| !c.trim().is_empty());

        let (endpoint, credential) = match (account, connection_string) {
            (Some(account), _) => storage_account_credential(account)?,
            (None, Some(connection_string)) => connection_string_credential(connection_string)?,
            (None, None) => {
                return Err(AzureError::ConfigurationError(
                    "either a connection string or a storage account is required".to_string(),
                ))
            }
        };

        Self::with_client_configurator(
            endpoint,
            queue_name,
            credential,
            options.request_timeout(),
            configurator,
        )
    }

    pub fn queue_name(&self) -> &QueueName {
        &self.queue_name
    }

    pub fn queue_endpoint(&self) -> &Url {
        &self.queue_endpoint
    }

    /// URL of the queue, or of a sub-resource such as `messages/{id}`
    fn resource_url(&self, segments: &[&str], query: &[(&str, String)]) -> Result<Url, AzureError> {
        let mut url = self.queue_endpoint.clone();
        url.path_segments_mut()
            .map_err(|_| {
                AzureError::ConfigurationError("queue endpoint is not a base URL".to_string())
            })?
            .pop_if_empty()
            .push(self.queue_name.as_str())
            .extend(segments);

        let mut serializer = url::form_urlencoded::Serializer::new(String::new());
        for (key, value) in query {
            serializer.append_pair(key, value);
        }
        let mut query_string = serializer.finish();

        if let StorageCredential::Sas(sas) = &self.credential {
            if !query_string.is_empty() {
                query_string.push('&');
            }
            query_string.push_str(sas);
        }

        url.set_query(if query_string.is_empty() {
            None
        } else {
            Some(&query_string)
        });

        Ok(url)
    }

    /// Send an authorized request, turning non-success responses into errors
    #[instrument(skip(self, query, body), fields(queue = %self.queue_name))]
    async fn make_request(
        &self,
        method: Method,
        segments: &[&str],
        query: &[(&str, String)],
        body: Option<String>,
    ) -> Result<StorageResponse, AzureError> {
        let url = self.resource_url(segments, query)?;
        let date = Utc::now().format("%a, %d %b %Y %H:%M:%S GMT").to_string();
        let content_length = body.as_ref().map_or(0, String::len);
        let content_type = if body.is_some() { "application/xml" } else { "" };

        let mut request = self
            .http_client
            .request(method.clone(), url.clone())
            .header("x-ms-date", &date)
            .header("x-ms-version", API_VERSION);

        match &self.credential {
            StorageCredential::SharedKey(signer) => {
                let authorization = signer.authorization(
                    &method,
                    &url,
                    &[("x-ms-date", date.as_str()), ("x-ms-version", API_VERSION)],
                    content_length,
                    content_type,
                )?;
                request = request.header("Authorization", authorization);
            }
            StorageCredential::Sas(_) => {}
            StorageCredential::Token(credential) => {
                let token = credential.get_token(&[STORAGE_SCOPE]).await.map_err(|e| {
                    AzureError::Authentication(format!("Failed to acquire storage token: {}", e))
                })?;
                request = request.bearer_auth(token.token.secret());
            }
        }

        if let Some(body) = body {
            request = request.header("Content-Type", content_type).body(body);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                AzureError::Timeout(self.request_timeout)
            } else if e.is_connect() {
                AzureError::NetworkError(format!("Connection failed: {}", e))
            } else {
                AzureError::NetworkError(format!("HTTP request failed: {}", e))
            }
        })?;

        let status = response.status();
        let headers = response.headers().clone();
        let body = response
            .text()
            .await
            .map_err(|e| AzureError::NetworkError(format!("Failed to read response body: {}", e)))?;

        if !status.is_success() {
            return Err(self.parse_error_response(status, &headers, &body));
        }

        debug!(status = status.as_u16(), "Storage request succeeded");

        Ok(StorageResponse {
            status,
            headers,
            body,
        })
    }

    /// Map an error response using `x-ms-error-code`, falling back to the XML body
    fn parse_error_response(&self, status: StatusCode, headers: &HeaderMap, xml: &str) -> AzureError {
        let (xml_code, message) = parse_error_body(xml);
        let code = headers
            .get("x-ms-error-code")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .or(xml_code)
            .unwrap_or_else(|| "Unknown".to_string());
        let message = message.unwrap_or_else(|| {
            status
                .canonical_reason()
                .unwrap_or("Unknown error")
                .to_string()
        });

        match code.as_str() {
            "QueueNotFound" | "QueueBeingDeleted" => {
                AzureError::QueueNotFound(self.queue_name.to_string())
            }
            "MessageNotFound" => AzureError::MessageNotFound(message),
            "PopReceiptMismatch" => AzureError::PopReceiptMismatch(message),
            "AuthenticationFailed" | "AuthorizationFailure" | "InvalidAuthenticationInfo" => {
                AzureError::Authentication(format!("{}: {}", code, message))
            }
            "RequestBodyTooLarge" | "MessageTooLarge" => AzureError::MessageTooLarge {
                size: 0,
                max_size: MAX_MESSAGE_TEXT_BYTES,
            },
            _ if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN => {
                AzureError::Authentication(format!("{}: {}", code, message))
            }
            _ => AzureError::ServiceError {
                status: status.as_u16(),
                code,
                message,
            },
        }
    }
}

impl fmt::Debug for AzureStorageQueueBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AzureStorageQueueBackend")
            .field("queue_endpoint", &self.queue_endpoint.as_str())
            .field("queue_name", &self.queue_name)
            .field("credential", &self.credential)
            .finish()
    }
}

// ============================================================================
// XML Payloads
// ============================================================================

/// Body of a Put Message request
fn message_body(text: &str) -> String {
    format!(
        "<QueueMessage><MessageText>{}</MessageText></QueueMessage>",
        quick_xml::escape::escape(text)
    )
}

/// Extract `<Error><Code>` and `<Message>` from an error body
fn parse_error_body(xml: &str) -> (Option<String>, Option<String>) {
    use quick_xml::events::Event;
    use quick_xml::Reader;

    let mut reader = Reader::from_str(xml);
    reader.trim_text(true);

    let mut error_code = None;
    let mut error_message = None;
    let mut in_error = false;
    let mut in_code = false;
    let mut in_message = false;
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(ref e)) => match e.name().as_ref() {
                b"Error" => in_error = true,
                b"Code" if in_error => in_code = true,
                b"Message" if in_error => in_message = true,
                _ => {}
            },
            Ok(Event::Text(e)) => {
                if in_code {
                    error_code = e.unescape().ok().map(|s| s.into_owned());
                    in_code = false;
                } else if in_message {
                    error_message = e.unescape().ok().map(|s| s.into_owned());
                    in_message = false;
                }
            }
            Ok(Event::End(ref e)) if e.name().as_ref() == b"Error" => {
                in_error = false;
            }
            Ok(Event::Eof) => break,
            Err(_) => break,
            _ => {}
        }
        buf.clear();
    }

    // The service appends request ids on following lines
    let error_message = error_message.map(|m| m.lines().next().unwrap_or_default().to_string());

    (error_code, error_message)
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum MessageField {
    MessageId,
    PopReceipt,
    DequeueCount,
    MessageText,
}

/// Parse a Get Messages response
fn parse_receive_response(xml: &str) -> Result<Vec<LeaseMessage>, AzureError> {
    use quick_xml::events::Event;
    use quick_xml::Reader;

    let mut reader = Reader::from_str(xml);
    reader.trim_text(true);

    let mut messages = Vec::new();
    let mut in_message = false;
    let mut field: Option<MessageField> = None;

    let mut id: Option<String> = None;
    let mut receipt: Option<String> = None;
    let mut dequeue_count: u32 = 0;
    let mut text = String::new();

    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(ref e)) => match e.name().as_ref() {
                b"QueueMessage" => {
                    in_message = true;
                    id = None;
                    receipt = None;
                    dequeue_count = 0;
                    text.clear();
                }
                b"MessageId" if in_message => field = Some(MessageField::MessageId),
                b"PopReceipt" if in_message => field = Some(MessageField::PopReceipt),
                b"DequeueCount" if in_message => field = Some(MessageField::DequeueCount),
                b"MessageText" if in_message => field = Some(MessageField::MessageText),
                _ => field = None,
            },
            Ok(Event::Text(e)) => {
                if let Some(current) = field {
                    let value = e
                        .unescape()
                        .map_err(|e| {
                            AzureError::SerializationError(format!("Failed to parse XML: {}", e))
                        })?
                        .into_owned();
                    match current {
                        MessageField::MessageId => id = Some(value),
                        MessageField::PopReceipt => receipt = Some(value),
                        MessageField::DequeueCount => dequeue_count = value.parse().unwrap_or(0),
                        MessageField::MessageText => text = value,
                    }
                }
            }
            Ok(Event::End(ref e)) => {
                field = None;
                if e.name().as_ref() == b"QueueMessage" {
                    in_message = false;
                    let id = id.take().ok_or_else(|| {
                        AzureError::SerializationError("QueueMessage without MessageId".to_string())
                    })?;
                    let lease_receipt = receipt.take().ok_or_else(|| {
                        AzureError::SerializationError("QueueMessage without PopReceipt".to_string())
                    })?;
                    messages.push(LeaseMessage {
                        id,
                        text: std::mem::take(&mut text),
                        lease_receipt,
                        dequeue_count,
                    });
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => {
                return Err(AzureError::SerializationError(format!(
                    "XML parsing error: {}",
                    e
                )))
            }
            _ => {}
        }
        buf.clear();
    }

    Ok(messages)
}

// ============================================================================
// QueueBackend Implementation
// ============================================================================

#[async_trait]
impl QueueBackend for AzureStorageQueueBackend {
    async fn create_if_not_exists(&self) -> Result<(), TransportError> {
        match self.make_request(Method::PUT, &[], &[], None).await {
            Ok(response) => {
                debug!(status = response.status.as_u16(), "Queue ensured");
                Ok(())
            }
            Err(AzureError::ServiceError { code, .. }) if code == "QueueAlreadyExists" => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete_if_exists(&self) -> Result<(), TransportError> {
        match self.make_request(Method::DELETE, &[], &[], None).await {
            Ok(_) | Err(AzureError::QueueNotFound(_)) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn clear(&self) -> Result<(), TransportError> {
        self.make_request(Method::DELETE, &["messages"], &[], None)
            .await?;
        Ok(())
    }

    async fn approximate_message_count(&self) -> Result<u64, TransportError> {
        let response = self
            .make_request(Method::GET, &[], &[("comp", "metadata".to_string())], None)
            .await?;

        let count = response
            .headers
            .get("x-ms-approximate-messages-count")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok())
            .ok_or_else(|| SerializationError::MissingField {
                field: "x-ms-approximate-messages-count".to_string(),
            })?;

        Ok(count)
    }

    async fn send(&self, text: &str, ttl: MessageTimeToLive) -> Result<(), TransportError> {
        if text.len() > MAX_MESSAGE_TEXT_BYTES {
            return Err(AzureError::MessageTooLarge {
                size: text.len(),
                max_size: MAX_MESSAGE_TEXT_BYTES,
            }
            .into());
        }

        let query = match ttl {
            MessageTimeToLive::Infinite => vec![("messagettl", "-1".to_string())],
            MessageTimeToLive::Default => Vec::new(),
        };

        self.make_request(Method::POST, &["messages"], &query, Some(message_body(text)))
            .await?;
        Ok(())
    }

    async fn receive_batch(
        &self,
        max_count: u32,
        visibility_timeout: Option<Duration>,
    ) -> Result<Vec<LeaseMessage>, TransportError> {
        let mut query = vec![("numofmessages", max_count.clamp(1, 32).to_string())];
        if let Some(timeout) = visibility_timeout {
            query.push(("visibilitytimeout", timeout.as_secs().max(1).to_string()));
        }

        let response = self
            .make_request(Method::GET, &["messages"], &query, None)
            .await?;

        Ok(parse_receive_response(&response.body)?)
    }

    async fn delete(&self, id: &str, lease_receipt: &str) -> Result<(), TransportError> {
        let query = [("popreceipt", lease_receipt.to_string())];

        match self
            .make_request(Method::DELETE, &["messages", id], &query, None)
            .await
        {
            Ok(_) => Ok(()),
            Err(AzureError::PopReceiptMismatch(_)) => Err(TransportError::LeaseLost {
                message_id: id.to_string(),
            }),
            Err(AzureError::MessageNotFound(_)) => Err(TransportError::MessageNotFound {
                message_id: id.to_string(),
            }),
            Err(e) => Err(e.into()),
        }
    }
}
