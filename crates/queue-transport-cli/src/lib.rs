//! # Queue Transport CLI
//!
//! Command-line tool for inspecting and driving `azuresq://` queues through the
//! lease-based transport.
//!
//! Results are written to stdout as JSON lines; logs go to stderr.

use bytes::Bytes;
use clap::{Parser, Subcommand};
use queue_transport::{
    CancellationToken, ConfigurationError, StorageQueueTransportFactory, Transport,
    TransportError, TransportMessage, TransportSettings, TransportUri,
};
use serde_json::json;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

// ============================================================================
// CLI Structure
// ============================================================================

/// Queue Transport CLI - lease-based access to Azure storage queues
#[derive(Parser, Debug)]
#[command(name = "queue-transport")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Lease-based access to Azure storage queues")]
pub struct Cli {
    /// Settings file with named storage queue configurations
    #[arg(short, long, env = "QUEUE_TRANSPORT_CONFIG")]
    pub config: Option<PathBuf>,

    /// Logging level
    #[arg(short, long, default_value = "info")]
    pub log_level: String,

    /// Enable JSON logging
    #[arg(long)]
    pub json_logs: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available CLI commands
#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Commands {
    /// Create the queue if it does not exist
    Create {
        /// Queue address, e.g. azuresq://primary/orders
        uri: String,
    },

    /// Delete the queue if it exists
    Drop {
        /// Queue address
        uri: String,
    },

    /// Remove every message from the queue
    Purge {
        /// Queue address
        uri: String,
    },

    /// Report whether the queue holds any messages
    Pending {
        /// Queue address
        uri: String,
    },

    /// Publish one message
    Send {
        /// Queue address
        uri: String,

        /// Message body
        #[arg(short, long, conflicts_with = "file", required_unless_present = "file")]
        body: Option<String>,

        /// Read the message body from a file
        #[arg(short, long)]
        file: Option<PathBuf>,

        /// Message type recorded in the envelope
        #[arg(long, default_value = "cli")]
        message_type: String,
    },

    /// Receive messages, acknowledging each one unless --release is given
    Receive {
        /// Queue address
        uri: String,

        /// Maximum number of messages to receive
        #[arg(short = 'n', long, default_value = "1")]
        count: usize,

        /// Return messages to the queue instead of acknowledging them
        #[arg(long)]
        release: bool,
    },
}

impl Commands {
    /// Queue address the command operates on
    pub fn uri(&self) -> &str {
        match self {
            Commands::Create { uri }
            | Commands::Drop { uri }
            | Commands::Purge { uri }
            | Commands::Pending { uri }
            | Commands::Send { uri, .. }
            | Commands::Receive { uri, .. } => uri,
        }
    }
}

// ============================================================================
// CLI Error Types
// ============================================================================

/// CLI-specific errors
#[derive(Debug, thiserror::Error)]
pub enum CliError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Invalid argument: {arg} - {message}")]
    InvalidArgument { arg: String, message: String },

    #[error("Logging setup failed: {message}")]
    Logging { message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Output error: {0}")]
    Output(#[from] serde_json::Error),
}

impl From<ConfigurationError> for CliError {
    fn from(error: ConfigurationError) -> Self {
        CliError::Transport(error.into())
    }
}

impl CliError {
    /// Process exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            CliError::Transport(TransportError::ConfigurationError(_))
            | CliError::Transport(TransportError::ValidationError(_)) => 1,
            CliError::Transport(_) => 2,
            CliError::InvalidArgument { .. } | CliError::Logging { .. } => 4,
            CliError::Io(_) => 5,
            CliError::Output(_) => 6,
        }
    }
}

// ============================================================================
// Main Entry Point
// ============================================================================

/// Main CLI entry point
pub async fn run_cli() -> Result<(), CliError> {
    let cli = Cli::parse();

    initialize_logging(&cli)?;

    let settings = TransportSettings::load(cli.config.as_deref())?;
    let transport = build_transport(&settings, cli.command.uri())?;

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted; cancelling in-flight operation");
            on_interrupt.cancel();
        }
    });

    let mut out = std::io::stdout();
    let result = execute(&cli.command, transport.as_ref(), &cancel, &mut out).await;

    transport.dispose().await;
    result
}

/// Initialize logging based on CLI arguments
///
/// `RUST_LOG` takes precedence over `--log-level`.
fn initialize_logging(cli: &Cli) -> Result<(), CliError> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&cli.log_level))
        .map_err(|e| CliError::InvalidArgument {
            arg: "log-level".to_string(),
            message: e.to_string(),
        })?;

    let registry = tracing_subscriber::registry().with(filter);
    let result = if cli.json_logs {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .try_init()
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .try_init()
    };

    result.map_err(|e| CliError::Logging {
        message: e.to_string(),
    })
}

/// Resolve `uri` against the loaded settings
pub fn build_transport(
    settings: &TransportSettings,
    uri: &str,
) -> Result<Arc<dyn Transport>, CliError> {
    let uri = TransportUri::parse(uri)?;
    let factory = StorageQueueTransportFactory::new(settings.clone());
    Ok(Arc::new(factory.create(&uri)?))
}

// ============================================================================
// Command Implementations
// ============================================================================

/// Run `command` against `transport`, writing one JSON line per result to `out`
pub async fn execute<W: Write>(
    command: &Commands,
    transport: &dyn Transport,
    cancel: &CancellationToken,
    out: &mut W,
) -> Result<(), CliError> {
    let queue = transport.uri().to_string();

    match command {
        Commands::Create { .. } => {
            transport.create(cancel).await?;
            write_line(out, &json!({ "operation": "create", "queue": queue, "status": status(cancel) }))
        }
        Commands::Drop { .. } => {
            transport.drop_queue(cancel).await?;
            write_line(out, &json!({ "operation": "drop", "queue": queue, "status": status(cancel) }))
        }
        Commands::Purge { .. } => {
            transport.purge(cancel).await?;
            write_line(out, &json!({ "operation": "purge", "queue": queue, "status": status(cancel) }))
        }
        Commands::Pending { .. } => {
            let pending = transport.has_pending(cancel).await?;
            write_line(
                out,
                &json!({ "operation": "pending", "queue": queue, "pending": pending, "status": status(cancel) }),
            )
        }
        Commands::Send {
            body,
            file,
            message_type,
            ..
        } => {
            let payload = read_body(body.as_deref(), file.as_ref()).await?;
            let message = TransportMessage::new(message_type.as_str());
            let size = payload.len();

            transport.send(&message, payload, cancel).await?;
            info!(queue = %queue, message_id = %message.message_id, bytes = size, "Sent message");

            write_line(
                out,
                &json!({
                    "operation": "send",
                    "queue": queue,
                    "message_id": message.message_id.to_string(),
                    "bytes": size,
                    "status": status(cancel),
                }),
            )
        }
        Commands::Receive { count, release, .. } => {
            receive_messages(transport, *count, *release, cancel, out).await
        }
    }
}

async fn receive_messages<W: Write>(
    transport: &dyn Transport,
    count: usize,
    release: bool,
    cancel: &CancellationToken,
    out: &mut W,
) -> Result<(), CliError> {
    let queue = transport.uri().to_string();

    for _ in 0..count {
        let Some(message) = transport.receive(cancel).await? else {
            break;
        };

        let disposition = if release {
            transport.release(&message.token, cancel).await?;
            "released"
        } else {
            transport.acknowledge(&message.token, cancel).await?;
            "acknowledged"
        };

        write_line(
            out,
            &json!({
                "operation": "receive",
                "queue": queue,
                "message_id": message.message_id(),
                "payload": String::from_utf8_lossy(&message.payload),
                "disposition": disposition,
            }),
        )?;
    }

    Ok(())
}

async fn read_body(body: Option<&str>, file: Option<&PathBuf>) -> Result<Bytes, CliError> {
    match (body, file) {
        (Some(body), _) => Ok(Bytes::copy_from_slice(body.as_bytes())),
        (None, Some(path)) => Ok(Bytes::from(tokio::fs::read(path).await?)),
        (None, None) => Err(CliError::InvalidArgument {
            arg: "body".to_string(),
            message: "either --body or --file is required".to_string(),
        }),
    }
}

fn status(cancel: &CancellationToken) -> &'static str {
    if cancel.is_cancelled() {
        "cancelled"
    } else {
        "ok"
    }
}

fn write_line<W: Write>(out: &mut W, value: &serde_json::Value) -> Result<(), CliError> {
    serde_json::to_writer(&mut *out, value)?;
    writeln!(out)?;
    Ok(())
}

#[cfg(test)]
#[path = "lib_tests.rs"]
mod tests;
