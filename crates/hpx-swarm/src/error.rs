//! Error taxonomy for the swarm client.
//!
//! Transport failures, protocol violations, session failures and
//! subscription failures each get their own enum; [`TransportError`] wraps
//! them all so operations return a single [`TransportResult`].

use std::time::Duration;

use serde_json::Value;
use thiserror::Error;

use crate::protocol::SubscriptionId;

/// The main result type used throughout the client.
pub type TransportResult<T> = Result<T, TransportError>;

/// Top-level error for every client operation.
#[derive(Error, Debug)]
pub enum TransportError {
    /// A socket or poll endpoint could not be reached.
    #[error("Failed to connect to {url}: {message}")]
    Connect { url: String, message: String },

    /// An operation exceeded its deadline.
    #[error("Operation timed out after {duration:?}")]
    Timeout { duration: Duration },

    /// Every configured endpoint is quarantined.
    #[error("No endpoint available")]
    NoEndpoint,

    /// The connection went away while a request was in flight.
    #[error("Connection closed: {reason}")]
    ConnectionClosed { reason: String },

    /// The socket transport gave up and will not reconnect.
    #[error("Socket transport is unavailable")]
    Unavailable,

    /// WebSocket level errors.
    #[error("WebSocket error: {message}")]
    WebSocket { message: String },

    /// HTTP client errors from the poll transport.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Non-success HTTP status from the poll transport.
    #[error("HTTP status {status}: {body}")]
    HttpStatus { status: u16, body: String },

    /// Inbound frame could not be understood.
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Session could not be acquired or kept.
    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    /// Subscription bookkeeping failure.
    #[error("Subscription error: {0}")]
    Subscription(#[from] SubscriptionError),

    /// Backend answered with an application code the client does not handle.
    #[error("API error: code={code}, data={data}")]
    Api { code: i64, data: Value },

    /// Serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration errors
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// Internal errors (should not happen in normal operation)
    #[error("Internal error: {message}")]
    Internal { message: String },
}

/// Malformed or unrecognized inbound data.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("malformed frame: {message}")]
    Malformed { message: String },

    #[error("unexpected frame shape: {message}")]
    UnexpectedShape { message: String },

    #[error("missing field `{field}`")]
    MissingField { field: &'static str },
}

/// Session acquisition and continuity failures.
///
/// Cloneable so a single acquisition result can be handed to every waiter.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("session acquisition failed: {message}")]
    AcquisitionFailed { message: String },

    #[error("session lost")]
    Lost,

    #[error("backend requires login")]
    NeedToLogin,

    #[error("no stored credentials to restore login")]
    NoCredentials,

    #[error("gave up after {attempts} attempts")]
    RetriesExhausted { attempts: u32 },

    #[error("client is shut down")]
    Closed,
}

/// Subscription lifecycle failures.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SubscriptionError {
    #[error("update for unknown subscription {subid}")]
    Orphaned { subid: SubscriptionId },

    #[error("unsubscribe of {subid} failed with code {code}")]
    UnsubscribeFailed { subid: SubscriptionId, code: i64 },

    #[error("subscribe response carried no subid")]
    MissingSubscriptionId,
}

impl TransportError {
    /// Create a connect error.
    pub fn connect(url: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Connect {
            url: url.into(),
            message: message.into(),
        }
    }

    /// Create a connection closed error.
    pub fn connection_closed(reason: impl Into<String>) -> Self {
        Self::ConnectionClosed {
            reason: reason.into(),
        }
    }

    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Create a WebSocket error.
    pub fn websocket(message: impl Into<String>) -> Self {
        Self::WebSocket {
            message: message.into(),
        }
    }

    /// Create a timeout error.
    pub fn timeout(duration: Duration) -> Self {
        Self::Timeout { duration }
    }

    /// Create an API error for an unhandled response code.
    pub fn api(code: i64, data: Value) -> Self {
        Self::Api { code, data }
    }

    /// Whether the error means the transport under a request was torn down.
    pub fn is_connection_loss(&self) -> bool {
        matches!(self, Self::ConnectionClosed { .. } | Self::Unavailable)
    }
}

impl ProtocolError {
    pub fn malformed(message: impl Into<String>) -> Self {
        Self::Malformed {
            message: message.into(),
        }
    }

    pub fn unexpected(message: impl Into<String>) -> Self {
        Self::UnexpectedShape {
            message: message.into(),
        }
    }
}

impl SessionError {
    pub fn acquisition_failed(message: impl Into<String>) -> Self {
        Self::AcquisitionFailed {
            message: message.into(),
        }
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for TransportError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::WebSocket {
            message: e.to_string(),
        }
    }
}
