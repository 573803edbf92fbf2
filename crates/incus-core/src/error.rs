//! Error types for Incus operations.
//!
//! This module defines the error taxonomy surfaced by the client and the
//! translator that turns raw transport and HTTP outcomes into it. Every
//! component that sees a status code routes it through
//! [`Error::from_response`]; nothing else interprets status codes.

use reqwest::StatusCode;
use serde::Deserialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::types::{Operation, OperationStatus};

/// Shared, cloneable lower-level cause attached to connection failures.
pub type Cause = Arc<dyn std::error::Error + Send + Sync + 'static>;

/// Main error type for Incus operations.
#[derive(Error, Debug, Clone)]
pub enum Error {
    /// The server could not be reached (DNS, socket, TLS, timeouts).
    #[error("Connection error: {message}")]
    Connection {
        /// Description of the failure
        message: String,
        /// Lower-level cause
        #[source]
        source: Option<Cause>,
    },

    /// The server rejected the client credentials (401).
    #[error("Authentication failed: {0}")]
    Authentication(HttpFailure),

    /// The authenticated identity may not perform the action (403).
    #[error("Permission denied: {0}")]
    Permission(HttpFailure),

    /// The requested resource does not exist (404).
    #[error("Not found: {0}")]
    NotFound(HttpFailure),

    /// Any other non-2xx response.
    #[error("API error: {0}")]
    Api(HttpFailure),

    /// A background operation ended in Failure or Cancelled and the caller
    /// asked for that to be raised.
    #[error("Operation {} ended with status {}: {}", .0.id, .0.status, failure_detail(.0))]
    Operation(Box<Operation>),

    /// Waiting for a background operation exceeded its deadline.
    #[error("Timed out after {waited:?} waiting for operation {id} (last status: {last_status})")]
    OperationTimeout {
        /// Operation identifier
        id: String,
        /// Last status observed before giving up
        last_status: OperationStatus,
        /// Time spent waiting
        waited: Duration,
    },

    /// Cancellation was requested for an operation that does not allow it.
    #[error("Operation {0} cannot be cancelled")]
    OperationNotCancellable(String),

    /// The client facade backing a resource has been dropped.
    #[error("Client has been closed")]
    ClientClosed,

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Invalid endpoint or request path
    #[error("Invalid endpoint: {0}")]
    InvalidEndpoint(String),

    /// Invalid request arguments supplied by the caller
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// A successful response carried an unexpected payload
    #[error("Failed to decode response: {0}")]
    Decode(String),
}

/// Details of a failed HTTP exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpFailure {
    /// HTTP status code
    pub status: u16,
    /// Error message reported by the server, or the canonical reason
    pub message: String,
    /// Raw response body
    pub body: String,
}

impl fmt::Display for HttpFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.message, self.status)
    }
}

/// Specialized result type for Incus operations.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Deserialize)]
struct ErrorEnvelope {
    #[serde(default)]
    error: String,
}

fn failure_detail(operation: &Operation) -> &str {
    if operation.err.is_empty() {
        "no error detail"
    } else {
        &operation.err
    }
}

impl Error {
    /// Translate a non-successful HTTP response into an error.
    ///
    /// The message is taken from the `error` field of the response envelope
    /// when present, falling back to the canonical reason phrase.
    #[must_use]
    pub fn from_response(status: StatusCode, body: &[u8]) -> Self {
        let text = String::from_utf8_lossy(body).into_owned();
        let message = serde_json::from_slice::<ErrorEnvelope>(body)
            .ok()
            .map(|envelope| envelope.error)
            .filter(|message| !message.is_empty())
            .or_else(|| status.canonical_reason().map(str::to_string))
            .unwrap_or_else(|| format!("HTTP {}", status.as_u16()));

        let failure = HttpFailure {
            status: status.as_u16(),
            message,
            body: text,
        };

        match status {
            StatusCode::UNAUTHORIZED => Self::Authentication(failure),
            StatusCode::FORBIDDEN => Self::Permission(failure),
            StatusCode::NOT_FOUND => Self::NotFound(failure),
            _ => Self::Api(failure),
        }
    }

    /// Build a connection error with a chained cause.
    #[must_use]
    pub fn connection<E>(message: impl Into<String>, cause: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Connection {
            message: message.into(),
            source: Some(Arc::new(cause)),
        }
    }

    /// Returns the error code for this error type.
    #[must_use]
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Connection { .. } => "CONNECTION_ERROR",
            Self::Authentication(_) => "AUTHENTICATION_ERROR",
            Self::Permission(_) => "PERMISSION_ERROR",
            Self::NotFound(_) => "NOT_FOUND",
            Self::Api(_) => "API_ERROR",
            Self::Operation(_) => "OPERATION_ERROR",
            Self::OperationTimeout { .. } => "OPERATION_TIMEOUT",
            Self::OperationNotCancellable(_) => "OPERATION_NOT_CANCELLABLE",
            Self::ClientClosed => "CLIENT_CLOSED",
            Self::Config(_) => "CONFIG_ERROR",
            Self::InvalidEndpoint(_) => "INVALID_ENDPOINT",
            Self::InvalidRequest(_) => "INVALID_REQUEST",
            Self::Decode(_) => "DECODE_ERROR",
        }
    }

    /// HTTP status attached to the error, if any.
    #[must_use]
    pub fn status(&self) -> Option<u16> {
        self.http_failure().map(|failure| failure.status)
    }

    /// Raw response body attached to the error, if any.
    #[must_use]
    pub fn body(&self) -> Option<&str> {
        self.http_failure().map(|failure| failure.body.as_str())
    }

    /// Details of the failed HTTP exchange, if the error came from one.
    #[must_use]
    pub const fn http_failure(&self) -> Option<&HttpFailure> {
        match self {
            Self::Authentication(failure)
            | Self::Permission(failure)
            | Self::NotFound(failure)
            | Self::Api(failure) => Some(failure),
            _ => None,
        }
    }

    /// Returns true for [`Error::NotFound`].
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// Returns true if the failure happened below HTTP.
    #[must_use]
    pub const fn is_connection(&self) -> bool {
        matches!(self, Self::Connection { .. })
    }

    /// Returns true if this error should be logged as a serious error.
    #[must_use]
    pub const fn should_log(&self) -> bool {
        matches!(
            self,
            Self::Connection { .. } | Self::Config(_) | Self::Decode(_)
        )
    }
}

// Conversions from external error types
impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        let message = if err.is_timeout() {
            "request timed out"
        } else if err.is_connect() {
            "failed to connect"
        } else if err.is_body() || err.is_decode() {
            "failed to read response body"
        } else {
            "request failed"
        };
        Self::connection(message, err)
    }
}

impl From<url::ParseError> for Error {
    fn from(err: url::ParseError) -> Self {
        Self::InvalidEndpoint(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Decode(err.to_string())
    }
}

impl From<validator::ValidationErrors> for Error {
    fn from(err: validator::ValidationErrors) -> Self {
        Self::Config(err.to_string())
    }
}
