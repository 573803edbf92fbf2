//! Response envelope and background operation types.
//!
//! Every Incus endpoint wraps its payload in the same envelope. Synchronous
//! calls carry the result in `metadata`; asynchronous calls point at a
//! background operation that can be queried under `/1.0/operations`.

use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::fmt;

use crate::error::{Error, Result};

/// API version prefix shared by every endpoint.
pub const API_PREFIX: &str = "/1.0";

/// Base path of the operations collection.
pub const OPERATIONS_PATH: &str = "/1.0/operations";

/// Kind of response carried by the envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseType {
    /// The request completed and `metadata` holds the result.
    #[default]
    Sync,
    /// The request started a background operation.
    Async,
    /// The request failed.
    Error,
}

/// Standard Incus response envelope.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ApiResponse {
    /// Response kind.
    #[serde(rename = "type", default)]
    pub kind: ResponseType,
    /// Human readable status.
    #[serde(default)]
    pub status: String,
    /// Numeric status.
    #[serde(default)]
    pub status_code: u16,
    /// Operation URL for asynchronous responses.
    #[serde(default)]
    pub operation: String,
    /// Error code for error responses.
    #[serde(default)]
    pub error_code: u16,
    /// Error message for error responses.
    #[serde(default)]
    pub error: String,
    /// Response payload.
    #[serde(default)]
    pub metadata: Value,
}

impl ApiResponse {
    /// Decode an envelope from a raw HTTP status and body.
    ///
    /// Non-2xx statuses and `error` envelopes are routed through the error
    /// translator. An empty 2xx body decodes to an empty synchronous envelope.
    ///
    /// # Errors
    ///
    /// Returns the translated error for failed responses, or
    /// [`Error::Decode`] when the body is not a valid envelope.
    pub fn decode(status: StatusCode, body: &[u8]) -> Result<Self> {
        if !status.is_success() {
            return Err(Error::from_response(status, body));
        }

        if body.iter().all(u8::is_ascii_whitespace) {
            return Ok(Self {
                status_code: status.as_u16(),
                ..Self::default()
            });
        }

        let response: Self = serde_json::from_slice(body)
            .map_err(|err| Error::Decode(format!("Invalid Incus response envelope: {err}")))?;

        if response.kind == ResponseType::Error {
            let code = StatusCode::from_u16(response.error_code)
                .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            return Err(Error::from_response(code, body));
        }

        Ok(response)
    }

    /// Returns true when the response refers to a background operation.
    #[must_use]
    pub fn is_async(&self) -> bool {
        self.kind == ResponseType::Async
    }

    /// Extract the operation identifier from the `operation` URL.
    #[must_use]
    pub fn operation_id(&self) -> Option<&str> {
        operation_id_from_url(&self.operation)
    }

    /// Deserialize the metadata into a typed value.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Decode`] when the metadata does not match `T`.
    pub fn into_metadata<T>(self) -> Result<T>
    where
        T: DeserializeOwned,
    {
        serde_json::from_value(self.metadata)
            .map_err(|err| Error::Decode(format!("Unexpected response metadata: {err}")))
    }
}

/// Extract the trailing identifier of an operation URL such as
/// `/1.0/operations/abc` (query strings are ignored).
#[must_use]
pub fn operation_id_from_url(url: &str) -> Option<&str> {
    let path = url.split('?').next().unwrap_or_default();
    path.trim_end_matches('/')
        .rsplit('/')
        .next()
        .filter(|segment| !segment.is_empty() && *segment != "operations")
}

/// Status of a background operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum OperationStatus {
    /// Queued but not started.
    Pending,
    /// In progress.
    Running,
    /// Finished successfully.
    Success,
    /// Finished with an error.
    Failure,
    /// Cancelled before completion.
    Cancelled,
}

impl OperationStatus {
    /// Map an Incus numeric status code to a status.
    ///
    /// Codes 100 and 105 are queued states, other 1xx codes are in-progress
    /// states, and 200/400/401 are the terminal states.
    #[must_use]
    pub const fn from_code(code: u16) -> Option<Self> {
        match code {
            100 | 105 => Some(Self::Pending),
            101..=199 => Some(Self::Running),
            200 => Some(Self::Success),
            400 => Some(Self::Failure),
            401 => Some(Self::Cancelled),
            _ => None,
        }
    }

    /// Parse a status name as reported in the `status` field.
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "pending" | "operation created" => Some(Self::Pending),
            "running" | "cancelling" | "started" => Some(Self::Running),
            "success" => Some(Self::Success),
            "failure" => Some(Self::Failure),
            "cancelled" | "canceled" => Some(Self::Cancelled),
            _ => None,
        }
    }

    /// Canonical numeric code for this status.
    #[must_use]
    pub const fn code(self) -> u16 {
        match self {
            Self::Pending => 105,
            Self::Running => 103,
            Self::Success => 200,
            Self::Failure => 400,
            Self::Cancelled => 401,
        }
    }

    /// Returns the status name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "Pending",
            Self::Running => "Running",
            Self::Success => "Success",
            Self::Failure => "Failure",
            Self::Cancelled => "Cancelled",
        }
    }

    /// Returns true for Success, Failure and Cancelled.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Failure | Self::Cancelled)
    }

    const fn rank(self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::Running => 1,
            Self::Success | Self::Failure | Self::Cancelled => 2,
        }
    }
}

impl fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for OperationStatus {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let name = String::deserialize(deserializer)?;
        Self::from_name(&name)
            .ok_or_else(|| serde::de::Error::custom(format!("unknown operation status `{name}`")))
    }
}

/// A background operation as reported by `/1.0/operations/{id}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "OperationRepr")]
pub struct Operation {
    /// Server-assigned identifier.
    pub id: String,
    /// Operation class (task, websocket, token).
    pub class: String,
    /// Human readable description.
    pub description: String,
    /// Current status.
    pub status: OperationStatus,
    /// Numeric mirror of `status`.
    pub status_code: u16,
    /// Affected resource URLs grouped by kind.
    pub resources: HashMap<String, Vec<String>>,
    /// Operation specific metadata (progress, exec output, ...).
    pub metadata: Value,
    /// Creation timestamp.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    /// Last update timestamp.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    /// Whether the server accepts cancellation.
    pub may_cancel: bool,
    /// Error detail for failed operations.
    pub err: String,
    /// Cluster member running the operation.
    pub location: String,
}

impl Operation {
    /// Create a bare operation known only by its identifier.
    #[must_use]
    pub fn pending(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            class: String::new(),
            description: String::new(),
            status: OperationStatus::Pending,
            status_code: OperationStatus::Pending.code(),
            resources: HashMap::new(),
            metadata: Value::Null,
            created_at: None,
            updated_at: None,
            may_cancel: false,
            err: String::new(),
            location: String::new(),
        }
    }

    /// Build the operation described by an asynchronous response.
    ///
    /// The envelope metadata is used when present; otherwise the operation
    /// is known only by the identifier embedded in the `operation` URL.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Decode`] when the response does not reference an
    /// operation, or when its metadata is an object that does not describe
    /// one.
    pub fn from_response(response: &ApiResponse) -> Result<Self> {
        let id = response.operation_id().ok_or_else(|| {
            Error::Decode(format!(
                "Asynchronous response without operation reference: `{}`",
                response.operation
            ))
        })?;

        let mut operation = match &response.metadata {
            Value::Object(_) => serde_json::from_value::<Self>(response.metadata.clone())
                .map_err(|err| Error::Decode(format!("Malformed operation `{id}`: {err}")))?,
            _ => Self::pending(id),
        };
        if operation.id.is_empty() {
            operation.id = id.to_string();
        }
        Ok(operation)
    }

    /// Path of this operation on the server.
    #[must_use]
    pub fn path(&self) -> String {
        format!("{OPERATIONS_PATH}/{}", self.id)
    }

    /// Returns true once the operation can no longer change.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Returns true if the operation finished successfully.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.status == OperationStatus::Success
    }

    /// Flattened set of affected resource URLs.
    #[must_use]
    pub fn resource_urls(&self) -> BTreeSet<&str> {
        self.resources
            .values()
            .flatten()
            .map(String::as_str)
            .collect()
    }

    /// Apply a newer observation of the same operation.
    ///
    /// Terminal operations are immutable and status never moves backwards;
    /// an update that would regress is ignored. Returns true if applied.
    pub fn advance(&mut self, next: Self) -> bool {
        if self.is_terminal() || next.status.rank() < self.status.rank() {
            return false;
        }
        *self = next;
        true
    }
}

#[derive(Deserialize)]
struct OperationRepr {
    #[serde(default)]
    id: String,
    #[serde(default)]
    class: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    status_code: Option<u16>,
    #[serde(default)]
    resources: Option<HashMap<String, Vec<String>>>,
    #[serde(default)]
    metadata: Value,
    #[serde(default)]
    created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    may_cancel: bool,
    #[serde(default)]
    err: String,
    #[serde(default)]
    location: String,
}

impl From<OperationRepr> for Operation {
    fn from(repr: OperationRepr) -> Self {
        let status = repr
            .status_code
            .and_then(OperationStatus::from_code)
            .or_else(|| repr.status.as_deref().and_then(OperationStatus::from_name))
            .unwrap_or(OperationStatus::Pending);

        Self {
            id: repr.id,
            class: repr.class,
            description: repr.description,
            status,
            status_code: repr.status_code.unwrap_or_else(|| status.code()),
            resources: repr.resources.unwrap_or_default(),
            metadata: repr.metadata,
            created_at: repr.created_at,
            updated_at: repr.updated_at,
            may_cancel: repr.may_cancel,
            err: repr.err,
            location: repr.location,
        }
    }
}
