//! Error types shared by client and server.
//!
//! [`DaoError`] crosses the wire: its [`DaoError::payload`] is what a client
//! receives in `error`, `authenticationError` and `notify{signal:"error"}`
//! messages. The other enums stay local to one side of a connection.

use serde_json::{Value, json};
use thiserror::Error;

use crate::path::Path;

/// Failure reported by a data-access object.
#[derive(Clone, Debug, Error, PartialEq)]
pub enum DaoError {
    /// No value is registered under the path.
    #[error("not found: {0}")]
    NotFound(Path),
    /// No method is registered under the path.
    #[error("method not found: {0}")]
    MethodNotFound(Path),
    /// The arguments or path parameters were unusable.
    #[error("bad request: {0}")]
    BadRequest(String),
    /// An application-defined error value, sent to the client as-is.
    #[error("rejected: {0}")]
    Rejected(Value),
    /// Unexpected failure inside the server.
    #[error("internal error: {0}")]
    Internal(String),
}

impl DaoError {
    /// Serializable projection sent to the client.
    pub fn payload(&self) -> Value {
        match self {
            Self::Rejected(value) => value.clone(),
            Self::NotFound(path) | Self::MethodNotFound(path) => json!({
                "code": self.error_kind(),
                "message": self.to_string(),
                "path": path,
            }),
            Self::BadRequest(_) | Self::Internal(_) => json!({
                "code": self.error_kind(),
                "message": self.to_string(),
            }),
        }
    }

    /// Short stable error code.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "not_found",
            Self::MethodNotFound(_) => "method_not_found",
            Self::BadRequest(_) => "bad_request",
            Self::Rejected(_) => "rejected",
            Self::Internal(_) => "internal",
        }
    }

    /// Whether repeating the same call could succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Internal(_))
    }
}

/// Resolver failure. Only raised for schema-authoring defects.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ResolveError {
    /// A cross product of single-valued operands produced several results.
    #[error("cross product of single-valued operands produced {count} results")]
    Cardinality {
        /// Number of results the product would have produced.
        count: usize,
    },
}

/// Server-side observation bookkeeping violations.
///
/// These indicate a desynchronized client and terminate its connection.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ObservationError {
    /// `observe` for a path the client already observes.
    #[error("path {0} is already observed")]
    AlreadyObserved(Path),
    /// `unobserve` for a path the client does not observe.
    #[error("path {0} is not observed")]
    NotObserved(Path),
    /// `unpush` for a path without push references.
    #[error("path {0} is not pushed")]
    NotPushed(Path),
    /// The owning session has already closed.
    #[error("session closed")]
    SessionClosed,
}

/// Frame decoding failure.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The frame is not a valid message.
    #[error("malformed message: {reason}")]
    Malformed {
        /// Decoder diagnostic.
        reason: String,
    },
    /// A message could not be encoded.
    #[error("failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Transport failures.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Establishing the link failed.
    #[error("connect failed: {0}")]
    Connect(String),
    /// The link is closed.
    #[error("link closed")]
    Closed,
    /// Underlying I/O failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
