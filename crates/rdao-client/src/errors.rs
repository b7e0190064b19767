//! Client request errors.

use serde_json::Value;
use thiserror::Error;

/// Why a request did not produce a value.
#[derive(Clone, Debug, Error, PartialEq)]
pub enum RequestError {
    /// The connection was down (or went down) before a reply arrived.
    #[error("disconnected")]
    Disconnected,
    /// No reply within the configured request timeout.
    #[error("request timed out")]
    Timeout,
    /// The server answered with an `error` message.
    #[error("remote error: {0}")]
    Remote(Value),
    /// The request could not be encoded.
    #[error("failed to encode request: {0}")]
    Encode(String),
    /// The reply did not have the expected shape.
    #[error("failed to decode response: {0}")]
    Decode(String),
}

impl RequestError {
    /// Whether repeating the same request could succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Disconnected | Self::Timeout)
    }

    /// Remote error payload, if the server rejected the request.
    pub fn remote(&self) -> Option<&Value> {
        match self {
            Self::Remote(value) => Some(value),
            _ => None,
        }
    }
}
