//! Wire messages.
//!
//! Every frame is one JSON object discriminated by `type`:
//!
//! ```text
//! {"type":"request","requestId":1,"method":["test","addUser"],"args":["new1",1]}
//! {"type":"response","responseId":1,"response":null}
//! {"type":"observe","what":["test","users"],"pushed":false}
//! {"type":"notify","what":["test","users"],"signal":"push","args":[4]}
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::ProtocolError;
use crate::path::Path;
use crate::schema::Schema;

/// One protocol message.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum Message {
    /// First client message: credentials for the DAO factory.
    #[serde(alias = "credentials")]
    InitializeSession {
        /// Application-defined credentials.
        #[serde(default)]
        credentials: Value,
    },
    /// Invoke a method.
    Request {
        /// Client-assigned correlation ID.
        request_id: u64,
        /// Method path.
        method: Path,
        /// Positional arguments.
        #[serde(default)]
        args: Vec<Value>,
    },
    /// Successful reply.
    Response {
        /// Correlation ID of the request being answered.
        response_id: u64,
        /// Result value.
        #[serde(default)]
        response: Value,
    },
    /// Failed reply.
    Error {
        /// Correlation ID of the request being answered.
        response_id: u64,
        /// Error payload.
        #[serde(default)]
        error: Value,
    },
    /// Fetch one value (or a composite multi-path request).
    Get {
        /// Correlation ID.
        request_id: u64,
        /// Item to fetch.
        what: Path,
    },
    /// Batch fetch with dependency schemas.
    GetMore {
        /// Correlation ID.
        request_id: u64,
        /// Root entries.
        paths: Vec<FetchPath>,
    },
    /// Fire-and-forget method invocation.
    Event {
        /// Method path.
        method: Path,
        /// Positional arguments.
        #[serde(default)]
        args: Vec<Value>,
    },
    /// Subscribe to a path.
    Observe {
        /// Item to observe.
        what: Path,
        /// Set when the client already holds the item through a push.
        #[serde(default)]
        pushed: bool,
    },
    /// Cancel a subscription.
    Unobserve {
        /// Item to stop observing.
        what: Path,
        /// Set when the client keeps the item through a push.
        #[serde(default)]
        pushed: bool,
    },
    /// Change notification for an observed or pushed path.
    Notify {
        /// Item that changed.
        what: Path,
        /// Signal name (`set`, `push`, `remove`, ...).
        signal: String,
        /// Signal arguments.
        #[serde(default)]
        args: Vec<Value>,
    },
    /// The server started pushing a path.
    Push {
        /// Item now pushed.
        what: Path,
    },
    /// The server stopped pushing a path.
    Unpush {
        /// Item no longer pushed.
        what: Path,
    },
    /// Liveness probe.
    Ping {
        /// Opaque payload echoed in the pong.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<Value>,
    },
    /// Liveness reply.
    Pong {
        /// Payload copied from the ping.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<Value>,
    },
    /// Clock offset probe.
    TimeSync {
        /// Client clock when the probe was sent (ms).
        client_timestamp: i64,
        /// Server clock when the probe was answered (ms).
        #[serde(default, skip_serializing_if = "Option::is_none")]
        server_timestamp: Option<i64>,
    },
    /// The DAO factory rejected the credentials.
    AuthenticationError {
        /// Error payload.
        #[serde(default)]
        error: Value,
    },
    /// The peer sent an unparseable frame.
    MalformedMessageError {
        /// Decoder diagnostic.
        error: String,
        /// The offending frame.
        message: String,
    },
}

impl Message {
    /// Decode one text frame.
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::Malformed {
            reason: e.to_string(),
        })
    }

    /// Encode as a text frame.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Wire discriminant, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InitializeSession { .. } => "initializeSession",
            Self::Request { .. } => "request",
            Self::Response { .. } => "response",
            Self::Error { .. } => "error",
            Self::Get { .. } => "get",
            Self::GetMore { .. } => "getMore",
            Self::Event { .. } => "event",
            Self::Observe { .. } => "observe",
            Self::Unobserve { .. } => "unobserve",
            Self::Notify { .. } => "notify",
            Self::Push { .. } => "push",
            Self::Unpush { .. } => "unpush",
            Self::Ping { .. } => "ping",
            Self::Pong { .. } => "pong",
            Self::TimeSync { .. } => "timeSync",
            Self::AuthenticationError { .. } => "authenticationError",
            Self::MalformedMessageError { .. } => "malformedMessageError",
        }
    }
}

/// Dependent fetch declared under a path: evaluate `schema` against the
/// fetched value, fetch every resulting pointer, recurse into `more`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MoreEntry {
    /// Pointer schemas.
    pub schema: Vec<Schema>,
    /// Nested dependents of each pointer.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub more: Vec<MoreEntry>,
}

impl MoreEntry {
    /// Entry with the given schemas and no nested dependents.
    pub fn new(schema: Vec<Schema>) -> Self {
        Self {
            schema,
            more: Vec::new(),
        }
    }

    /// Add a nested dependent.
    #[must_use]
    pub fn with(mut self, more: MoreEntry) -> Self {
        self.more.push(more);
        self
    }
}

/// Root entry of a batch fetch or push observation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FetchPath {
    /// A known path.
    What {
        /// Item to fetch.
        what: Path,
        /// Dependents of the item.
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        more: Vec<MoreEntry>,
    },
    /// Paths computed from schemas evaluated without a base value.
    Schema {
        /// Pointer schemas.
        schema: Vec<Schema>,
        /// Dependents of each pointer.
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        more: Vec<MoreEntry>,
    },
}

impl FetchPath {
    /// Entry for a known path with no dependents.
    pub fn what(what: Path) -> Self {
        Self::What {
            what,
            more: Vec::new(),
        }
    }

    /// Entry computed from schemas.
    pub fn schema(schema: Vec<Schema>) -> Self {
        Self::Schema {
            schema,
            more: Vec::new(),
        }
    }

    /// Add a dependent.
    #[must_use]
    pub fn with(mut self, entry: MoreEntry) -> Self {
        match &mut self {
            Self::What { more, .. } | Self::Schema { more, .. } => more.push(entry),
        }
        self
    }

    /// Dependents of this entry.
    pub fn more(&self) -> &[MoreEntry] {
        match self {
            Self::What { more, .. } | Self::Schema { more, .. } => more,
        }
    }

    /// Wrap a list of entries into a composite path (`{paths: [...]}`).
    pub fn composite(paths: &[FetchPath]) -> Path {
        Path::new(serde_json::json!({ "paths": paths }))
    }
}

/// One element of a batch fetch response.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Fetched {
    /// Fetched item.
    pub what: Path,
    /// Its value.
    pub data: Value,
}
