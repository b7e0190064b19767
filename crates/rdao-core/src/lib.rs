//! # rdao-core
//!
//! Shared building blocks for the reactive-dao protocol.
//!
//! - **Paths**: [`Path`] identifies one remote data item; equality and hashing
//!   use a canonical JSON form so parameter objects compare structurally.
//! - **Messages**: [`Message`] is the closed set of wire records exchanged
//!   between client and server.
//! - **Schemas**: [`Schema`] declares how to derive related paths from a value,
//!   and [`pointers`] evaluates it.
//! - **Observables**: the [`Observer`]/[`Observable`] seam plus the value, list
//!   and error cells used on both sides of a connection.
//! - **Transport seam**: [`Link`] and [`Connector`] abstract any duplex text
//!   channel.

#![deny(unsafe_code)]

pub mod errors;
pub mod ids;
pub mod link;
pub mod observable;
pub mod path;
pub mod pointers;
pub mod protocol;
pub mod schema;

pub use errors::{DaoError, ObservationError, ProtocolError, ResolveError, TransportError};
pub use ids::{ConnectionId, SessionId};
pub use link::{Connector, Link};
pub use observable::{
    ErrorObservable, FnObserver, Observable, ObservableList, ObservableValue, Observer,
    SignalDispatch, SignalHandler, apply_signal, same_observer,
};
pub use path::Path;
pub use pointers::{Pointers, collect, collect_pointers};
pub use protocol::{Fetched, FetchPath, Message, MoreEntry};
pub use schema::Schema;

/// Milliseconds since the Unix epoch, as used in `timeSync` messages.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
