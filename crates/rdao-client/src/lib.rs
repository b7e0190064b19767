//! # rdao-client
//!
//! Client side of the reactive-dao protocol.
//!
//! - [`ReactiveConnection`]: request correlation, reconnection, request
//!   queueing and observation replay over any [`rdao_core::Connector`].
//! - [`RemoteObservable`]: a local facade bound to one remote path.
//! - [`run_pinger`]: closes links whose server stopped answering pings.
//! - [`TimeSynchronizer`]: estimates the server clock offset.
//! - [`WsConnector`]: WebSocket transport.

#![deny(unsafe_code)]

pub mod connection;
pub mod errors;
pub mod heartbeat;
pub mod observation;
pub mod time_sync;
pub mod websocket;

#[cfg(test)]
mod testing;

pub use connection::{ConnectionEvent, ReactiveConnection};
pub use errors::RequestError;
pub use heartbeat::{PingerExit, run_pinger};
pub use observation::RemoteObservable;
pub use time_sync::{TimeSyncError, TimeSynchronizer};
pub use websocket::WsConnector;
