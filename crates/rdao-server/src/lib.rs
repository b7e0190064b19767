//! # rdao-server
//!
//! Server side of the reactive-dao protocol.
//!
//! - [`ReactiveServer`]: accepts [`rdao_core::Link`]s and runs one
//!   [`Session`] per link.
//! - [`Dao`] / [`DaoFactory`]: the application seam; [`SimpleDao`] and
//!   [`RoutedDao`] build DAOs from closures and route by path prefix.
//! - [`get_more`]: batch fetch of a path and everything its dependency
//!   schemas reach.
//! - [`push`]: dependency push lists for composite observations.
//! - Transports: [`LoopbackConnector`] (in-process) and [`ws_router`] /
//!   [`serve`] (axum WebSocket gateway).

#![deny(unsafe_code)]

pub mod dao;
pub mod fetch;
pub mod heartbeat;
pub mod loopback;
pub mod push;
pub mod server;
pub mod session;
pub mod simple_dao;
pub mod websocket;

pub use dao::{Dao, DaoFactory, shared_dao};
pub use fetch::get_more;
pub use heartbeat::run_ping_receiver;
pub use loopback::{Direction, LoopbackConnector, PacketFilter};
pub use push::{PushObservable, PushRegistry};
pub use server::ReactiveServer;
pub use session::{Session, SessionEvent};
pub use simple_dao::{RoutedDao, SimpleDao};
pub use websocket::{ServerHandle, serve, ws_router};
