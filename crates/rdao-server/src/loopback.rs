//! In-process transport.
//!
//! [`LoopbackConnector`] wires a client straight into a [`ReactiveServer`].
//! Optional per-frame latency and a packet filter make it the harness for
//! reconnection and lost-reply scenarios.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rdao_core::{Connector, Link, Message, TransportError};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::trace;

use crate::server::ReactiveServer;

/// Which way a frame travels.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    /// Client to server.
    ToServer,
    /// Server to client.
    ToClient,
}

/// Decides whether a frame is delivered. `false` drops it.
pub type PacketFilter = Arc<dyn Fn(&Message, Direction) -> bool + Send + Sync>;

/// Connector handing each new link to an in-process server.
pub struct LoopbackConnector {
    server: Arc<ReactiveServer>,
    delay: Duration,
    filter: Option<PacketFilter>,
}

impl LoopbackConnector {
    /// Connector without latency or filtering.
    pub fn new(server: Arc<ReactiveServer>) -> Self {
        Self {
            server,
            delay: Duration::ZERO,
            filter: None,
        }
    }

    /// Delay every frame by `delay`. Frame order is preserved.
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Drop frames for which `filter` returns `false`.
    #[must_use]
    pub fn with_packet_filter<F>(mut self, filter: F) -> Self
    where
        F: Fn(&Message, Direction) -> bool + Send + Sync + 'static,
    {
        self.filter = Some(Arc::new(filter));
        self
    }

    /// Server behind this connector.
    pub fn server(&self) -> &Arc<ReactiveServer> {
        &self.server
    }
}

#[async_trait]
impl Connector for LoopbackConnector {
    async fn connect(&self) -> Result<Link, TransportError> {
        let (client, server) = Link::pair();
        if self.delay.is_zero() && self.filter.is_none() {
            let _ = self.server.handle_link(server);
            return Ok(client);
        }

        let (to_server, from_client) = mpsc::unbounded_channel();
        let (to_client, from_server) = mpsc::unbounded_channel();
        pump(
            server.receiver,
            to_client,
            self.delay,
            self.filter.clone(),
            Direction::ToClient,
        );
        pump(
            from_client,
            server.sender,
            self.delay,
            self.filter.clone(),
            Direction::ToServer,
        );
        let _ = self.server.handle_link(Link {
            sender: to_server,
            receiver: from_server,
        });
        Ok(client)
    }
}

/// Forward frames from `from` to `to`, filtered and delayed. Dropping either
/// end closes the other once in-flight frames are delivered.
fn pump(
    mut from: mpsc::UnboundedReceiver<String>,
    to: mpsc::UnboundedSender<String>,
    delay: Duration,
    filter: Option<PacketFilter>,
    direction: Direction,
) {
    let (timed, mut due) = mpsc::unbounded_channel::<(Instant, String)>();
    drop(tokio::spawn(async move {
        while let Some(frame) = from.recv().await {
            if let (Some(filter), Ok(message)) = (&filter, Message::decode(&frame)) {
                if !filter(&message, direction) {
                    trace!(?direction, kind = message.kind(), "frame dropped by filter");
                    continue;
                }
            }
            if timed.send((Instant::now() + delay, frame)).is_err() {
                break;
            }
        }
    }));
    drop(tokio::spawn(async move {
        while let Some((at, frame)) = due.recv().await {
            tokio::time::sleep_until(at).await;
            if to.send(frame).is_err() {
                break;
            }
        }
    }));
}
