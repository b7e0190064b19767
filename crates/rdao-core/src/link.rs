//! Transport seam.
//!
//! A [`Link`] is one established duplex text channel. The receiver yielding
//! `None` means the peer closed; dropping the sender closes our side. A
//! [`Connector`] produces a fresh link for every connection attempt, which
//! is how the client reconnects without knowing the transport.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::errors::TransportError;

/// One established duplex text-frame channel.
#[derive(Debug)]
pub struct Link {
    /// Outbound frames.
    pub sender: mpsc::UnboundedSender<String>,
    /// Inbound frames; `None` once the peer closed.
    pub receiver: mpsc::UnboundedReceiver<String>,
}

impl Link {
    /// Create two links wired back to back.
    pub fn pair() -> (Self, Self) {
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();
        (
            Self {
                sender: a_tx,
                receiver: b_rx,
            },
            Self {
                sender: b_tx,
                receiver: a_rx,
            },
        )
    }
}

/// Factory of links; called once per connection attempt.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Establish a new link.
    async fn connect(&self) -> Result<Link, TransportError>;
}
