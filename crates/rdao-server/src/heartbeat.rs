//! Server-side liveness check.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast::error::RecvError;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument};

use crate::session::{Session, SessionEvent};

/// Close `session` when no `ping` arrives within `max_ping_delay`.
///
/// Returns when the session closes, the window lapses or `cancel` fires.
#[instrument(skip_all, fields(session_id = %session.id()))]
pub async fn run_ping_receiver(session: Arc<Session>, max_ping_delay: Duration, cancel: CancellationToken) {
    let mut events = session.events();
    let mut deadline = Instant::now() + max_ping_delay;
    loop {
        tokio::select! {
            () = cancel.cancelled() => return,
            () = tokio::time::sleep_until(deadline) => {
                info!(delay_ms = max_ping_delay.as_millis(), "no ping from client, closing session");
                session.close();
                return;
            }
            event = events.recv() => match event {
                // A lagged receiver dropped events, pings possibly among them.
                Ok(SessionEvent::Ping(_)) | Err(RecvError::Lagged(_)) => deadline = Instant::now() + max_ping_delay,
                Ok(SessionEvent::Closed) | Err(RecvError::Closed) => return,
                Ok(_) => {}
            },
        }
    }
}
