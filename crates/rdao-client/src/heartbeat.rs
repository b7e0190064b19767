//! Client-side liveness monitor.

use std::time::Duration;

use rdao_settings::PingerSettings;
use tokio::sync::broadcast::error::RecvError;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::connection::{ConnectionEvent, ReactiveConnection};

/// Why [`run_pinger`] returned.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PingerExit {
    /// The cancellation token fired.
    Cancelled,
    /// The connection was disposed.
    Finished,
}

/// Ping the server every `ping_interval_ms` while connected and close the
/// link when no pong arrives within `pong_timeout_ms`.
///
/// Closing the link hands control to the connection's reconnect path. The
/// pinger stays idle until the next `Connect` and then monitors the new
/// link, so one task covers the whole life of the connection.
pub async fn run_pinger(
    connection: ReactiveConnection,
    settings: PingerSettings,
    cancel: CancellationToken,
) -> PingerExit {
    let ping_interval = Duration::from_millis(settings.ping_interval_ms);
    let pong_timeout = Duration::from_millis(settings.pong_timeout_ms);
    let mut events = connection.events();

    let now = Instant::now();
    let mut last_ping = now;
    let mut last_pong = now;
    // Set after a timeout until the replacement link connects.
    let mut closing = false;

    loop {
        if connection.is_finished() {
            return PingerExit::Finished;
        }
        let next_check = if connection.is_connected() && !closing {
            let now = Instant::now();
            if last_pong + pong_timeout <= now {
                warn!(connection_id = %connection.id(), "pong timeout, closing link");
                connection.close_connection();
                closing = true;
                continue;
            }
            if last_ping + ping_interval <= now {
                let _ = connection.send_ping(None);
                last_ping = now;
            }
            Some((last_ping + ping_interval).min(last_pong + pong_timeout))
        } else {
            None
        };

        let wait = async {
            match next_check {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            () = cancel.cancelled() => return PingerExit::Cancelled,
            () = wait => {}
            event = events.recv() => match event {
                Ok(ConnectionEvent::Connect) => {
                    debug!(connection_id = %connection.id(), "pinger restarted");
                    let now = Instant::now();
                    last_ping = now;
                    last_pong = now;
                    closing = false;
                }
                Ok(ConnectionEvent::Pong(_)) => last_pong = Instant::now(),
                Ok(_) | Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => return PingerExit::Finished,
            },
        }
    }
}
