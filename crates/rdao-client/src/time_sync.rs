//! Clock offset estimation from `timeSync` round trips.
//!
//! All offsets are `server - client` in milliseconds. Each reply bounds the
//! offset from both sides:
//!
//! - assuming zero reply latency gives a lower bound (`server - received`),
//! - assuming zero send latency gives an upper bound (`server - sent`).
//!
//! The estimate is the half-round-trip guess clamped into those bounds, or
//! their midpoint when clock jitter makes them cross.

use std::time::Duration;

use parking_lot::Mutex;
use rdao_core::now_millis;
use rdao_settings::TimeSyncSettings;
use thiserror::Error;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::connection::{ConnectionEvent, ReactiveConnection};

/// Conversion requested before enough replies arrived.
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum TimeSyncError {
    /// Fewer than `min_pong_count` replies so far.
    #[error("time not synchronized")]
    NotSynchronized,
}

struct Cadence {
    interval_ms: u64,
    increment_ms: u64,
    max_interval_ms: u64,
}

struct SyncState {
    minimal_diff: Option<i64>,
    maximal_diff: Option<i64>,
    time_diff: i64,
    pong_count: u32,
    cadence: Cadence,
    next_phase: usize,
}

/// Estimates the server clock offset for one connection.
pub struct TimeSynchronizer {
    settings: TimeSyncSettings,
    state: Mutex<SyncState>,
    synchronized: watch::Sender<Option<i64>>,
}

impl TimeSynchronizer {
    /// Synchronizer with the given cadence.
    pub fn new(settings: TimeSyncSettings) -> Self {
        let cadence = Cadence {
            interval_ms: settings.ping_interval_ms,
            increment_ms: settings.ping_interval_increment_ms,
            max_interval_ms: settings.max_ping_interval_ms,
        };
        Self {
            settings,
            state: Mutex::new(SyncState {
                minimal_diff: None,
                maximal_diff: None,
                time_diff: 0,
                pong_count: 0,
                cadence,
                next_phase: 0,
            }),
            synchronized: watch::channel(None).0,
        }
    }

    /// Fold one reply into the estimate.
    pub fn record(&self, client_timestamp: i64, server_timestamp: i64, received_at: i64) {
        let mut state = self.state.lock();

        let zero_reply = server_timestamp - received_at;
        let minimal = state.minimal_diff.map_or(zero_reply, |m| m.max(zero_reply));
        let zero_send = server_timestamp - client_timestamp;
        let maximal = state.maximal_diff.map_or(zero_send, |m| m.min(zero_send));
        state.minimal_diff = Some(minimal);
        state.maximal_diff = Some(maximal);

        let ping = received_at - client_timestamp;
        let half_ping_guess = server_timestamp - (received_at - ping / 2);
        state.time_diff = if minimal > maximal {
            minimal + (maximal - minimal) / 2
        } else {
            half_ping_guess.clamp(minimal, maximal)
        };

        state.pong_count += 1;
        if let Some(phase) = self.settings.phases.get(state.next_phase) {
            if state.pong_count >= phase.after_pong_count {
                state.next_phase += 1;
                state.cadence = Cadence {
                    interval_ms: phase.ping_interval_ms,
                    increment_ms: phase.ping_interval_increment_ms,
                    max_interval_ms: phase.max_ping_interval_ms,
                };
            }
        }

        debug!(diff_ms = state.time_diff, pongs = state.pong_count, "time sync reply");
        if state.pong_count >= self.settings.min_pong_count {
            let _ = self.synchronized.send_replace(Some(state.time_diff));
        }
    }

    /// Current offset estimate, once synchronized.
    pub fn time_diff(&self) -> Option<i64> {
        let state = self.state.lock();
        (state.pong_count >= self.settings.min_pong_count).then_some(state.time_diff)
    }

    /// Replies received so far.
    pub fn pong_count(&self) -> u32 {
        self.state.lock().pong_count
    }

    /// Wait until the first estimate is published and return it.
    pub async fn wait_synchronized(&self) -> i64 {
        let mut published = self.synchronized.subscribe();
        let diff = published.wait_for(Option::is_some).await.map(|d| *d);
        diff.ok().flatten().unwrap_or_default()
    }

    /// Convert a server timestamp to the local clock.
    pub fn server_to_local(&self, timestamp: i64) -> Result<i64, TimeSyncError> {
        self.time_diff()
            .map(|diff| timestamp - diff)
            .ok_or(TimeSyncError::NotSynchronized)
    }

    /// Convert a local timestamp to the server clock.
    pub fn local_to_server(&self, timestamp: i64) -> Result<i64, TimeSyncError> {
        self.time_diff()
            .map(|diff| timestamp + diff)
            .ok_or(TimeSyncError::NotSynchronized)
    }

    /// Delay before the next probe.
    pub fn ping_interval(&self) -> Duration {
        let state = self.state.lock();
        let grown = state.cadence.interval_ms
            + u64::from(state.pong_count) * state.cadence.increment_ms;
        Duration::from_millis(grown.min(state.cadence.max_interval_ms))
    }

    /// Probe the server while connected and fold in every reply until
    /// cancelled or the connection is disposed.
    pub async fn run(&self, connection: ReactiveConnection, cancel: CancellationToken) {
        let mut events = connection.events();
        let mut next_probe = Instant::now();
        loop {
            if connection.is_finished() {
                return;
            }
            tokio::select! {
                () = cancel.cancelled() => return,
                () = tokio::time::sleep_until(next_probe) => {
                    if connection.is_connected() {
                        let _ = connection.send_time_sync(now_millis());
                    }
                    next_probe = Instant::now() + self.ping_interval();
                }
                event = events.recv() => match event {
                    Ok(ConnectionEvent::TimeSync { client_timestamp, server_timestamp }) => {
                        self.record(client_timestamp, server_timestamp, now_millis());
                    }
                    Ok(_) | Err(RecvError::Lagged(_)) => {}
                    Err(RecvError::Closed) => return,
                },
            }
        }
    }
}
