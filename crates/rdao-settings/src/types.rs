//! Settings types.
//!
//! Every struct deserializes with `camelCase` keys and falls back to its
//! default for missing fields, so partial files are valid.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Root settings object.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RdaoSettings {
    /// Server listener and session settings.
    pub server: ServerSettings,
    /// Client connection behaviour.
    pub client: ConnectionSettings,
    /// Client ping/pong monitor.
    pub heartbeat: PingerSettings,
    /// Clock offset estimation.
    pub time_sync: TimeSyncSettings,
    /// Log output.
    pub logging: LoggingSettings,
}

/// Server listener and session settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    /// Bind address.
    pub host: String,
    /// Bind port (0 picks a free port).
    pub port: u16,
    /// WebSocket route.
    pub path: String,
    /// Close a session when no `ping` arrives within this window.
    pub ping_timeout_ms: Option<u64>,
    /// Upper bound on source-chasing rounds per `getMore` schema.
    pub max_get_more_rounds: usize,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 8420,
            path: "/reactive-dao".into(),
            ping_timeout_ms: None,
            max_get_more_rounds: 64,
        }
    }
}

impl ServerSettings {
    /// Ping receiver window, when enabled.
    pub fn ping_timeout(&self) -> Option<Duration> {
        self.ping_timeout_ms.map(Duration::from_millis)
    }
}

/// Client connection behaviour.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConnectionSettings {
    /// Delay before a reconnection attempt.
    pub reconnect_delay_ms: u64,
    /// Fail a request that has no reply after this long.
    pub request_timeout_ms: Option<u64>,
    /// Queue requests issued while disconnected instead of failing them.
    pub queue_requests_when_disconnected: bool,
    /// How long a queued request waits for a connection.
    pub request_send_timeout_ms: u64,
    /// Re-send in-flight requests after a reconnect instead of failing them.
    pub queue_active_requests_on_disconnect: bool,
    /// Reconnect automatically after a disconnect.
    pub auto_reconnect: bool,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            reconnect_delay_ms: 2323,
            request_timeout_ms: None,
            queue_requests_when_disconnected: true,
            request_send_timeout_ms: 2300,
            queue_active_requests_on_disconnect: false,
            auto_reconnect: true,
        }
    }
}

impl ConnectionSettings {
    /// Reconnection delay.
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    /// Per-request reply timeout, when enabled.
    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout_ms.map(Duration::from_millis)
    }

    /// Queue wait bound.
    pub fn request_send_timeout(&self) -> Duration {
        Duration::from_millis(self.request_send_timeout_ms)
    }
}

/// Client ping/pong monitor.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PingerSettings {
    /// Interval between pings.
    pub ping_interval_ms: u64,
    /// Close the connection when no pong arrives within this window.
    pub pong_timeout_ms: u64,
}

impl Default for PingerSettings {
    fn default() -> Self {
        Self {
            ping_interval_ms: 10_000,
            pong_timeout_ms: 10_000,
        }
    }
}

/// Ping cadence change after a number of replies.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TimeSyncPhase {
    /// Replies after which this phase starts.
    pub after_pong_count: u32,
    /// Base interval.
    pub ping_interval_ms: u64,
    /// Interval growth per reply.
    pub ping_interval_increment_ms: u64,
    /// Interval ceiling.
    pub max_ping_interval_ms: u64,
}

impl Default for TimeSyncPhase {
    fn default() -> Self {
        Self {
            after_pong_count: 0,
            ping_interval_ms: 1000,
            ping_interval_increment_ms: 0,
            max_ping_interval_ms: 100_000,
        }
    }
}

/// Clock offset estimation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TimeSyncSettings {
    /// Base interval between probes.
    pub ping_interval_ms: u64,
    /// Interval growth per reply.
    pub ping_interval_increment_ms: u64,
    /// Interval ceiling.
    pub max_ping_interval_ms: u64,
    /// Replies needed before the estimate is published.
    pub min_pong_count: u32,
    /// Cadence changes, applied in order.
    pub phases: Vec<TimeSyncPhase>,
}

impl Default for TimeSyncSettings {
    fn default() -> Self {
        Self {
            ping_interval_ms: 1000,
            ping_interval_increment_ms: 250,
            max_ping_interval_ms: 100_000,
            min_pong_count: 1,
            phases: Vec::new(),
        }
    }
}

/// Log output.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Default filter directive when `RUST_LOG` is unset.
    pub level: String,
    /// Emit JSON lines instead of compact text.
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".into(),
            json: false,
        }
    }
}
