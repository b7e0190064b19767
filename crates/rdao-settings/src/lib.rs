//! # rdao-settings
//!
//! Typed configuration for reactive-dao clients and servers.
//!
//! Settings are loaded from three layers (in priority order):
//! 1. **Compiled defaults**: [`RdaoSettings::default()`]
//! 2. **Settings file**: `~/.rdao/settings.json` (deep-merged over defaults)
//! 3. **Environment variables**: `RDAO_*` overrides (highest priority)

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{apply_env_overrides, deep_merge, load_settings, load_settings_from_path, settings_path, validate};
pub use types::*;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn re_exports_work() {
        let _settings = RdaoSettings::default();
        let _path = settings_path();
    }

    #[test]
    fn default_settings_match_protocol_defaults() {
        let settings = RdaoSettings::default();
        assert_eq!(settings.client.reconnect_delay_ms, 2323);
        assert_eq!(settings.client.request_send_timeout_ms, 2300);
        assert!(settings.client.queue_requests_when_disconnected);
        assert!(!settings.client.queue_active_requests_on_disconnect);
        assert!(settings.client.request_timeout_ms.is_none());
        assert_eq!(settings.server.path, "/reactive-dao");
        assert_eq!(settings.heartbeat.ping_interval_ms, 10_000);
        assert_eq!(settings.time_sync.min_pong_count, 1);
    }
}
