//! Layered settings loading.
//!
//! Compiled defaults, then the JSON file deep-merged on top, then `RDAO_*`
//! environment variables. The result is validated before it is returned.
//! During the merge, objects merge key by key, arrays and scalars replace,
//! and `null` in the file leaves the default in place.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::{debug, warn};

use crate::errors::{Result, SettingsError};
use crate::types::RdaoSettings;

/// `~/.rdao/settings.json`, or under `/tmp` when `HOME` is unset.
pub fn settings_path() -> PathBuf {
    std::env::var_os("HOME")
        .map_or_else(|| PathBuf::from("/tmp"), PathBuf::from)
        .join(".rdao")
        .join("settings.json")
}

/// [`load_settings_from_path`] on [`settings_path`].
pub fn load_settings() -> Result<RdaoSettings> {
    load_settings_from_path(&settings_path())
}

/// Load, merge, override and validate. A missing file is not an error.
pub fn load_settings_from_path(path: &Path) -> Result<RdaoSettings> {
    let mut layered = serde_json::to_value(RdaoSettings::default())?;
    match std::fs::read_to_string(path) {
        Ok(content) => {
            debug!(path = %path.display(), "merging settings file");
            layered = deep_merge(layered, serde_json::from_str(&content)?);
        }
        Err(error) if error.kind() == ErrorKind::NotFound => {
            debug!(path = %path.display(), "no settings file");
        }
        Err(error) => return Err(error.into()),
    }

    let mut settings: RdaoSettings = serde_json::from_value(layered)?;
    apply_env_overrides(&mut settings);
    validate(&settings)?;
    Ok(settings)
}

/// Merge `overlay` into `base`.
pub fn deep_merge(base: Value, overlay: Value) -> Value {
    let (mut base, overlay) = match (base, overlay) {
        (Value::Object(base), Value::Object(overlay)) => (base, overlay),
        (base, Value::Null) => return base,
        (_, overlay) => return overlay,
    };
    for (key, value) in overlay {
        if value.is_null() {
            continue;
        }
        let merged = match base.remove(&key) {
            Some(existing) => deep_merge(existing, value),
            None => value,
        };
        let _ = base.insert(key, merged);
    }
    Value::Object(base)
}

/// Reject combinations the client and server cannot run with.
pub fn validate(settings: &RdaoSettings) -> Result<()> {
    let invalid = |reason: String| -> Result<()> { Err(SettingsError::InvalidValue(reason)) };
    if !settings.server.path.starts_with('/') {
        return invalid(format!("server.path must start with '/', got {:?}", settings.server.path));
    }
    if settings.server.max_get_more_rounds == 0 {
        return invalid("server.maxGetMoreRounds must be at least 1".into());
    }
    if settings.heartbeat.ping_interval_ms == 0 || settings.heartbeat.pong_timeout_ms == 0 {
        return invalid("heartbeat intervals must be positive".into());
    }
    let sync = &settings.time_sync;
    if sync.ping_interval_ms == 0 || sync.ping_interval_ms > sync.max_ping_interval_ms {
        return invalid(format!(
            "timeSync.pingIntervalMs must be in 1..={}",
            sync.max_ping_interval_ms
        ));
    }
    if sync.phases.windows(2).any(|w| w[0].after_pong_count > w[1].after_pong_count) {
        return invalid("timeSync.phases must be ordered by afterPongCount".into());
    }
    Ok(())
}

/// Apply `RDAO_*` variables from the process environment.
///
/// Unparseable values are logged and skipped.
pub fn apply_env_overrides(settings: &mut RdaoSettings) {
    apply_overrides(settings, |name| std::env::var(name).ok());
}

type Apply = fn(&mut RdaoSettings, &str) -> Option<()>;

const OVERRIDES: &[(&str, Apply)] = &[
    ("RDAO_HOST", |s, v| {
        s.server.host = non_empty(v)?;
        Some(())
    }),
    ("RDAO_PORT", |s, v| {
        s.server.port = v.parse().ok()?;
        Some(())
    }),
    ("RDAO_PATH", |s, v| {
        s.server.path = non_empty(v)?;
        Some(())
    }),
    ("RDAO_PING_TIMEOUT_MS", |s, v| {
        s.server.ping_timeout_ms = Some(millis(v, 100)?);
        Some(())
    }),
    ("RDAO_RECONNECT_DELAY_MS", |s, v| {
        s.client.reconnect_delay_ms = millis(v, 0)?;
        Some(())
    }),
    ("RDAO_REQUEST_TIMEOUT_MS", |s, v| {
        s.client.request_timeout_ms = Some(millis(v, 1)?);
        Some(())
    }),
    ("RDAO_LOG_LEVEL", |s, v| {
        s.logging.level = non_empty(v)?;
        Some(())
    }),
    ("RDAO_LOG_JSON", |s, v| {
        s.logging.json = parse_bool(v)?;
        Some(())
    }),
];

fn apply_overrides(settings: &mut RdaoSettings, lookup: impl Fn(&str) -> Option<String>) {
    for (name, apply) in OVERRIDES {
        let Some(value) = lookup(name) else { continue };
        if apply(settings, &value).is_none() {
            warn!(key = name, %value, "ignoring invalid environment override");
        }
    }
}

fn non_empty(value: &str) -> Option<String> {
    (!value.is_empty()).then(|| value.to_owned())
}

/// Milliseconds between `min` and one hour.
fn millis(value: &str, min: u64) -> Option<u64> {
    parse_u64_range(value, min, 3_600_000)
}

/// `true`/`1`/`yes`/`on` or `false`/`0`/`no`/`off`, any case.
pub fn parse_bool(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Parse `value` as an integer inside `min..=max`.
pub fn parse_u64_range(value: &str, min: u64, max: u64) -> Option<u64> {
    value.parse().ok().filter(|n| (min..=max).contains(n))
}
