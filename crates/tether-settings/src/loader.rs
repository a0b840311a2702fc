//! Reading [`BridgeSettings`] from disk and the environment.
//!
//! The file is layered over the compiled defaults as JSON before decoding, so
//! a file may name any subset of options. Nested objects merge key by key,
//! `null` leaves the lower layer untouched, anything else replaces it. The
//! `TETHER_*` variables in [`ENV_OVERRIDES`] are applied last; a malformed or
//! out-of-range variable is logged and skipped rather than failing the load.

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::{debug, warn};

use crate::errors::{Result, SettingsError};
use crate::types::BridgeSettings;

/// `~/.tether/settings.json`, or under `/tmp` when `HOME` is unset.
pub fn settings_path() -> PathBuf {
    std::env::var_os("HOME")
        .map_or_else(|| PathBuf::from("/tmp"), PathBuf::from)
        .join(".tether")
        .join("settings.json")
}

/// [`load_settings_from_path`] at [`settings_path`].
pub fn load_settings() -> Result<BridgeSettings> {
    load_settings_from_path(&settings_path())
}

/// Defaults, then `path` if it exists, then the environment, then
/// [`BridgeSettings::validate`].
pub fn load_settings_from_path(path: &Path) -> Result<BridgeSettings> {
    let mut layered = serde_json::to_value(BridgeSettings::default())?;

    match std::fs::read_to_string(path) {
        Ok(text) => {
            let file: Value = serde_json::from_str(&text).map_err(|source| {
                SettingsError::Malformed {
                    path: path.to_owned(),
                    source,
                }
            })?;
            merge_into(&mut layered, file);
            debug!(path = %path.display(), "settings file applied");
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!(path = %path.display(), "no settings file");
        }
        Err(source) => {
            return Err(SettingsError::Read {
                path: path.to_owned(),
                source,
            });
        }
    }

    let mut settings: BridgeSettings =
        serde_json::from_value(layered).map_err(|source| SettingsError::Malformed {
            path: path.to_owned(),
            source,
        })?;
    apply_env_overrides(&mut settings);
    settings.validate()?;
    Ok(settings)
}

/// `source` layered over `target`. See the module docs for the rules.
pub fn deep_merge(mut target: Value, source: Value) -> Value {
    merge_into(&mut target, source);
    target
}

fn merge_into(target: &mut Value, source: Value) {
    match (target, source) {
        (_, Value::Null) => {}
        (Value::Object(lower), Value::Object(upper)) => {
            for (key, value) in upper {
                match lower.get_mut(&key) {
                    Some(slot) => merge_into(slot, value),
                    None if !value.is_null() => {
                        let _ = lower.insert(key, value);
                    }
                    None => {}
                }
            }
        }
        (slot, value) => *slot = value,
    }
}

/// How one environment variable is parsed and where it lands.
#[derive(Clone, Copy)]
pub enum EnvField {
    /// Non-empty string.
    Text(fn(&mut BridgeSettings, String)),
    /// Milliseconds within `min..=max`.
    Millis {
        /// Smallest accepted value.
        min: u64,
        /// Largest accepted value.
        max: u64,
        /// Setter.
        set: fn(&mut BridgeSettings, u64),
    },
    /// Count up to `max`.
    Count {
        /// Largest accepted value.
        max: u32,
        /// Setter.
        set: fn(&mut BridgeSettings, u32),
    },
    /// Boolean flag, see [`parse_flag`].
    Flag(fn(&mut BridgeSettings, bool)),
}

/// Every recognised `TETHER_*` variable.
pub const ENV_OVERRIDES: &[(&str, EnvField)] = &[
    ("TETHER_URL", EnvField::Text(|s, v| s.url = v)),
    (
        "TETHER_HEARTBEAT_INTERVAL",
        EnvField::Millis {
            min: 10,
            max: 600_000,
            set: |s, v| s.heartbeat_interval_ms = v,
        },
    ),
    (
        "TETHER_RECONNECT_BASE_INTERVAL",
        EnvField::Millis {
            min: 10,
            max: 600_000,
            set: |s, v| s.reconnect_base_interval_ms = v,
        },
    ),
    (
        "TETHER_RECONNECT_MAX_INTERVAL",
        EnvField::Millis {
            min: 10,
            max: 3_600_000,
            set: |s, v| s.reconnect_max_interval_ms = v,
        },
    ),
    (
        "TETHER_MAX_RECONNECT_ATTEMPTS",
        EnvField::Count {
            max: 10_000,
            set: |s, v| s.max_reconnect_attempts = v,
        },
    ),
    (
        "TETHER_CONNECTION_TIMEOUT",
        EnvField::Millis {
            min: 10,
            max: 600_000,
            set: |s, v| s.connection_timeout_ms = v,
        },
    ),
    (
        "TETHER_MESSAGE_TIMEOUT",
        EnvField::Millis {
            min: 10,
            max: 3_600_000,
            set: |s, v| s.message_timeout_ms = v,
        },
    ),
    (
        "TETHER_ENABLE_COMPRESSION",
        EnvField::Flag(|s, v| s.enable_compression = v),
    ),
    (
        "TETHER_ENABLE_ENCRYPTION",
        EnvField::Flag(|s, v| s.enable_encryption = v),
    ),
    (
        "TETHER_AUTO_ACKNOWLEDGE",
        EnvField::Flag(|s, v| s.auto_acknowledge = v),
    ),
    (
        "TETHER_LOCAL_ENDPOINT",
        EnvField::Text(|s, v| s.local_endpoint = v),
    ),
    (
        "TETHER_REMOTE_ENDPOINT",
        EnvField::Text(|s, v| s.remote_endpoint = v),
    ),
];

/// Apply [`ENV_OVERRIDES`] from the process environment.
pub fn apply_env_overrides(settings: &mut BridgeSettings) {
    apply_overrides_with(settings, |name| std::env::var(name).ok());
}

/// Apply [`ENV_OVERRIDES`], resolving each variable through `lookup`.
pub fn apply_overrides_with(
    settings: &mut BridgeSettings,
    lookup: impl Fn(&str) -> Option<String>,
) {
    for &(name, field) in ENV_OVERRIDES {
        let Some(raw) = lookup(name) else {
            continue;
        };
        let applied = match field {
            EnvField::Text(set) => (!raw.is_empty()).then(|| set(settings, raw.clone())),
            EnvField::Millis { min, max, set } => {
                parse_bounded(&raw, min, max).map(|v| set(settings, v))
            }
            EnvField::Count { max, set } => parse_bounded(&raw, 0, u64::from(max))
                .map(|v| set(settings, v as u32)),
            EnvField::Flag(set) => parse_flag(&raw).map(|v| set(settings, v)),
        };
        if applied.is_none() {
            warn!(var = name, value = %raw, "ignoring unusable environment override");
        }
    }
}

/// `1`/`true`/`yes`/`on` or `0`/`false`/`no`/`off`, any case.
pub fn parse_flag(raw: &str) -> Option<bool> {
    const ON: [&str; 4] = ["1", "true", "yes", "on"];
    const OFF: [&str; 4] = ["0", "false", "no", "off"];
    let raw = raw.trim();
    if ON.iter().any(|t| raw.eq_ignore_ascii_case(t)) {
        Some(true)
    } else if OFF.iter().any(|t| raw.eq_ignore_ascii_case(t)) {
        Some(false)
    } else {
        None
    }
}

/// Unsigned integer in `min..=max`.
pub fn parse_bounded(raw: &str, min: u64, max: u64) -> Option<u64> {
    raw.trim()
        .parse::<u64>()
        .ok()
        .filter(|n| (min..=max).contains(n))
}
