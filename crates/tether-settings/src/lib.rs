//! # tether-settings
//!
//! Configuration for the tether bridge, loaded in three layers (in priority
//! order):
//! 1. **Compiled defaults**: [`BridgeSettings::default()`]
//! 2. **Settings file**: `~/.tether/settings.json` or an explicit path,
//!    deep-merged over the defaults
//! 3. **Environment variables**: `TETHER_*` overrides (highest priority)
//!
//! There is no global instance: callers load settings and hand them to
//! `Bridge::new` explicitly.

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{deep_merge, load_settings, load_settings_from_path, settings_path};
pub use types::BridgeSettings;
