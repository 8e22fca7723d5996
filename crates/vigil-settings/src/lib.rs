//! # vigil-settings
//!
//! Configuration for the Vigil event core, loaded from three layers (in
//! priority order):
//! 1. **Compiled defaults** from [`VigilSettings::default()`]
//! 2. **Settings file** at `~/.vigil/settings.json` or an explicit path,
//!    deep-merged over defaults
//! 3. **Environment variables** (`VIGIL_*`, plus `REDIS_URL` and `JWT_SECRET`)

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{apply_env_overrides, deep_merge, load_settings, load_settings_from_path, settings_path};
pub use types::{
    AuthSettings, BusSettings, HeartbeatSettings, LoggingSettings, ServerSettings, VigilSettings,
};
