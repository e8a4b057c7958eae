//! # xqws-settings
//!
//! Configuration with layered sources (in priority order):
//! 1. **Compiled defaults**: [`XqwsSettings::default()`]
//! 2. **Settings file**: JSON, deep-merged over defaults
//! 3. **Environment variables**: `XQWS_*` overrides (highest priority)
//!
//! Settings are loaded once by the server's startup code and passed down
//! explicitly; there is no global instance.

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{deep_merge, load_settings, load_settings_from_path, settings_path};
pub use types::*;
