//! Centralized directory paths for the update scheduler.
//!
//! Uses the [`dirs`] crate for platform-appropriate directory
//! resolution.
//!
//! # Environment Overrides
//!
//! - `UPDATE_SCHEDULER_CONFIG_DIR` overrides [`config_dir`]

use std::path::PathBuf;

/// Application config directory.
///
/// Used for `scheduler.toml` and the `settings.json` key-value document.
///
/// Resolves to `dirs::config_dir()/update-scheduler/` by default. Override
/// with the `UPDATE_SCHEDULER_CONFIG_DIR` environment variable.
#[must_use]
pub fn config_dir() -> PathBuf {
    if let Some(override_dir) = std::env::var_os("UPDATE_SCHEDULER_CONFIG_DIR") {
        return PathBuf::from(override_dir);
    }
    dirs::config_dir()
        .map(|d| d.join("update-scheduler"))
        .unwrap_or_else(|| PathBuf::from("/tmp/update-scheduler-config"))
}

/// Main config file path (`config_dir()/scheduler.toml`).
#[must_use]
pub fn config_file() -> PathBuf {
    config_dir().join("scheduler.toml")
}

/// Settings document path (`config_dir()/settings.json`).
#[must_use]
pub fn settings_file() -> PathBuf {
    config_dir().join("settings.json")
}
