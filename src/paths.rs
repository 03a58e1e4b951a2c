//! Application directory paths.
//!
//! Uses the [`dirs`] crate for platform-appropriate resolution.
//!
//! | Purpose | macOS | Linux |
//! |---------|-------|-------|
//! | Data (chat logs, diagnostics, model files) | `~/Library/Application Support/companion/` | `~/.local/share/companion/` |
//! | Config | `~/Library/Application Support/companion/` | `~/.config/companion/` |
//!
//! Overrides: `COMPANION_DATA_DIR`, `COMPANION_CONFIG_DIR`.

use std::path::PathBuf;

/// Application data root directory.
#[must_use]
pub fn data_dir() -> PathBuf {
    if let Some(override_dir) = std::env::var_os("COMPANION_DATA_DIR") {
        return PathBuf::from(override_dir);
    }
    dirs::data_dir()
        .map(|d| d.join("companion"))
        .unwrap_or_else(|| PathBuf::from("/tmp/companion-data"))
}

/// Application config directory.
#[must_use]
pub fn config_dir() -> PathBuf {
    if let Some(override_dir) = std::env::var_os("COMPANION_CONFIG_DIR") {
        return PathBuf::from(override_dir);
    }
    dirs::config_dir()
        .map(|d| d.join("companion"))
        .unwrap_or_else(|| PathBuf::from("/tmp/companion-config"))
}

/// Directory holding persisted conversation logs.
#[must_use]
pub fn chat_log_dir() -> PathBuf {
    data_dir().join("chat")
}

/// Directory for generated model support files (chat templates).
#[must_use]
pub fn model_support_dir() -> PathBuf {
    data_dir().join("models")
}

/// Directory for rolling diagnostic log files.
#[must_use]
pub fn diagnostics_dir() -> PathBuf {
    data_dir().join("logs")
}
