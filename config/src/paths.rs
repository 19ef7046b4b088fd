//! Filesystem locations for configuration.

use std::path::PathBuf;

pub struct PathManager;

impl PathManager {
    /// Base configuration directory (e.g. `~/.config/rill` on Linux).
    pub fn config_dir() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("rill"))
    }

    /// Path of the settings file.
    pub fn settings_path() -> Option<PathBuf> {
        Self::config_dir().map(|dir| dir.join("settings.toml"))
    }
}
