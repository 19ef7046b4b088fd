//! Application settings management

use crate::PathManager;
use serde::{Deserialize, Serialize};
use std::fs;

/// Application settings stored in settings.toml
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Settings {
    /// Default model ID used for new sessions when the request names none
    pub default_model: Option<String>,
    /// Resumable transport reconnect policy
    #[serde(default)]
    pub transport: TransportSettings,
}

/// Reconnect knobs for the resumable event-stream consumer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportSettings {
    /// Maximum consecutive failed connection attempts before giving up
    pub max_attempts: u32,
    /// First reconnect delay, in milliseconds (doubles per attempt)
    pub initial_backoff_ms: u64,
    /// Upper bound on the reconnect delay, in milliseconds
    pub max_backoff_ms: u64,
    /// HTTP statuses treated as transient
    pub retryable_statuses: Vec<u16>,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff_ms: 250,
            max_backoff_ms: 10_000,
            retryable_statuses: vec![408, 429, 500, 502, 503, 504],
        }
    }
}

impl Settings {
    /// Load settings from the settings file, or return defaults if not found
    pub fn load() -> Self {
        let Some(path) = PathManager::settings_path() else {
            return Self::default();
        };

        let Ok(content) = fs::read_to_string(&path) else {
            return Self::default();
        };

        toml::from_str(&content).unwrap_or_default()
    }

    /// Save settings to the settings file
    pub fn save(&self) -> Result<(), String> {
        let path = PathManager::settings_path().ok_or("Could not determine settings path")?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| format!("Failed to create config dir: {}", e))?;
        }

        let content = toml::to_string_pretty(self)
            .map_err(|e| format!("Failed to serialize settings: {}", e))?;
        fs::write(&path, content).map_err(|e| format!("Failed to write settings: {}", e))?;
        Ok(())
    }
}
