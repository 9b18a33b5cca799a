//! Settings file

use std::path::{Path, PathBuf};

use paypipe_core::{ClientConfig, ServerConfig};
use paypipe_keystore::{default_account_path, expand_path};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::{default_settings_path, Result, SettingsError};

/// Main settings structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Account file location (supports `~`); platform default when unset
    #[serde(default)]
    pub account_path: Option<String>,

    /// Log level name, overridden by `RUST_LOG`
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Client mode
    #[serde(default)]
    pub client: ClientConfig,

    /// Relay mode
    #[serde(default)]
    pub server: ServerConfig,

    /// Custom settings file path (not serialized)
    #[serde(skip)]
    config_path: Option<PathBuf>,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            account_path: None,
            log_level: default_log_level(),
            client: ClientConfig::default(),
            server: ServerConfig::default(),
            config_path: None,
        }
    }
}

impl Settings {
    /// Load settings from the default path, or create defaults
    pub fn load_or_default() -> Result<Self> {
        Self::load_from(&default_settings_path())
    }

    /// Load settings from a specific path, or create defaults
    pub fn load_from(path: &Path) -> Result<Self> {
        let path = expand_path(path);
        if path.exists() {
            let content = std::fs::read_to_string(&path).map_err(SettingsError::ReadError)?;
            let mut settings: Settings =
                serde_json::from_str(&content).map_err(SettingsError::ParseError)?;
            settings.config_path = Some(path.clone());
            info!("Loaded settings from {:?}", path);
            Ok(settings)
        } else {
            Ok(Self {
                config_path: Some(path),
                ..Default::default()
            })
        }
    }

    /// Save settings to the path they were loaded from
    pub fn save(&self) -> Result<()> {
        let path = self.config_path.clone().unwrap_or_else(default_settings_path);
        self.save_to(&path)
    }

    /// Save settings to a specific path
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).map_err(SettingsError::CreateDirError)?;
            }
        }

        let content = serde_json::to_string_pretty(self).map_err(SettingsError::ParseError)?;
        std::fs::write(path, content).map_err(SettingsError::WriteError)?;
        info!("Saved settings to {:?}", path);
        Ok(())
    }

    /// Resolved account file location
    pub fn account_path(&self) -> PathBuf {
        match &self.account_path {
            Some(p) => expand_path(Path::new(p)),
            None => default_account_path(),
        }
    }
}
