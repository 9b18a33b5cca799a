//! PayPipe Settings
//!
//! Settings file shared by the CLI's client and relay modes.
//!
//! ## Usage
//!
//! ```no_run
//! use paypipe_settings::Settings;
//!
//! let mut settings = Settings::load_or_default()?;
//! settings.client.local_server = "127.0.0.1:1081".to_string();
//! settings.save()?;
//! # Ok::<(), paypipe_settings::SettingsError>(())
//! ```

mod config;

pub use config::Settings;

use std::path::PathBuf;

use paypipe_keystore::default_config_dir;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SettingsError {
    #[error("Failed to read settings: {0}")]
    ReadError(std::io::Error),

    #[error("Failed to write settings: {0}")]
    WriteError(std::io::Error),

    #[error("Failed to parse settings: {0}")]
    ParseError(serde_json::Error),

    #[error("Failed to create config directory: {0}")]
    CreateDirError(std::io::Error),
}

pub type Result<T> = std::result::Result<T, SettingsError>;

/// Get the default settings file path
pub fn default_settings_path() -> PathBuf {
    default_config_dir().join("settings.json")
}
