//! Path utilities for cross-platform support

use std::path::{Path, PathBuf};

/// Expand a path, replacing `~` with the user's home directory
///
/// # Examples
///
/// ```
/// use paypipe_keystore::expand_path;
/// use std::path::PathBuf;
///
/// let path = expand_path(&PathBuf::from("~/paypipe/account.json"));
/// assert!(!path.starts_with("~"));
/// ```
pub fn expand_path(path: &Path) -> PathBuf {
    if let Ok(stripped) = path.strip_prefix("~") {
        if let Some(home) = home_dir() {
            return home.join(stripped);
        }
    }
    path.to_path_buf()
}

fn home_dir() -> Option<PathBuf> {
    #[cfg(target_os = "windows")]
    {
        std::env::var("USERPROFILE").ok().map(PathBuf::from)
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var("HOME").ok().map(PathBuf::from)
    }
}

/// Get the default config directory for the current platform
///
/// - macOS: `~/Library/Application Support/PayPipe`
/// - Linux: `$XDG_CONFIG_HOME/paypipe` or `~/.config/paypipe`
/// - Windows: `%APPDATA%\PayPipe`
pub fn default_config_dir() -> PathBuf {
    #[cfg(target_os = "macos")]
    {
        home_dir()
            .map(|h| h.join("Library/Application Support/PayPipe"))
            .unwrap_or_else(|| PathBuf::from(".paypipe"))
    }
    #[cfg(target_os = "linux")]
    {
        std::env::var("XDG_CONFIG_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                home_dir()
                    .map(|h| h.join(".config"))
                    .unwrap_or_else(|| PathBuf::from("."))
            })
            .join("paypipe")
    }
    #[cfg(target_os = "windows")]
    {
        std::env::var("APPDATA")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("."))
            .join("PayPipe")
    }
    #[cfg(not(any(target_os = "macos", target_os = "linux", target_os = "windows")))]
    {
        home_dir()
            .map(|h| h.join(".paypipe"))
            .unwrap_or_else(|| PathBuf::from(".paypipe"))
    }
}

/// Default location of the account record
pub fn default_account_path() -> PathBuf {
    default_config_dir().join("account.json")
}
