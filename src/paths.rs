//! XDG directory helpers for config/data locations.

use std::path::PathBuf;

/// Base directory for persistent data (session store, logs).
///
/// Uses `RTXN_DATA_DIR` if set, otherwise `$XDG_DATA_HOME/rtxn` or
/// `~/.local/share/rtxn`.
pub(crate) fn data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("RTXN_DATA_DIR")
        && !dir.trim().is_empty()
    {
        return PathBuf::from(dir);
    }

    std::env::var("XDG_DATA_HOME")
        .ok()
        .filter(|s| !s.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("/tmp"))
                .join(".local")
                .join("share")
        })
        .join("rtxn")
}

/// Base directory for config files.
///
/// Uses `RTXN_CONFIG_DIR` if set, otherwise `$XDG_CONFIG_HOME/rtxn` or
/// `~/.config/rtxn`.
pub(crate) fn config_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("RTXN_CONFIG_DIR")
        && !dir.trim().is_empty()
    {
        return PathBuf::from(dir);
    }

    std::env::var("XDG_CONFIG_HOME")
        .ok()
        .filter(|s| !s.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("/tmp"))
                .join(".config")
        })
        .join("rtxn")
}

pub(crate) fn store_dir() -> PathBuf {
    data_dir().join("store")
}

pub(crate) fn log_dir() -> PathBuf {
    data_dir().join("logs")
}
