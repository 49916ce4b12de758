//! Centralized application directory paths.
//!
//! Single source of truth for filesystem paths used by the model store and
//! pipeline. Uses the [`dirs`] crate for platform-appropriate directory
//! resolution.
//!
//! # Directory Layout
//!
//! | Purpose | macOS | Linux |
//! |---------|-------|-------|
//! | App data | `~/Library/Application Support/localvox/` | `~/.local/share/localvox/` |
//! | Config | `~/Library/Application Support/localvox/` | `~/.config/localvox/` |
//! | Cache | `~/Library/Caches/localvox/` | `~/.cache/localvox/` |
//!
//! # Environment Overrides
//!
//! - `LOCALVOX_DATA_DIR` — overrides [`data_dir`]
//! - `LOCALVOX_CONFIG_DIR` — overrides [`config_dir`]
//! - `LOCALVOX_CACHE_DIR` — overrides [`cache_dir`]

use std::path::PathBuf;

/// Application data root directory.
///
/// Resolves to `dirs::data_dir()/localvox/` by default. Override with
/// the `LOCALVOX_DATA_DIR` environment variable.
#[must_use]
pub fn data_dir() -> PathBuf {
    if let Some(override_dir) = std::env::var_os("LOCALVOX_DATA_DIR") {
        return PathBuf::from(override_dir);
    }
    dirs::data_dir()
        .map(|d| d.join("localvox"))
        .unwrap_or_else(|| PathBuf::from("/tmp/localvox-data"))
}

/// Application config directory.
///
/// Resolves to `dirs::config_dir()/localvox/` by default. Override with
/// the `LOCALVOX_CONFIG_DIR` environment variable.
#[must_use]
pub fn config_dir() -> PathBuf {
    if let Some(override_dir) = std::env::var_os("LOCALVOX_CONFIG_DIR") {
        return PathBuf::from(override_dir);
    }
    dirs::config_dir()
        .map(|d| d.join("localvox"))
        .unwrap_or_else(|| PathBuf::from("/tmp/localvox-config"))
}

/// Model store root directory (downloaded model files, registry manifest).
///
/// Resolves to `dirs::cache_dir()/localvox/` by default. Override with
/// the `LOCALVOX_CACHE_DIR` environment variable.
#[must_use]
pub fn cache_dir() -> PathBuf {
    if let Some(override_dir) = std::env::var_os("LOCALVOX_CACHE_DIR") {
        return PathBuf::from(override_dir);
    }
    dirs::cache_dir()
        .map(|d| d.join("localvox"))
        .unwrap_or_else(|| PathBuf::from("/tmp/localvox-cache"))
}

/// Log file directory (`data_dir()/logs/`).
#[must_use]
pub fn logs_dir() -> PathBuf {
    data_dir().join("logs")
}

/// Main config file path (`config_dir()/config.toml`).
#[must_use]
pub fn config_file() -> PathBuf {
    config_dir().join("config.toml")
}

/// Registry manifest path (`cache_dir()/registry.json`).
#[must_use]
pub fn registry_file() -> PathBuf {
    cache_dir().join("registry.json")
}

/// Download audit log path (`data_dir()/downloads.log`).
#[must_use]
pub fn downloads_log_file() -> PathBuf {
    data_dir().join("downloads.log")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_dir_is_nonempty() {
        let dir = data_dir();
        assert!(!dir.as_os_str().is_empty());
    }

    #[test]
    fn data_dir_contains_localvox() {
        let dir = data_dir();
        let s = dir.to_string_lossy();
        assert!(s.contains("localvox"), "data_dir should contain 'localvox': {s}");
    }

    #[test]
    fn config_file_ends_with_config_toml() {
        let path = config_file();
        let s = path.to_string_lossy();
        assert!(s.ends_with("config.toml"), "config_file: {s}");
    }

    #[test]
    fn registry_file_ends_with_registry_json() {
        let path = registry_file();
        let s = path.to_string_lossy();
        assert!(s.ends_with("registry.json"), "registry_file: {s}");
    }

    #[test]
    fn logs_dir_is_subpath_of_data_dir() {
        let logs = logs_dir();
        let data = data_dir();
        assert!(logs.starts_with(&data));
    }

    #[test]
    fn data_dir_override_via_env() {
        let key = "LOCALVOX_DATA_DIR";
        let original = std::env::var_os(key);

        // SAFETY: Tests run single-threaded per module.
        unsafe { std::env::set_var(key, "/custom/data") };
        let result = data_dir();
        assert_eq!(result, PathBuf::from("/custom/data"));

        match original {
            Some(val) => unsafe { std::env::set_var(key, val) },
            None => unsafe { std::env::remove_var(key) },
        }
    }

}
