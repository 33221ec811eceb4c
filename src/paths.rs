//! Centralized application directory paths for hark.
//!
//! Provides a single source of truth for all filesystem paths used by the
//! daemon. Uses the [`dirs`] crate for platform-appropriate directory
//! resolution.
//!
//! # Directory Layout
//!
//! | Purpose | macOS | Linux |
//! |---------|-------|-------|
//! | App data | `~/Library/Application Support/hark/` | `~/.local/share/hark/` |
//! | Config | `~/Library/Application Support/hark/` | `~/.config/hark/` |
//!
//! # Environment Overrides
//!
//! All paths can be overridden for testing or custom deployments:
//! - `HARK_DATA_DIR` — overrides [`data_dir`]
//! - `HARK_CONFIG_DIR` — overrides [`config_dir`]

use std::path::PathBuf;

/// Application data root directory.
///
/// Used for persistent state: conversation history, wake-word reference
/// recordings, and logs.
///
/// Resolves to `dirs::data_dir()/hark/` by default. Override with
/// the `HARK_DATA_DIR` environment variable.
#[must_use]
pub fn data_dir() -> PathBuf {
    if let Some(override_dir) = std::env::var_os("HARK_DATA_DIR") {
        return PathBuf::from(override_dir);
    }
    dirs::data_dir()
        .map(|d| d.join("hark"))
        .unwrap_or_else(|| PathBuf::from("/tmp/hark-data"))
}

/// Application config directory.
///
/// Used for `config.toml`.
///
/// Resolves to `dirs::config_dir()/hark/` by default. Override with
/// the `HARK_CONFIG_DIR` environment variable.
#[must_use]
pub fn config_dir() -> PathBuf {
    if let Some(override_dir) = std::env::var_os("HARK_CONFIG_DIR") {
        return PathBuf::from(override_dir);
    }
    dirs::config_dir()
        .map(|d| d.join("hark"))
        .unwrap_or_else(|| PathBuf::from("/tmp/hark-config"))
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

/// Conversation history file path (`data_dir()/history.json`).
#[must_use]
pub fn history_file() -> PathBuf {
    data_dir().join("history.json")
}

/// Wake-word recordings root (`data_dir()/wakewords/`).
///
/// Each wake word keeps its reference WAVs in a subdirectory named after it.
#[must_use]
pub fn wakewords_dir() -> PathBuf {
    data_dir().join("wakewords")
}

/// Reference recordings directory for one wake word.
#[must_use]
pub fn wakeword_templates_dir(wake_word: &str) -> PathBuf {
    wakewords_dir().join(wake_word)
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
    fn config_file_ends_with_config_toml() {
        let path = config_file();
        let s = path.to_string_lossy();
        assert!(s.ends_with("config.toml"), "config_file: {s}");
    }

    #[test]
    fn history_file_ends_with_history_json() {
        let path = history_file();
        let s = path.to_string_lossy();
        assert!(s.ends_with("history.json"), "history_file: {s}");
    }

    #[test]
    fn logs_dir_is_subpath_of_data_dir() {
        let logs = logs_dir();
        let data = data_dir();
        assert!(
            logs.starts_with(&data),
            "logs_dir ({}) should start with data_dir ({})",
            logs.display(),
            data.display()
        );
    }

    #[test]
    fn wakeword_templates_dir_nests_under_wakewords() {
        let templates = wakeword_templates_dir("hark");
        assert!(
            templates.starts_with(wakewords_dir()),
            "templates dir ({}) should start with wakewords dir",
            templates.display()
        );
        assert!(templates.to_string_lossy().ends_with("hark"));
    }

    #[test]
    fn data_dir_override_via_env() {
        let key = "HARK_DATA_DIR";
        let original = std::env::var_os(key);

        // SAFETY: Tests run single-threaded per module.
        unsafe { std::env::set_var(key, "/custom/data") };
        let result = data_dir();
        assert_eq!(result, PathBuf::from("/custom/data"));

        // Restore.
        match original {
            Some(val) => unsafe { std::env::set_var(key, val) },
            None => unsafe { std::env::remove_var(key) },
        }
    }

    #[test]
    fn config_dir_override_via_env() {
        let key = "HARK_CONFIG_DIR";
        let original = std::env::var_os(key);

        unsafe { std::env::set_var(key, "/custom/config") };
        let result = config_dir();
        assert_eq!(result, PathBuf::from("/custom/config"));

        match original {
            Some(val) => unsafe { std::env::set_var(key, val) },
            None => unsafe { std::env::remove_var(key) },
        }
    }
}
