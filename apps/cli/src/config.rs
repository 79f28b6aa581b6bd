//! CLI configuration.
//!
//! Stored as TOML at `$XDG_CONFIG_HOME/chanvault/config.toml` (or
//! `~/.config/chanvault/config.toml`) unless `--config` points elsewhere.

use std::path::{Path, PathBuf};

use chanvault_engine::types::DEFAULT_CONCURRENCY;
use chanvault_protocol::constants::DEFAULT_MANIFEST_SEARCH_WINDOW;
use serde::{Deserialize, Serialize};

const APP_DIR: &str = "chanvault";

/// CLI configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    /// Directory holding one subdirectory per category, each holding channels.
    #[serde(default = "default_channel_root")]
    pub channel_root: PathBuf,

    /// Key under which transfer defaults are stored in the settings file.
    #[serde(default = "default_user_id")]
    pub user_id: String,

    /// Recent messages scanned for a manifest.
    #[serde(default = "default_search_window")]
    pub manifest_search_window: usize,

    /// Chunk operations in flight per transfer.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    #[serde(default = "default_settings_path")]
    pub settings_path: PathBuf,

    #[serde(default = "default_key_store")]
    pub key_store: PathBuf,
}

fn base_dir() -> PathBuf {
    chanvault_settings::config_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join(APP_DIR)
}

fn default_channel_root() -> PathBuf {
    base_dir().join("channels")
}

fn default_user_id() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "default".into())
}

fn default_search_window() -> usize {
    DEFAULT_MANIFEST_SEARCH_WINDOW
}

fn default_concurrency() -> usize {
    DEFAULT_CONCURRENCY
}

fn default_settings_path() -> PathBuf {
    base_dir().join("settings.json")
}

fn default_key_store() -> PathBuf {
    base_dir().join("keys.json")
}

impl Default for Config {
    fn default() -> Self {
        Self {
            channel_root: default_channel_root(),
            user_id: default_user_id(),
            manifest_search_window: default_search_window(),
            concurrency: default_concurrency(),
            settings_path: default_settings_path(),
            key_store: default_key_store(),
        }
    }
}

impl Config {
    /// Loads configuration from `path`, or creates a default there if missing.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: Config = toml::from_str(&content)?;
            Ok(config)
        } else {
            let config = Config::default();
            config.save(path)?;
            Ok(config)
        }
    }

    /// Saves the configuration to `path`.
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
        }

        tracing::debug!(path = %path.display(), "configuration saved");
        Ok(())
    }
}

/// Default location of the configuration file.
pub fn default_config_path() -> PathBuf {
    base_dir().join("config.toml")
}
