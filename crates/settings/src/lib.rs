//! Per-user transfer defaults.
//!
//! Settings live in one JSON object keyed by user id. Every save takes an
//! exclusive lock on `<file>.lock`, re-reads the file and replaces only the
//! caller's entry, so writers in other threads or processes never drop each
//! other's users.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

/// Default chunk size stored for a new user (8 MiB).
pub const DEFAULT_CHUNK_SIZE: usize = 8 * 1024 * 1024;

/// Errors from the settings store.
#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("failed to persist settings: {0}")]
    Persist(String),
}

/// Transfer defaults for one user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UserSettings {
    pub encrypt: bool,
    pub compress: bool,
    pub chunk_size: usize,
}

impl Default for UserSettings {
    fn default() -> Self {
        Self {
            encrypt: false,
            compress: false,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

/// JSON-file settings store.
#[derive(Debug, Clone)]
pub struct SettingsStore {
    path: PathBuf,
}

impl SettingsStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the settings for `user_id`, or the defaults if none are saved.
    pub fn load(&self, user_id: &str) -> Result<UserSettings, SettingsError> {
        let map = read_map(&self.path)?;
        match map.get(user_id) {
            Some(value) => Ok(serde_json::from_value(value.clone())?),
            None => Ok(UserSettings::default()),
        }
    }

    /// Replaces the settings for `user_id`.
    pub fn save(&self, user_id: &str, settings: &UserSettings) -> Result<(), SettingsError> {
        self.update(user_id, |s| *s = settings.clone()).map(|_| ())
    }

    /// Applies `f` to the stored settings of `user_id` and saves the result.
    pub fn update<F>(&self, user_id: &str, f: F) -> Result<UserSettings, SettingsError>
    where
        F: FnOnce(&mut UserSettings),
    {
        let _lock = lock_exclusive(&self.path)?;

        let mut map = read_map(&self.path)?;
        let mut settings = match map.get(user_id) {
            Some(value) => serde_json::from_value(value.clone())?,
            None => UserSettings::default(),
        };
        f(&mut settings);
        map.insert(user_id.to_string(), serde_json::to_value(&settings)?);
        write_map(&self.path, &map)?;
        debug!(user = user_id, path = ?self.path, "saved settings");
        Ok(settings)
    }
}

/// Holds an advisory lock on the sidecar `<path>.lock` until dropped.
fn lock_exclusive(path: &Path) -> Result<File, SettingsError> {
    let mut lock_path = path.as_os_str().to_owned();
    lock_path.push(".lock");
    let lock_path = PathBuf::from(lock_path);
    if let Some(dir) = lock_path.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir)?;
    }
    let file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(&lock_path)?;
    file.lock()?;
    Ok(file)
}

fn read_map(path: &Path) -> Result<Map<String, Value>, SettingsError> {
    let data = match std::fs::read_to_string(path) {
        Ok(data) => data,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Map::new()),
        Err(e) => return Err(e.into()),
    };
    if data.trim().is_empty() {
        return Ok(Map::new());
    }
    Ok(serde_json::from_str(&data)?)
}

fn write_map(path: &Path, map: &Map<String, Value>) -> Result<(), SettingsError> {
    let json = serde_json::to_string_pretty(map)?;
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    std::fs::create_dir_all(&dir)?;

    let mut tmp = tempfile::NamedTempFile::new_in(&dir)?;
    tmp.write_all(json.as_bytes())?;
    tmp.as_file().sync_all()?;
    tmp.persist(path)
        .map_err(|e| SettingsError::Persist(e.to_string()))?;
    Ok(())
}

/// Returns the platform-specific config directory.
pub fn config_dir() -> Option<PathBuf> {
    #[cfg(target_os = "linux")]
    {
        std::env::var("XDG_CONFIG_HOME")
            .ok()
            .map(PathBuf::from)
            .or_else(|| {
                std::env::var("HOME")
                    .ok()
                    .map(|h| PathBuf::from(h).join(".config"))
            })
    }

    #[cfg(target_os = "windows")]
    {
        std::env::var("APPDATA").ok().map(PathBuf::from)
    }

    #[cfg(not(any(target_os = "linux", target_os = "windows")))]
    {
        std::env::var("HOME")
            .ok()
            .map(|h| PathBuf::from(h).join(".config"))
    }
}
