//! Persistent storage
//!
//! This module handles where plugin state lives on disk: settings, the alias
//! file shared with the host tool, and the installed model bundles.

pub mod aliases;
pub mod scanner;
pub mod settings;

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub use aliases::AliasRegistry;
pub use scanner::{ModelStore, ScanEntry};
pub use settings::PluginSettings;

/// Overrides the host tool's user directory
pub const USER_PATH_ENV: &str = "LLM_USER_PATH";
/// Overrides the bundle root
pub const MODELS_DIR_ENV: &str = "MLC_MODELS_DIR";

const HOST_APP_DIR: &str = "io.datasette.llm";

/// Storage errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("IO error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Corrupt JSON in {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("Could not determine the user configuration directory")]
    NoUserDir,
}

impl StorageError {
    pub(crate) fn io(path: &Path, source: std::io::Error) -> Self {
        StorageError::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    pub(crate) fn json(path: &Path, source: serde_json::Error) -> Self {
        StorageError::Json {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Host tool user directory
///
/// `$LLM_USER_PATH` when set, otherwise the platform config dir joined with
/// the host app name (Linux: `~/.config/io.datasette.llm`).
pub fn get_user_dir() -> Result<PathBuf, StorageError> {
    if let Ok(path) = std::env::var(USER_PATH_ENV) {
        if !path.trim().is_empty() {
            return Ok(PathBuf::from(path));
        }
    }
    directories::BaseDirs::new()
        .map(|dirs| dirs.config_dir().join(HOST_APP_DIR))
        .ok_or(StorageError::NoUserDir)
}

/// Every location the plugin reads or writes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginPaths {
    /// Host tool user directory
    pub user_dir: PathBuf,
    /// `<user_dir>/mlc`
    pub plugin_dir: PathBuf,
    /// Root holding one directory per installed bundle
    pub models_dir: PathBuf,
    /// Compiled runtime libraries
    pub lib_dir: PathBuf,
    /// Alias file shared with the host tool
    pub aliases_file: PathBuf,
    /// Plugin settings
    pub settings_file: PathBuf,
}

impl PluginPaths {
    /// Layout rooted at a given user directory
    pub fn from_user_dir(user_dir: impl Into<PathBuf>) -> Self {
        let user_dir = user_dir.into();
        let plugin_dir = user_dir.join("mlc");
        let models_dir = plugin_dir.join("dist").join("prebuilt");
        Self {
            lib_dir: models_dir.join("lib"),
            aliases_file: user_dir.join("aliases.json"),
            settings_file: plugin_dir.join("settings.json"),
            models_dir,
            plugin_dir,
            user_dir,
        }
    }

    /// Layout for the current environment, with settings and env overrides applied
    pub fn discover() -> Result<Self, StorageError> {
        let mut paths = Self::from_user_dir(get_user_dir()?);
        let settings = settings::load_settings(&paths.settings_file);
        if let Some(dir) = settings.models_dir {
            paths.set_models_dir(dir);
        }
        if let Ok(dir) = std::env::var(MODELS_DIR_ENV) {
            if !dir.trim().is_empty() {
                paths.set_models_dir(PathBuf::from(dir));
            }
        }
        Ok(paths)
    }

    /// Point the bundle root somewhere else; the lib dir follows it
    pub fn set_models_dir(&mut self, dir: PathBuf) {
        self.lib_dir = dir.join("lib");
        self.models_dir = dir;
    }
}

/// Write `contents` to `path` through a temp file in the same directory and a rename
pub(crate) fn write_atomic(path: &Path, contents: &[u8]) -> Result<(), StorageError> {
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent).map_err(|e| StorageError::io(parent, e))?;

    let mut temp = tempfile::NamedTempFile::new_in(parent).map_err(|e| StorageError::io(parent, e))?;
    temp.write_all(contents)
        .and_then(|_| temp.as_file().sync_all())
        .map_err(|e| StorageError::io(temp.path(), e))?;
    temp.persist(path)
        .map_err(|e| StorageError::io(path, e.error))?;
    Ok(())
}
