//! Settings storage
//!
//! Manages persistence of plugin preferences.

use crate::storage::{write_atomic, StorageError};
use crate::system::gpu::RuntimeBackend;
use crate::types::config::DEFAULT_MAX_GEN_LEN;
use crate::types::GenerationOptions;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Repository of prebuilt runtime libraries cloned by `setup`
pub const DEFAULT_LIBS_REPO: &str = "https://github.com/mlc-ai/binary-mlc-llm-libs.git";

/// Plugin settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginSettings {
    /// Directory holding installed bundles, when not the default
    #[serde(default)]
    pub models_dir: Option<PathBuf>,
    /// Generation defaults applied under per-prompt options
    #[serde(default = "default_generation")]
    pub generation: GenerationOptions,
    /// Library flavour to try first
    #[serde(default)]
    pub preferred_backend: Option<RuntimeBackend>,
    /// Where `setup` fetches compiled libraries from
    #[serde(default = "default_libs_repo")]
    pub libs_repo: String,
}

fn default_generation() -> GenerationOptions {
    GenerationOptions {
        max_gen_len: Some(DEFAULT_MAX_GEN_LEN),
        ..Default::default()
    }
}

fn default_libs_repo() -> String {
    DEFAULT_LIBS_REPO.to_string()
}

impl Default for PluginSettings {
    fn default() -> Self {
        Self {
            models_dir: None,
            generation: default_generation(),
            preferred_backend: None,
            libs_repo: default_libs_repo(),
        }
    }
}

impl PluginSettings {
    /// Validate settings values
    ///
    /// Clamps sampling values into range instead of failing, so a hand-edited
    /// file never blocks the plugin.
    pub fn validate(&mut self) {
        let clamp = |v: Option<f32>| v.map(|v| v.clamp(0.0, 1.0));
        self.generation.temperature = clamp(self.generation.temperature);
        self.generation.top_p = clamp(self.generation.top_p);
        self.generation.repetition_penalty = clamp(self.generation.repetition_penalty);

        if self.generation.max_gen_len == Some(0) {
            self.generation.max_gen_len = Some(DEFAULT_MAX_GEN_LEN);
        }

        if self.libs_repo.trim().is_empty() {
            self.libs_repo = default_libs_repo();
        }
    }
}

/// Load settings from disk
///
/// Returns default settings if the file doesn't exist or is corrupted
pub fn load_settings(path: &Path) -> PluginSettings {
    match load_settings_internal(path) {
        Ok(settings) => settings,
        Err(e) => {
            tracing::warn!("Failed to load settings, using defaults: {}", e);
            PluginSettings::default()
        }
    }
}

/// Internal settings loading with error propagation
fn load_settings_internal(path: &Path) -> Result<PluginSettings, StorageError> {
    if !path.exists() {
        tracing::debug!("Settings file not found, using defaults");
        return Ok(PluginSettings::default());
    }

    let json = fs::read_to_string(path).map_err(|e| StorageError::io(path, e))?;
    let mut settings: PluginSettings =
        serde_json::from_str(&json).map_err(|e| StorageError::json(path, e))?;

    settings.validate();

    tracing::debug!("Loaded settings from {}", path.display());
    Ok(settings)
}

/// Save settings to disk
pub fn save_settings(path: &Path, settings: &PluginSettings) -> Result<(), StorageError> {
    let json = serde_json::to_string_pretty(settings).map_err(|e| StorageError::json(path, e))?;
    write_atomic(path, json.as_bytes())?;

    tracing::debug!("Saved settings to {}", path.display());
    Ok(())
}
