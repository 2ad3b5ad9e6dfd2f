//! Installed model discovery
//!
//! Walks the bundle root and reports which subdirectories are runnable models.
//! A bundle counts only when it has both a weights manifest and a compiled
//! library for this platform; anything else is reported as incomplete.

use std::fs;
use std::path::{Path, PathBuf};

use crate::storage::PluginPaths;
use crate::system::gpu::{self, RuntimeBackend};
use crate::types::model::{is_valid_model_id, local_id_from_dir, quantization_tag};
use crate::types::{ChatConfigFile, ModelBundle};

/// Weights manifest written by the MLC weight converter
pub const WEIGHTS_MANIFEST: &str = "ndarray-cache.json";
/// Chat config shipped next to the manifest
pub const CHAT_CONFIG: &str = "mlc-chat-config.json";
/// Directory under the bundle root that holds compiled libraries
pub const LIB_DIR_NAME: &str = "lib";

/// Result of inspecting one candidate directory
#[derive(Debug, Clone, PartialEq)]
pub enum ScanEntry {
    Complete(ModelBundle),
    Incomplete { dir: PathBuf, missing: String },
}

/// Read-only view over the bundle root
#[derive(Debug, Clone)]
pub struct ModelStore {
    models_dir: PathBuf,
    lib_dir: PathBuf,
    backends: Vec<RuntimeBackend>,
}

impl ModelStore {
    pub fn new(models_dir: PathBuf, lib_dir: PathBuf, backends: Vec<RuntimeBackend>) -> Self {
        Self {
            models_dir,
            lib_dir,
            backends,
        }
    }

    /// Store for the given layout, with backends detected on this machine
    pub fn from_paths(paths: &PluginPaths, preferred: Option<RuntimeBackend>) -> Self {
        Self::new(
            paths.models_dir.clone(),
            paths.lib_dir.clone(),
            gpu::backend_order(preferred),
        )
    }

    pub fn models_dir(&self) -> &Path {
        &self.models_dir
    }

    /// Inspect every candidate directory, lazily
    pub fn scan(&self) -> impl Iterator<Item = ScanEntry> + '_ {
        let entries = match fs::read_dir(&self.models_dir) {
            Ok(entries) => Some(entries),
            Err(e) => {
                tracing::debug!("No bundle root at {}: {}", self.models_dir.display(), e);
                None
            }
        };

        entries
            .into_iter()
            .flatten()
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.is_dir() && path.file_name().map_or(false, |n| n != LIB_DIR_NAME))
            .map(move |dir| self.inspect(&dir))
    }

    /// Complete bundles, sorted by id so listings are stable
    pub fn list_installed(&self) -> Vec<ModelBundle> {
        let mut bundles: Vec<ModelBundle> = self
            .scan()
            .filter_map(|entry| match entry {
                ScanEntry::Complete(bundle) => Some(bundle),
                ScanEntry::Incomplete { dir, missing } => {
                    tracing::warn!("Skipping incomplete bundle {}: {}", dir.display(), missing);
                    None
                }
            })
            .collect();
        bundles.sort_by(|a, b| a.model_id.cmp(&b.model_id));
        bundles
    }

    /// Installed bundle with this canonical id
    pub fn find(&self, model_id: &str) -> Option<ModelBundle> {
        if !is_valid_model_id(model_id) || model_id == LIB_DIR_NAME {
            return None;
        }
        let dir = self.models_dir.join(model_id);
        if !dir.is_dir() {
            return None;
        }
        match self.inspect(&dir) {
            ScanEntry::Complete(bundle) => Some(bundle),
            ScanEntry::Incomplete { missing, .. } => {
                tracing::debug!("Bundle {} is incomplete: {}", model_id, missing);
                None
            }
        }
    }

    /// Decide whether one directory is a runnable bundle
    pub fn inspect(&self, dir: &Path) -> ScanEntry {
        let model_id = match dir.file_name().and_then(|n| n.to_str()) {
            Some(name) => name.to_string(),
            None => {
                return ScanEntry::Incomplete {
                    dir: dir.to_path_buf(),
                    missing: "directory name is not valid UTF-8".to_string(),
                }
            }
        };

        let Some(weights_dir) = find_weights_dir(dir) else {
            return ScanEntry::Incomplete {
                dir: dir.to_path_buf(),
                missing: format!("weights manifest {}", WEIGHTS_MANIFEST),
            };
        };

        let config = read_chat_config(&weights_dir.join(CHAT_CONFIG));
        let local_id = config
            .local_id
            .clone()
            .unwrap_or_else(|| local_id_from_dir(&model_id).to_string());
        let lib_stem = config.model_lib.clone().unwrap_or_else(|| local_id.clone());

        let Some(library_path) = self.find_library(&lib_stem) else {
            let flavours: Vec<&str> = self.backends.iter().map(|b| b.as_str()).collect();
            return ScanEntry::Incomplete {
                dir: dir.to_path_buf(),
                missing: format!(
                    "compiled library {}-{{{}}} in {}",
                    lib_stem,
                    flavours.join(","),
                    self.lib_dir.display()
                ),
            };
        };

        ScanEntry::Complete(ModelBundle {
            quantization: quantization_tag(&local_id),
            model_id,
            local_id,
            weights_dir,
            library_path,
            config,
        })
    }

    /// First library matching `stem` in backend preference order
    fn find_library(&self, stem: &str) -> Option<PathBuf> {
        let escaped_dir = glob::Pattern::escape(&self.lib_dir.to_string_lossy());
        let escaped_stem = glob::Pattern::escape(stem);

        for backend in &self.backends {
            let pattern = format!("{}/{}-{}.*", escaped_dir, escaped_stem, backend);
            let Ok(paths) = glob::glob(&pattern) else {
                continue;
            };
            let found = paths.filter_map(|p| p.ok()).find(|path| {
                path.extension()
                    .and_then(|ext| ext.to_str())
                    .map_or(false, |ext| gpu::library_extensions().contains(&ext))
            });
            if found.is_some() {
                return found;
            }
        }
        None
    }
}

/// Bundle dir itself, or its `params/` child, whichever holds the manifest
fn find_weights_dir(dir: &Path) -> Option<PathBuf> {
    [dir.to_path_buf(), dir.join("params")]
        .into_iter()
        .find(|candidate| candidate.join(WEIGHTS_MANIFEST).is_file())
}

fn read_chat_config(path: &Path) -> ChatConfigFile {
    let Ok(json) = fs::read_to_string(path) else {
        return ChatConfigFile::default();
    };
    match serde_json::from_str(&json) {
        Ok(config) => config,
        Err(e) => {
            tracing::warn!("Ignoring unreadable {}: {}", path.display(), e);
            ChatConfigFile::default()
        }
    }
}
