//! Model types
//!
//! Defines installed bundle metadata and the chat config shipped with each bundle.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::types::GenerationOptions;

/// Prefix used by prebuilt MLC bundle repositories
pub const BUNDLE_PREFIX: &str = "mlc-chat-";

static QUANTIZATION_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"-(q\d+f\d+(?:_\d+)?)$").expect("valid quantization regex"));

/// One installed model on disk
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelBundle {
    /// Canonical id, the bundle directory name
    pub model_id: String,
    /// Id without the bundle prefix, as MLC names it
    pub local_id: String,
    /// Quantization tag such as `q4f16_1`
    pub quantization: Option<String>,
    /// Directory holding the weight shards and manifest
    pub weights_dir: PathBuf,
    /// Compiled runtime library for this platform
    pub library_path: PathBuf,
    /// Chat config read from the bundle
    #[serde(default)]
    pub config: ChatConfigFile,
}

impl ModelBundle {
    /// Sampling defaults declared by the bundle itself
    pub fn default_options(&self) -> GenerationOptions {
        GenerationOptions {
            temperature: self.config.temperature,
            top_p: self.config.top_p,
            repetition_penalty: self.config.repetition_penalty,
            max_gen_len: None,
        }
    }
}

impl std::fmt::Display for ModelBundle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "MlcModel: {}", self.model_id)
    }
}

/// Subset of `mlc-chat-config.json` the plugin reads
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChatConfigFile {
    #[serde(default)]
    pub local_id: Option<String>,
    #[serde(default)]
    pub model_lib: Option<String>,
    #[serde(default)]
    pub conv_template: Option<String>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub top_p: Option<f32>,
    #[serde(default)]
    pub repetition_penalty: Option<f32>,
}

/// Strip the bundle prefix from a directory name
pub fn local_id_from_dir(dir_name: &str) -> &str {
    dir_name.strip_prefix(BUNDLE_PREFIX).unwrap_or(dir_name)
}

/// A model id names exactly one directory directly under the bundle root
pub fn is_valid_model_id(model_id: &str) -> bool {
    !model_id.is_empty()
        && model_id != "."
        && model_id != ".."
        && !model_id.contains(['/', '\\'])
}

/// Trailing quantization tag of a local id, e.g. `q4f16_1`
pub fn quantization_tag(local_id: &str) -> Option<String> {
    QUANTIZATION_RE
        .captures(local_id)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
}
