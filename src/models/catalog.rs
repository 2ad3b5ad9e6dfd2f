//! Known models
//!
//! Short names that can be downloaded without spelling out a repository URL.

use crate::types::model::is_valid_model_id;

/// Scheme that marks a reference as a remote repository
pub const URL_SCHEME: &str = "https://";

/// A model the plugin knows how to fetch by short name
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KnownModel {
    pub short_name: &'static str,
    pub source: &'static str,
}

impl KnownModel {
    /// Canonical id the download will be stored under
    pub fn model_id(&self) -> String {
        derive_model_id(self.source).unwrap_or_else(|| self.short_name.to_string())
    }
}

pub const KNOWN_MODELS: &[KnownModel] = &[
    KnownModel {
        short_name: "Llama-2-7b-chat",
        source: "https://huggingface.co/mlc-ai/mlc-chat-Llama-2-7b-chat-hf-q4f16_1",
    },
    KnownModel {
        short_name: "Llama-2-13b-chat",
        source: "https://huggingface.co/mlc-ai/mlc-chat-Llama-2-13b-chat-hf-q4f16_1",
    },
    KnownModel {
        short_name: "Llama-2-70b-chat",
        source: "https://huggingface.co/mlc-ai/mlc-chat-Llama-2-70b-chat-hf-q4f16_1",
    },
];

pub fn is_url(reference: &str) -> bool {
    reference.starts_with(URL_SCHEME)
}

/// Look up a short name
pub fn find_by_name(name: &str) -> Option<&'static KnownModel> {
    KNOWN_MODELS.iter().find(|m| m.short_name == name)
}

/// Look up the catalog entry whose download lands under `model_id`
pub fn find_by_model_id(model_id: &str) -> Option<&'static KnownModel> {
    KNOWN_MODELS.iter().find(|m| m.model_id() == model_id)
}

/// Canonical id for a repository URL: its last path segment without `.git`
///
/// Returns `None` when that segment cannot name a directory under the bundle
/// root (`.`, `..`, or a segment with a backslash).
pub fn derive_model_id(url: &str) -> Option<String> {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    let path = path.strip_prefix(URL_SCHEME).unwrap_or(path);
    let segment = path.rsplit('/').find(|segment| !segment.is_empty())?;
    let model_id = segment.strip_suffix(".git").unwrap_or(segment);
    is_valid_model_id(model_id).then(|| model_id.to_string())
}
