//! Error taxonomy
//!
//! Every failure a caller can see maps to one variant here, and every message
//! says what is missing and which command fixes it.

use thiserror::Error;

use crate::inference::engine::EngineError;
use crate::models::install::InstallError;
use crate::storage::StorageError;

/// Errors surfaced by the plugin to the host tool
#[derive(Debug, Error)]
pub enum MlcError {
    #[error(
        "Unknown model '{name}'. Run 'llm-mlc models' to list installed models, \
         or 'llm-mlc download-model <name-or-url>' to fetch one"
    )]
    UnknownModel { name: String },

    #[error(
        "Model '{model_id}' is not installed. Run 'llm-mlc download-model {fetch}' to install it"
    )]
    ModelNotInstalled { model_id: String, fetch: String },

    #[error("Failed to load model '{model_id}': {source}")]
    EngineInitialization {
        model_id: String,
        #[source]
        source: EngineError,
    },

    #[error("Generation failed for '{model_id}': {source}")]
    Generation {
        model_id: String,
        #[source]
        source: EngineError,
    },

    #[error("Invalid alias '{alias}': {reason}")]
    InvalidAlias { alias: String, reason: String },

    #[error("Invalid option: {0}")]
    InvalidOption(String),

    #[error("Could not read or write plugin state: {0}")]
    Persistence(#[from] StorageError),

    #[error("Model download failed: {0}")]
    Install(#[from] InstallError),

    #[error("{0}. Run 'llm-mlc setup' first")]
    Setup(String),
}

impl MlcError {
    /// True for errors raised before any output could have been produced
    pub fn is_pre_output(&self) -> bool {
        !matches!(self, MlcError::Generation { .. })
    }
}
