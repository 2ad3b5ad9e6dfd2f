//! Native engine seam
//!
//! A [`ChatEngine`] is one loaded model handle. It keeps its own conversation
//! state, which callers drive with `reset` and `apply_turn`, and produces a
//! lazy stream of text fragments for each prompt. [`EngineFactory`] builds
//! handles from an installed bundle.

use thiserror::Error;

use crate::types::{ConversationTurn, GenerationOptions, ModelBundle};

/// Engine errors
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Missing model artifact: {0}")]
    MissingArtifact(String),

    #[error("Failed to load model: {0}")]
    Load(String),

    #[error("No native engine is available: {0}")]
    Unavailable(String),

    #[error("Tokenization failed: {0}")]
    Tokenize(String),

    #[error("Decoding failed: {0}")]
    Decode(String),

    #[error("Engine task failed: {0}")]
    Task(String),
}

/// Resolved sampling parameters handed to the engine
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationParams {
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
    pub repetition_penalty: Option<f32>,
    pub max_gen_len: u32,
}

impl From<&GenerationOptions> for GenerationParams {
    fn from(options: &GenerationOptions) -> Self {
        Self {
            temperature: options.temperature,
            top_p: options.top_p,
            repetition_penalty: options.repetition_penalty,
            max_gen_len: options.max_gen_len_or_default(),
        }
    }
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self::from(&GenerationOptions::default())
    }
}

/// Lazy, finite sequence of generated fragments
///
/// Ends with `None` on natural completion. An `Err` item ends the stream.
pub type FragmentStream<'a> = Box<dyn Iterator<Item = Result<String, EngineError>> + 'a>;

/// One loaded model handle
pub trait ChatEngine: Send {
    /// Clear conversation state and start over with `system`
    fn reset(&mut self, system: Option<&str>) -> Result<(), EngineError>;

    /// Append one prior turn to the engine's conversation state
    fn apply_turn(&mut self, turn: &ConversationTurn) -> Result<(), EngineError>;

    /// Generate a reply to `prompt` on top of the current conversation state
    ///
    /// The prompt and reply are not added to the conversation state; callers
    /// apply them as turns once generation has completed.
    fn generate<'a>(
        &'a mut self,
        prompt: &'a str,
        params: &GenerationParams,
    ) -> Result<FragmentStream<'a>, EngineError>;
}

/// Builds engine handles for installed bundles
pub trait EngineFactory: Send + Sync {
    fn open(&self, bundle: &ModelBundle) -> Result<Box<dyn ChatEngine>, EngineError>;
}

/// Factory used when the crate is built without a native backend
#[derive(Debug, Default, Clone, Copy)]
pub struct UnavailableEngineFactory;

impl EngineFactory for UnavailableEngineFactory {
    fn open(&self, bundle: &ModelBundle) -> Result<Box<dyn ChatEngine>, EngineError> {
        Err(EngineError::Unavailable(format!(
            "cannot run {}; rebuild llm-mlc with `--features llama` (or cuda, vulkan, metal)",
            bundle.model_id
        )))
    }
}

/// Factory for the backend compiled into this build
pub fn default_factory() -> std::sync::Arc<dyn EngineFactory> {
    #[cfg(feature = "llama")]
    {
        std::sync::Arc::new(crate::inference::llama::LlamaEngineFactory::default())
    }

    #[cfg(not(feature = "llama"))]
    {
        std::sync::Arc::new(UnavailableEngineFactory)
    }
}
