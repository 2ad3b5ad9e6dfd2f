//! LLM inference
//!
//! Engine sessions, history replay and streamed generation. The native
//! backend sits behind [`engine::EngineFactory`]; llama.cpp is compiled in
//! with the `llama` feature.

pub mod adapter;
pub mod engine;
#[cfg(feature = "llama")]
pub mod llama;
pub mod session;
pub mod streaming;
pub mod transcript;

pub use adapter::{Completion, ConversationAdapter, FinishReason, Prompt};
pub use engine::{ChatEngine, EngineError, EngineFactory, GenerationParams};
pub use session::{EngineSession, SessionManager};
pub use streaming::{StreamToken, TokenSink};
