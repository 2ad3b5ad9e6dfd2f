//! llm-mlc library
//!
//! Runs prebuilt MLC chat models installed under the `llm` user directory.
//! Model names are resolved through aliases and a small catalog of known
//! models, loaded engines are cached per model for the life of the process,
//! and conversation history is replayed into them incrementally.

pub mod cli;
pub mod error;
pub mod inference;
pub mod models;
pub mod storage;
pub mod system;
pub mod types;

pub use error::MlcError;
pub use inference::{Completion, ConversationAdapter, Prompt, SessionManager, TokenSink};
pub use models::{ModelManager, Resolution, Resolver};
pub use storage::{AliasRegistry, ModelStore, PluginPaths};
pub use types::{ConversationTurn, GenerationOptions, ModelBundle, Role};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const NAME: &str = env!("CARGO_PKG_NAME");
