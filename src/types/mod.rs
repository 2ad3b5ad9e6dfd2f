//! Shared type definitions
//!
//! This module contains all shared data types used across the plugin.

pub mod config;
pub mod message;
pub mod model;

pub use config::GenerationOptions;
pub use message::{ConversationTurn, Role};
pub use model::{ChatConfigFile, ModelBundle};
