//! Message types
//!
//! Defines conversation turns exchanged with the host tool.

use serde::{Deserialize, Serialize};

/// Role of a message sender
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Message from the user
    User,
    /// Message from the AI assistant
    Assistant,
    /// System prompt
    System,
}

impl Role {
    /// Upper-case tag used by MLC conversation templates
    pub fn as_tag(&self) -> &'static str {
        match self {
            Role::User => "USER",
            Role::Assistant => "ASSISTANT",
            Role::System => "SYSTEM",
        }
    }
}

/// A single prior exchange supplied by the host tool
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationTurn {
    /// The role of the message sender
    pub role: Role,
    /// The content of the message
    pub text: String,
}

impl ConversationTurn {
    /// Create a new turn
    pub fn new(role: Role, text: impl Into<String>) -> Self {
        Self {
            role,
            text: text.into(),
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::new(Role::User, text)
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self::new(Role::Assistant, text)
    }

    pub fn system(text: impl Into<String>) -> Self {
        Self::new(Role::System, text)
    }
}

/// Last system prompt found in a history, if any
pub fn last_system_prompt(history: &[ConversationTurn]) -> Option<&str> {
    history
        .iter()
        .rev()
        .find(|turn| turn.role == Role::System)
        .map(|turn| turn.text.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_turn_creation() {
        let turn = ConversationTurn::user("Hello, world!");
        assert_eq!(turn.role, Role::User);
        assert_eq!(turn.text, "Hello, world!");
    }

    #[test]
    fn test_role_equality() {
        assert_eq!(Role::User, Role::User);
        assert_ne!(Role::User, Role::Assistant);
    }

    #[test]
    fn test_last_system_prompt_wins() {
        let history = vec![
            ConversationTurn::system("be brief"),
            ConversationTurn::user("hi"),
            ConversationTurn::assistant("hello"),
            ConversationTurn::system("be verbose"),
        ];
        assert_eq!(last_system_prompt(&history), Some("be verbose"));
        assert_eq!(last_system_prompt(&history[1..3]), None);
    }

    #[test]
    fn test_role_serializes_lowercase() {
        let json = serde_json::to_string(&Role::Assistant).unwrap();
        assert_eq!(json, "\"assistant\"");
    }
}
