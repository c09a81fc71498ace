//! Conversation Messages
//!
//! The unit of conversation history. Every completion receives an ordered
//! list of these, either the conversation ledger or a list built for a
//! single call (classification, keyword derivation, suggestions).

use serde::{Deserialize, Serialize};

/// Label written before echoing the user's turn
pub const PREFIX_USER: &str = "You: ";

/// Label written before streaming the assistant's turn
pub const PREFIX_ASSISTANT: &str = "Assistant: ";

/// Label written before streaming the rewritten instruction
pub const PREFIX_REWRITE: &str = "Interpreted: ";

/// Message role
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    /// Instructions for the model
    System,
    /// The human side of the conversation
    User,
    /// Model output
    Assistant,
}

impl MessageRole {
    /// Wire name used by chat APIs
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

/// A single message in a conversation
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Who sent this message
    pub role: MessageRole,
    /// Message content
    pub text: String,
}

impl ChatMessage {
    /// Create a message with an explicit role
    pub fn new(role: MessageRole, text: impl Into<String>) -> Self {
        Self {
            role,
            text: text.into(),
        }
    }

    /// Create a system message
    pub fn system(text: impl Into<String>) -> Self {
        Self::new(MessageRole::System, text)
    }

    /// Create a user message
    pub fn user(text: impl Into<String>) -> Self {
        Self::new(MessageRole::User, text)
    }

    /// Create an assistant message
    pub fn assistant(text: impl Into<String>) -> Self {
        Self::new(MessageRole::Assistant, text)
    }
}

/// Conversation identifier, attached to tracing spans
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConversationId(pub uuid::Uuid);

impl ConversationId {
    /// Generate a new random conversation ID
    #[must_use]
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for ConversationId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConversationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
