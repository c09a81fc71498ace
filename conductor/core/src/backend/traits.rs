//! Chat Backend Traits
//!
//! Trait definitions for chat model backends. The engine never talks to a
//! model server directly: the connection pool asks a [`BackendFactory`] for a
//! fresh [`ChatBackend`] per unit of work and drops it afterwards.
//!
//! # Design Philosophy
//!
//! A backend takes an ordered message history and streams the reply back as
//! [`StreamingToken`]s over a channel. Dropping the receiver is the abort
//! signal: the streaming task notices the closed channel and stops reading
//! from the server.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::messages::ChatMessage;

/// Token stream events from chat backends
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StreamingToken {
    /// A chunk of the response
    Token(String),
    /// Response completed successfully
    Complete {
        /// The complete message (may differ from concatenated tokens)
        message: String,
    },
    /// Error occurred during streaming
    Error(String),
}

/// A client bound to one endpoint and model
#[async_trait]
pub trait ChatBackend: Send + Sync {
    /// Get the backend name (e.g., "Ollama")
    fn name(&self) -> &str;

    /// Stream a reply to `history`
    ///
    /// Returns a channel receiver that will receive tokens as they arrive.
    /// The channel closes when the response is complete or an error occurs.
    async fn complete_streaming(
        &self,
        history: &[ChatMessage],
        max_output_tokens: u32,
    ) -> anyhow::Result<mpsc::Receiver<StreamingToken>>;
}

/// Creates backend clients for endpoint/model pairs
pub trait BackendFactory: Send + Sync {
    /// Create a client for `model` served at `endpoint`
    fn create(&self, endpoint: &str, model: &str) -> anyhow::Result<Box<dyn ChatBackend>>;
}
