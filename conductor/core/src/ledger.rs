//! Conversation Ledger
//!
//! The ordered, append-only history of one conversation. Messages are only
//! ever pushed; nothing is edited, reordered or truncated.

use std::time::Duration;

use crate::completion::{CompletionOptions, Completions, WordCallback};
use crate::error::EngineError;
use crate::messages::ChatMessage;

/// Append-only message history with a completion hook
pub struct Ledger {
    history: Vec<ChatMessage>,
    completions: Completions,
}

impl Ledger {
    /// Create an empty ledger
    pub fn new(completions: Completions) -> Self {
        Self {
            history: Vec::new(),
            completions,
        }
    }

    /// The full history, oldest first
    #[must_use]
    pub fn history(&self) -> &[ChatMessage] {
        &self.history
    }

    /// Number of messages recorded
    #[must_use]
    pub fn len(&self) -> usize {
        self.history.len()
    }

    /// Whether nothing has been recorded yet
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.history.is_empty()
    }

    /// Completion service this ledger replies through
    #[must_use]
    pub fn completions(&self) -> &Completions {
        &self.completions
    }

    /// Append `message` without asking for a reply
    pub fn push(&mut self, message: ChatMessage) {
        self.history.push(message);
    }

    /// Append `message`, optionally followed by a model reply
    ///
    /// The message is recorded before anything else happens, so it stays in
    /// the history even if the reply fails. With `respond` set, the reply is
    /// computed over the whole updated history, streamed to `word_callback`,
    /// appended and returned.
    ///
    /// # Errors
    ///
    /// Completion failures when `respond` is set. The reply is not appended
    /// in that case.
    pub async fn send_message(
        &mut self,
        message: ChatMessage,
        respond: bool,
        word_callback: Option<&dyn WordCallback>,
        timeout: Option<Duration>,
    ) -> Result<Option<ChatMessage>, EngineError> {
        self.history.push(message);
        if !respond {
            return Ok(None);
        }

        let options = self.completions.options().with_timeout(timeout);
        let reply = self.create_ai_response(word_callback, &options).await?;
        self.history.push(reply.clone());
        Ok(Some(reply))
    }

    /// Run a completion over the current history without recording anything
    ///
    /// # Errors
    ///
    /// Completion failures.
    pub async fn create_ai_response(
        &self,
        word_callback: Option<&dyn WordCallback>,
        options: &CompletionOptions,
    ) -> Result<ChatMessage, EngineError> {
        self.completions
            .create_ai_response(&self.history, word_callback, options)
            .await
    }
}
