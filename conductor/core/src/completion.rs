//! Completion Call
//!
//! Runs one streamed completion inside the connection pool and folds the
//! stream into a single assistant message.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::backend::StreamingToken;
use crate::config::DEFAULT_ENDPOINT_PREFIX;
use crate::error::EngineError;
use crate::messages::ChatMessage;
use crate::routing::ConnectionPool;
use crate::sink::SinkError;

/// Default cap on generated tokens per completion
pub const DEFAULT_MAX_OUTPUT_TOKENS: u32 = 4000;

/// Receives each streamed chunk before it is accumulated
#[async_trait]
pub trait WordCallback: Send + Sync {
    /// Handle one chunk; an error aborts the completion
    async fn on_word(&self, word: &str) -> Result<(), SinkError>;
}

/// Per-call completion options
#[derive(Clone, Debug)]
pub struct CompletionOptions {
    /// Pool wait; `None` uses the pool default, `Some(ZERO)` waits forever
    pub timeout: Option<Duration>,
    /// Endpoint prefix to run against
    pub endpoint_prefix: String,
    /// Cap on generated tokens
    pub max_output_tokens: u32,
}

impl Default for CompletionOptions {
    fn default() -> Self {
        Self {
            timeout: None,
            endpoint_prefix: DEFAULT_ENDPOINT_PREFIX.to_string(),
            max_output_tokens: DEFAULT_MAX_OUTPUT_TOKENS,
        }
    }
}

impl CompletionOptions {
    /// Options with defaults
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the pool wait
    #[must_use]
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the endpoint prefix
    #[must_use]
    pub fn with_endpoint(mut self, prefix: impl Into<String>) -> Self {
        self.endpoint_prefix = prefix.into();
        self
    }

    /// Set the token cap
    #[must_use]
    pub fn with_max_output_tokens(mut self, max_output_tokens: u32) -> Self {
        self.max_output_tokens = max_output_tokens;
        self
    }
}

/// Completion entry point shared by every capability
#[derive(Clone)]
pub struct Completions {
    pool: Arc<ConnectionPool>,
    max_output_tokens: u32,
}

impl Completions {
    /// Create over `pool`
    pub fn new(pool: Arc<ConnectionPool>) -> Self {
        Self {
            pool,
            max_output_tokens: DEFAULT_MAX_OUTPUT_TOKENS,
        }
    }

    /// Set the token cap used by [`Completions::options`]
    #[must_use]
    pub fn with_max_output_tokens(mut self, max_output_tokens: u32) -> Self {
        self.max_output_tokens = max_output_tokens;
        self
    }

    /// The underlying pool
    #[must_use]
    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    /// Default options carrying this instance's token cap
    #[must_use]
    pub fn options(&self) -> CompletionOptions {
        CompletionOptions::new().with_max_output_tokens(self.max_output_tokens)
    }

    /// Stream a reply to `history` and return it as one assistant message
    ///
    /// `word_callback` sees every chunk before it is appended to the result.
    /// Dropping the returned future drops the stream receiver, which stops
    /// the backend task, and releases the pool permit.
    ///
    /// # Errors
    ///
    /// Pool failures, backend errors (including an error token mid-stream),
    /// and callback errors.
    pub async fn create_ai_response(
        &self,
        history: &[ChatMessage],
        word_callback: Option<&dyn WordCallback>,
        options: &CompletionOptions,
    ) -> Result<ChatMessage, EngineError> {
        let max_output_tokens = options.max_output_tokens;

        self.pool
            .with_connection(
                &options.endpoint_prefix,
                options.timeout,
                |client| async move {
                    let mut rx = client
                        .complete_streaming(history, max_output_tokens)
                        .await
                        .map_err(|e| EngineError::Backend(format!("{e:#}")))?;

                    let mut text = String::new();
                    while let Some(token) = rx.recv().await {
                        match token {
                            StreamingToken::Token(chunk) => {
                                if let Some(callback) = word_callback {
                                    callback.on_word(&chunk).await?;
                                }
                                text.push_str(&chunk);
                            }
                            StreamingToken::Complete { message } => {
                                if text.is_empty() && !message.is_empty() {
                                    text = message;
                                }
                                break;
                            }
                            StreamingToken::Error(e) => {
                                tracing::warn!(backend = client.name(), error = %e, "Completion stream failed");
                                return Err(EngineError::Backend(e));
                            }
                        }
                    }

                    Ok(ChatMessage::assistant(text))
                },
            )
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{completions_with, MockReply, RecordingWords};
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_streams_then_accumulates() {
        let (completions, factory) = completions_with(1, vec![MockReply::text("Hello there, friend")]);
        let words = RecordingWords::default();

        let reply = completions
            .create_ai_response(&[ChatMessage::user("hi")], Some(&words), &completions.options())
            .await
            .unwrap();

        assert_eq!(reply, ChatMessage::assistant("Hello there, friend"));
        assert_eq!(words.words(), vec!["Hello ", "there, ", "friend"]);
        assert_eq!(factory.requests()[0], vec![ChatMessage::user("hi")]);
    }

    #[tokio::test]
    async fn test_stream_error_is_backend_error() {
        let (completions, _) = completions_with(1, vec![MockReply::Error("model crashed".into())]);

        let result = completions
            .create_ai_response(&[ChatMessage::user("hi")], None, &completions.options())
            .await;

        assert!(matches!(result, Err(EngineError::Backend(e)) if e == "model crashed"));
        assert_eq!(completions.pool().available_permits(), 1);
    }

    #[tokio::test]
    async fn test_callback_error_aborts() {
        let (completions, _) = completions_with(1, vec![MockReply::text("one two three")]);
        let words = RecordingWords::failing_after(1);

        let result = completions
            .create_ai_response(&[ChatMessage::user("hi")], Some(&words), &completions.options())
            .await;

        assert!(matches!(result, Err(EngineError::Sink(SinkError::Closed))));
        assert_eq!(words.words(), vec!["one "]);
        assert_eq!(completions.pool().available_permits(), 1);
    }

    #[tokio::test]
    async fn test_routes_to_endpoint_prefix() {
        let (completions, factory) = completions_with(1, vec![MockReply::text("x")]);
        let options = completions.options().with_endpoint("Cheap").with_max_output_tokens(12);

        completions
            .create_ai_response(&[ChatMessage::user("hi")], None, &options)
            .await
            .unwrap();

        assert_eq!(factory.endpoints_used()[0].1, "cheap-model");
        assert_eq!(factory.max_tokens_seen(), vec![12]);
    }

    #[tokio::test]
    async fn test_default_options() {
        let options = CompletionOptions::default();
        assert_eq!(options.max_output_tokens, 4000);
        assert_eq!(options.endpoint_prefix, "");
        assert!(options.timeout.is_none());
    }
}
