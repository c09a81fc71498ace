//! Engine Errors
//!
//! Typed failures surfaced by the conversation engine. Most of these are
//! recoverable at the turn level: the state machine writes them inline and
//! returns to waiting for input. Sink failures and cancellation end the
//! conversation.

use std::time::Duration;

use thiserror::Error;

use crate::routing::PoolError;
use crate::sink::SinkError;

/// Errors produced by engine operations
#[derive(Debug, Error)]
pub enum EngineError {
    /// A bounded wait elapsed (pool slot, image slot, or HTTP fetch)
    #[error("Timed out waiting for {what} after {waited:?}")]
    Timeout {
        /// What was being waited for
        what: String,
        /// How long the wait lasted
        waited: Duration,
    },

    /// The letter classifier produced no valid label within its attempt budget
    #[error("Could not classify the message after {attempts} attempts")]
    ClassificationFailure {
        /// Number of completions tried
        attempts: usize,
    },

    /// The intent summary contained no parseable JSON object
    #[error("Intent summary was not valid JSON: {0}")]
    MalformedIntentJson(String),

    /// A web page could not be fetched or was empty
    #[error("Could not load {url}: {reason}")]
    ExternalFetchFailure {
        /// URL that failed
        url: String,
        /// Failure description
        reason: String,
    },

    /// The image backend failed or returned no image
    #[error("Image generation failed: {0}")]
    ImageGenerationFailure(String),

    /// A conversation is already running on this host
    #[error("There is already an active conversation")]
    AlreadyActiveConversation,

    /// The chat backend reported an error
    #[error("Backend error: {0}")]
    Backend(String),

    /// The requested endpoint prefix is not configured
    #[error("No endpoint is configured for prefix {0:?}")]
    UnknownEndpoint(String),

    /// The pool was closed while waiting
    #[error("Connection pool is closed")]
    PoolClosed,

    /// Writing to or reading from the sink failed
    #[error(transparent)]
    Sink(#[from] SinkError),

    /// The conversation was cancelled
    #[error("Conversation cancelled")]
    Cancelled,
}

impl EngineError {
    /// Whether the error means the conversation must stop
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Sink(_) | Self::Cancelled)
    }

    /// Whether the error is a cancellation (directly or via the sink)
    #[must_use]
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled | Self::Sink(SinkError::Cancelled))
    }
}

impl From<PoolError> for EngineError {
    fn from(err: PoolError) -> Self {
        match err {
            PoolError::Timeout { waited } => Self::Timeout {
                what: "a turn to process the prompt".to_string(),
                waited,
            },
            PoolError::Closed => Self::PoolClosed,
            PoolError::UnknownEndpoint(prefix) => Self::UnknownEndpoint(prefix),
            PoolError::ConnectionFailed(reason) => Self::Backend(reason),
        }
    }
}
