//! Structured Intent Extraction
//!
//! Two completions per user turn:
//!
//! 1. **Rewrite** the latest message, with the conversation as context, into
//!    a standalone instruction. The rewrite is streamed to the caller and
//!    doubles as visible feedback.
//! 2. **Summarize** the rewrite into a JSON object and parse it into a
//!    [`StructuredIntent`].
//!
//! Models wrap JSON in prose or code fences, so parsing takes the span from
//! the first `{` to the last `}`. When that fails the turn degrades to a
//! plain chat reply ([`IntentDecision::Fallback`]); it is never an error.

use serde::{Deserialize, Deserializer, Serialize};

use crate::completion::{Completions, WordCallback};
use crate::error::EngineError;
use crate::messages::ChatMessage;
use crate::prompts::{INTENT_SUMMARY_INSTRUCTIONS, REWRITE_INSTRUCTIONS};

/// What the user asked for in one turn
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StructuredIntent {
    /// Generate an image
    pub user_wants_image_generated: bool,
    /// Also answer in text when generating an image
    pub include_text_response_in_addition_to_image: bool,
    /// Plain chat reply
    pub user_wants_simple_chat_response: bool,
    /// Pages to read before answering, in order
    #[serde(deserialize_with = "null_as_empty")]
    pub urls_from_user_chat_bot_should_read: Vec<String>,
}

fn null_as_empty<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<Vec<String>>::deserialize(deserializer)?.unwrap_or_default())
}

/// Result of intent extraction
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum IntentDecision {
    /// The summary parsed
    Parsed {
        /// Standalone restatement of the user's message
        rewritten: String,
        /// Parsed intent
        intent: StructuredIntent,
    },
    /// No usable JSON; reply as ordinary chat
    Fallback {
        /// Standalone restatement of the user's message
        rewritten: String,
        /// Why parsing failed
        reason: String,
    },
}

/// Substring from the first `{` to the last `}` inclusive
#[must_use]
pub fn extract_json_fragment(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    (end > start).then(|| &text[start..=end])
}

/// Parse a free-form summary reply into an intent
///
/// # Errors
///
/// [`EngineError::MalformedIntentJson`] when no object is found or it does
/// not deserialize.
pub fn parse_intent(reply: &str) -> Result<StructuredIntent, EngineError> {
    let fragment = extract_json_fragment(reply)
        .ok_or_else(|| EngineError::MalformedIntentJson("no JSON object in reply".to_string()))?;
    serde_json::from_str(fragment).map_err(|e| EngineError::MalformedIntentJson(e.to_string()))
}

/// Runs the rewrite and summary completions
#[derive(Clone)]
pub struct IntentExtractor {
    completions: Completions,
}

impl IntentExtractor {
    /// Create over `completions`
    pub fn new(completions: Completions) -> Self {
        Self { completions }
    }

    /// Restate `message` as a standalone instruction, streaming to `word_callback`
    ///
    /// # Errors
    ///
    /// Completion failures.
    pub async fn rewrite(
        &self,
        history: &[ChatMessage],
        message: &str,
        word_callback: Option<&dyn WordCallback>,
    ) -> Result<String, EngineError> {
        let mut prompt = Vec::with_capacity(history.len() + 2);
        prompt.extend_from_slice(history);
        prompt.push(ChatMessage::system(REWRITE_INSTRUCTIONS));
        prompt.push(ChatMessage::user(message));

        let reply = self
            .completions
            .create_ai_response(&prompt, word_callback, &self.completions.options())
            .await?;
        Ok(reply.text.trim().to_string())
    }

    /// Summarize a rewritten instruction into an intent
    ///
    /// # Errors
    ///
    /// Completion failures, or [`EngineError::MalformedIntentJson`].
    pub async fn summarize(&self, rewritten: &str) -> Result<StructuredIntent, EngineError> {
        let prompt = [
            ChatMessage::system(INTENT_SUMMARY_INSTRUCTIONS),
            ChatMessage::user(rewritten),
        ];
        let reply = self
            .completions
            .create_ai_response(&prompt, None, &self.completions.options())
            .await?;
        parse_intent(&reply.text)
    }

    /// Rewrite then summarize; malformed summaries become a fallback
    ///
    /// # Errors
    ///
    /// Completion failures of either step.
    pub async fn extract(
        &self,
        history: &[ChatMessage],
        message: &str,
        word_callback: Option<&dyn WordCallback>,
    ) -> Result<IntentDecision, EngineError> {
        let rewritten = self.rewrite(history, message, word_callback).await?;

        match self.summarize(&rewritten).await {
            Ok(intent) => {
                tracing::debug!(?intent, "Extracted structured intent");
                Ok(IntentDecision::Parsed { rewritten, intent })
            }
            Err(EngineError::MalformedIntentJson(reason)) => {
                tracing::info!(%reason, "Intent summary unusable, falling back to chat");
                Ok(IntentDecision::Fallback { rewritten, reason })
            }
            Err(e) => Err(e),
        }
    }
}
