//! Suggested Replies
//!
//! Generates candidate next messages from the other side's point of view.
//! Candidates are produced one after another, each request listing the
//! earlier ones so the model avoids repeating itself. They are never
//! written to the ledger.

use futures::stream::{self, BoxStream, StreamExt};

use crate::completion::Completions;
use crate::error::EngineError;
use crate::messages::{ChatMessage, MessageRole};
use crate::prompts::{customer_begin, Persona};

/// Candidates produced per request
pub const SUGGESTION_COUNT: usize = 3;

/// Produces suggested replies for a persona
#[derive(Clone)]
pub struct SuggestionGenerator {
    completions: Completions,
    persona: Persona,
    count: usize,
}

struct SuggestionState {
    completions: Completions,
    context: Vec<ChatMessage>,
    already_used: Vec<String>,
    remaining: usize,
}

impl SuggestionGenerator {
    /// Create for `persona`
    pub fn new(completions: Completions, persona: Persona) -> Self {
        Self {
            completions,
            persona,
            count: SUGGESTION_COUNT,
        }
    }

    /// Lazily generate candidates from a snapshot of `history`
    ///
    /// Only user and assistant messages are shown to the model. Each item
    /// runs one completion when polled. The stream ends after the configured
    /// count, or right after the first error.
    pub fn generate(&self, history: &[ChatMessage]) -> BoxStream<'static, Result<String, EngineError>> {
        let mut context = Vec::with_capacity(history.len() + 1);
        context.push(ChatMessage::system(self.persona.customer_instructions()));
        context.extend(
            history
                .iter()
                .filter(|m| matches!(m.role, MessageRole::User | MessageRole::Assistant))
                .cloned(),
        );

        let state = SuggestionState {
            completions: self.completions.clone(),
            context,
            already_used: Vec::with_capacity(self.count),
            remaining: self.count,
        };

        stream::unfold(Some(state), |state| async move {
            let mut state = state?;
            if state.remaining == 0 {
                return None;
            }
            state.remaining -= 1;

            let mut prompt = state.context.clone();
            prompt.push(ChatMessage::user(customer_begin(&state.already_used)));

            let options = state.completions.options();
            match state.completions.create_ai_response(&prompt, None, &options).await {
                Ok(reply) => {
                    let candidate = reply.text.trim().to_string();
                    state.already_used.push(candidate.clone());
                    Some((Ok(candidate), Some(state)))
                }
                Err(e) => Some((Err(e), None)),
            }
        })
        .boxed()
    }
}
