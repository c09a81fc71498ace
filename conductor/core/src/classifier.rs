//! Single-Letter Intent Classifier
//!
//! Asks the model for one of four category letters, retrying when the reply
//! is not a recognized letter, and takes a majority vote over several
//! independent samples.
//!
//! # Design
//!
//! Sampling noise is handled in two layers. A single sample reparses up to
//! `max_reparses` times before giving up with
//! [`EngineError::ClassificationFailure`]. The vote then runs `votes`
//! samples, discards the failed ones, and picks the most frequent label
//! (first seen wins ties). If every sample failed the result is
//! [`ChatIdentification::General`].

use crate::completion::Completions;
use crate::error::EngineError;
use crate::messages::ChatMessage;
use crate::prompts::CHAT_IDENTIFICATION_INSTRUCTIONS;

/// Default number of votes per classification
pub const DEFAULT_VOTES: usize = 5;

/// Default retries after the first unparseable reply
pub const DEFAULT_MAX_REPARSES: usize = 3;

/// Category of a user message
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ChatIdentification {
    /// Ordinary chat
    General,
    /// Generate an image
    CreateImage,
    /// Read a web page
    ReadSite,
    /// Suggest what to say next
    SuggestQuestions,
}

impl ChatIdentification {
    /// Category letter
    #[must_use]
    pub fn letter(self) -> char {
        match self {
            Self::General => 'G',
            Self::CreateImage => 'I',
            Self::ReadSite => 'S',
            Self::SuggestQuestions => 'Q',
        }
    }

    /// Parse a category letter
    #[must_use]
    pub fn from_letter(letter: &str) -> Option<Self> {
        match letter {
            "G" => Some(Self::General),
            "I" => Some(Self::CreateImage),
            "S" => Some(Self::ReadSite),
            "Q" => Some(Self::SuggestQuestions),
            _ => None,
        }
    }
}

impl std::fmt::Display for ChatIdentification {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.letter())
    }
}

/// Interpret a raw model reply: first line of the trimmed text, trimmed
#[must_use]
pub fn parse_identification(reply: &str) -> Option<ChatIdentification> {
    let first_line = reply.trim().lines().next().unwrap_or_default().trim();
    ChatIdentification::from_letter(first_line)
}

/// Most frequent label; ties go to the label seen first, no votes means General
#[must_use]
pub fn majority_vote(votes: &[ChatIdentification]) -> ChatIdentification {
    let mut tally: Vec<(ChatIdentification, usize)> = Vec::new();
    for vote in votes {
        match tally.iter_mut().find(|(label, _)| label == vote) {
            Some((_, count)) => *count += 1,
            None => tally.push((*vote, 1)),
        }
    }

    let mut best: Option<(ChatIdentification, usize)> = None;
    for (label, count) in tally {
        if best.map_or(true, |(_, top)| count > top) {
            best = Some((label, count));
        }
    }
    best.map_or(ChatIdentification::General, |(label, _)| label)
}

/// Majority-vote classifier over single-letter replies
#[derive(Clone)]
pub struct LetterClassifier {
    completions: Completions,
    votes: usize,
    max_reparses: usize,
}

impl LetterClassifier {
    /// Create with the default vote and retry counts
    pub fn new(completions: Completions) -> Self {
        Self {
            completions,
            votes: DEFAULT_VOTES,
            max_reparses: DEFAULT_MAX_REPARSES,
        }
    }

    /// Set the number of votes
    #[must_use]
    pub fn with_votes(mut self, votes: usize) -> Self {
        self.votes = votes;
        self
    }

    /// Set the number of retries per sample
    #[must_use]
    pub fn with_max_reparses(mut self, max_reparses: usize) -> Self {
        self.max_reparses = max_reparses;
        self
    }

    /// Classify `message` by majority vote
    ///
    /// Failed samples are discarded. Only fatal sink or cancellation errors
    /// propagate.
    ///
    /// # Errors
    ///
    /// [`EngineError::Cancelled`] or a sink error raised while sampling.
    pub async fn identify(&self, message: &str) -> Result<ChatIdentification, EngineError> {
        let mut samples = Vec::with_capacity(self.votes);
        for vote in 0..self.votes {
            match self.identify_once(message).await {
                Ok(label) => samples.push(label),
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    tracing::debug!(vote, error = %e, "Discarding failed classification vote");
                }
            }
        }

        let result = majority_vote(&samples);
        tracing::debug!(?samples, %result, "Classified message");
        Ok(result)
    }

    /// Draw one sample, reparsing up to `max_reparses` times
    ///
    /// # Errors
    ///
    /// [`EngineError::ClassificationFailure`] when no attempt yields a valid
    /// letter, or the completion error of the last attempt.
    pub async fn identify_once(&self, message: &str) -> Result<ChatIdentification, EngineError> {
        let prompt = [
            ChatMessage::system(CHAT_IDENTIFICATION_INSTRUCTIONS),
            ChatMessage::user(message),
        ];
        let options = self.completions.options();
        let attempts = self.max_reparses + 1;

        for attempt in 1..=attempts {
            let reply = self
                .completions
                .create_ai_response(&prompt, None, &options)
                .await?;
            if let Some(label) = parse_identification(&reply.text) {
                return Ok(label);
            }
            tracing::trace!(attempt, reply = %reply.text, "Unrecognized classification reply");
        }

        Err(EngineError::ClassificationFailure { attempts })
    }
}
