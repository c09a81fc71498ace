//! Conversation State Machine
//!
//! Drives one conversation from greeting to cancellation:
//!
//! ```text
//!                 +---------------+
//!       +-------> | AwaitingInput |
//!       |         +-------+-------+
//!       |                 | read_line
//!       |                 v
//!       |         +---------------+ <------------------------+
//!       |         |  Classifying  |                          |
//!       |         +-------+-------+                          |
//!       |                 |                                  |
//!       |   +-------------+-------------+-----------------+  |
//!       |   v             v             v                 v  |
//!       | General     ImageGen     SiteIngestion   SuggestedReply
//!       |  Reply                      Prompt        Selection-+
//!       |   |             |             |
//!       +---+-------------+-------------+
//! ```
//!
//! # Design
//!
//! The machine is an explicit [`TurnState`] value advanced by
//! [`ConversationEngine::step`]. Picking a suggested reply re-enters
//! `Classifying` with the substituted text instead of reading again.
//!
//! Errors raised inside a state are written to the sink and the machine goes
//! back to `AwaitingInput`. Only sink failures and cancellation end the
//! conversation. Cancellation is checked before every state dispatch and
//! before every write; once observed, nothing more is written.

use std::sync::Arc;

use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::classifier::{ChatIdentification, LetterClassifier};
use crate::completion::Completions;
use crate::config::ClassifierStrategy;
use crate::error::EngineError;
use crate::image::{image_error_markup, image_markup, ImageService};
use crate::ingestion::{IngestOutcome, IngestedUrlSet, Ingestor};
use crate::intent::{IntentDecision, IntentExtractor};
use crate::ledger::Ledger;
use crate::messages::{ChatMessage, ConversationId, PREFIX_ASSISTANT, PREFIX_REWRITE, PREFIX_USER};
use crate::prompts::{Persona, IMAGE_PROMPT_INSTRUCTIONS};
use crate::sink::{Sink, SinkWords};
use crate::suggestions::SuggestionGenerator;

/// Context turn recorded in place of an image
pub const IMAGE_PLACEHOLDER: &str = "Image generated.";

/// Context turn recorded when the user is asked for a URL
pub const SITE_PLACEHOLDER: &str = "Content loaded.";

/// Follow-up asked after a page was read on request
pub const SITE_FOLLOW_UP: &str = "What do you think about that?";

// ============================================================================
// Shared collaborators
// ============================================================================

/// Capabilities shared by every conversation in the process
#[derive(Clone)]
pub struct Services {
    /// Chat completions through the connection pool
    pub completions: Completions,
    /// Image generation
    pub images: Arc<ImageService>,
    /// Web page ingestion
    pub ingestor: Ingestor,
}

// ============================================================================
// Sink access with cancellation checkpoints
// ============================================================================

struct Surface<'a> {
    sink: &'a dyn Sink,
    cancel: &'a CancellationToken,
}

impl<'a> Surface<'a> {
    fn checkpoint(&self) -> Result<(), EngineError> {
        if self.cancel.is_cancelled() {
            Err(EngineError::Cancelled)
        } else {
            Ok(())
        }
    }

    async fn write(&self, text: &str) -> Result<(), EngineError> {
        self.checkpoint()?;
        self.sink.write(text).await?;
        Ok(())
    }

    async fn line(&self) -> Result<(), EngineError> {
        self.checkpoint()?;
        self.sink.write_line().await?;
        Ok(())
    }

    async fn read_line(&self) -> Result<String, EngineError> {
        self.checkpoint()?;
        Ok(self.sink.read_line(self.cancel).await?)
    }

    fn words(&self) -> SinkWords<'a> {
        SinkWords::new(self.sink, self.cancel)
    }
}

// ============================================================================
// State machine
// ============================================================================

/// Where the conversation is within a turn
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TurnState {
    /// Waiting for the user's next message
    AwaitingInput,
    /// Deciding what the message asks for
    Classifying {
        /// The user's message
        message: String,
    },
    /// Plain chat reply
    GeneralReply {
        /// The user's message
        message: String,
    },
    /// Image generation
    ImageGeneration {
        /// The user's message
        message: String,
        /// Description the keyword prompt is derived from
        seed: String,
        /// Also answer the message in text
        with_text: bool,
    },
    /// Ask for a URL and read it
    SiteIngestionPrompt {
        /// The user's message
        message: String,
    },
    /// Offer generated replies to pick from
    SuggestedReplySelection {
        /// The user's message
        message: String,
    },
}

impl TurnState {
    /// Short name for logs
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::AwaitingInput => "awaiting_input",
            Self::Classifying { .. } => "classifying",
            Self::GeneralReply { .. } => "general_reply",
            Self::ImageGeneration { .. } => "image_generation",
            Self::SiteIngestionPrompt { .. } => "site_ingestion_prompt",
            Self::SuggestedReplySelection { .. } => "suggested_reply_selection",
        }
    }
}

/// One conversation: its ledger, ingested pages and capabilities
pub struct ConversationEngine {
    id: ConversationId,
    persona: Persona,
    strategy: ClassifierStrategy,
    ledger: Ledger,
    ingested: IngestedUrlSet,
    classifier: LetterClassifier,
    intents: IntentExtractor,
    suggestions: SuggestionGenerator,
    ingestor: Ingestor,
    images: Arc<ImageService>,
}

impl ConversationEngine {
    /// Create a conversation for `persona` with an empty ledger
    pub fn new(services: &Services, persona: Persona, strategy: ClassifierStrategy) -> Self {
        let completions = services.completions.clone();
        Self {
            id: ConversationId::new(),
            persona,
            strategy,
            ledger: Ledger::new(completions.clone()),
            ingested: IngestedUrlSet::new(),
            classifier: LetterClassifier::new(completions.clone()),
            intents: IntentExtractor::new(completions.clone()),
            suggestions: SuggestionGenerator::new(completions, persona),
            ingestor: services.ingestor.clone(),
            images: Arc::clone(&services.images),
        }
    }

    /// Conversation identifier
    #[must_use]
    pub fn id(&self) -> ConversationId {
        self.id
    }

    /// Active persona
    #[must_use]
    pub fn persona(&self) -> Persona {
        self.persona
    }

    /// The conversation history
    #[must_use]
    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    /// Pages read so far
    #[must_use]
    pub fn ingested(&self) -> &IngestedUrlSet {
        &self.ingested
    }

    /// Run until `cancel` fires or the sink fails
    ///
    /// Cancellation is a normal end and returns `Ok`.
    ///
    /// # Errors
    ///
    /// Sink failures other than cancellation.
    pub async fn run(&mut self, sink: &dyn Sink, cancel: &CancellationToken) -> Result<(), EngineError> {
        let span = tracing::info_span!("conversation", id = %self.id, persona = %self.persona);
        let surface = Surface { sink, cancel };

        let result = async {
            tracing::info!(strategy = ?self.strategy, "Conversation started");
            let greeting = self.greet(&surface).await;
            self.recover(&surface, greeting).await?;
            match self.persona {
                Persona::Generalbot => self.run_states(&surface).await,
                Persona::Salesbot => self.run_sales(&surface).await,
            }
        }
        .instrument(span.clone())
        .await;

        let _entered = span.enter();
        match result {
            Err(e) if e.is_cancellation() => {
                tracing::info!(messages = self.ledger.len(), "Conversation cancelled");
                Ok(())
            }
            Err(e) => {
                tracing::warn!(error = %e, "Conversation ended by sink failure");
                Err(e)
            }
            Ok(()) => Ok(()),
        }
    }

    /// Report a non-fatal error inline; fatal errors pass through
    async fn recover(&self, surface: &Surface<'_>, result: Result<(), EngineError>) -> Result<(), EngineError> {
        match result {
            Ok(()) => Ok(()),
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                tracing::warn!(error = %e, "Turn failed");
                surface.line().await?;
                surface.write(&e.to_string()).await?;
                surface.line().await
            }
        }
    }

    async fn greet(&mut self, surface: &Surface<'_>) -> Result<(), EngineError> {
        surface.write(PREFIX_ASSISTANT).await?;
        self.ledger
            .send_message(ChatMessage::system(self.persona.instructions()), false, None, None)
            .await?;
        let words = surface.words();
        self.ledger
            .send_message(ChatMessage::user(self.persona.greeting()), true, Some(&words), None)
            .await?;
        surface.line().await
    }

    async fn run_states(&mut self, surface: &Surface<'_>) -> Result<(), EngineError> {
        let mut state = TurnState::AwaitingInput;
        loop {
            surface.checkpoint()?;
            tracing::debug!(state = state.name(), "Dispatching");
            state = match self.step(state, surface).await {
                Ok(next) => next,
                Err(e) => {
                    self.recover(surface, Err(e)).await?;
                    TurnState::AwaitingInput
                }
            };
        }
    }

    /// Execute `state` and return the next one
    async fn step(&mut self, state: TurnState, surface: &Surface<'_>) -> Result<TurnState, EngineError> {
        match state {
            TurnState::AwaitingInput => {
                let message = surface.read_line().await?;
                Ok(TurnState::Classifying { message })
            }
            TurnState::Classifying { message } => self.classify(message, surface).await,
            TurnState::GeneralReply { message } => {
                surface.write(PREFIX_ASSISTANT).await?;
                let words = surface.words();
                self.ledger
                    .send_message(ChatMessage::user(message), true, Some(&words), None)
                    .await?;
                surface.line().await?;
                Ok(TurnState::AwaitingInput)
            }
            TurnState::ImageGeneration {
                message,
                seed,
                with_text,
            } => {
                self.generate_image(message, &seed, with_text, surface).await?;
                Ok(TurnState::AwaitingInput)
            }
            TurnState::SiteIngestionPrompt { message } => {
                self.read_site(message, surface).await?;
                Ok(TurnState::AwaitingInput)
            }
            TurnState::SuggestedReplySelection { message } => {
                surface
                    .write("Select one of the possible responses (1-3), or enter a custom response.\n")
                    .await?;
                self.ledger
                    .send_message(ChatMessage::user(message), false, None, None)
                    .await?;
                let message = self.pick_suggestion(surface).await?;
                Ok(TurnState::Classifying { message })
            }
        }
    }

    async fn classify(&mut self, message: String, surface: &Surface<'_>) -> Result<TurnState, EngineError> {
        surface.write(PREFIX_USER).await?;
        surface.write(&message).await?;
        surface.line().await?;
        surface.checkpoint()?;

        match self.strategy {
            ClassifierStrategy::Letter => {
                let identification = self.classifier.identify(&message).await?;
                surface.write(&format!("Identification = {identification}")).await?;
                surface.line().await?;
                surface.checkpoint()?;

                Ok(match identification {
                    ChatIdentification::General => TurnState::GeneralReply { message },
                    ChatIdentification::CreateImage => TurnState::ImageGeneration {
                        seed: message.clone(),
                        message,
                        with_text: false,
                    },
                    ChatIdentification::ReadSite => TurnState::SiteIngestionPrompt { message },
                    ChatIdentification::SuggestQuestions => {
                        TurnState::SuggestedReplySelection { message }
                    }
                })
            }
            ClassifierStrategy::Structured => {
                surface.write(PREFIX_REWRITE).await?;
                let words = surface.words();
                let decision = self
                    .intents
                    .extract(self.ledger.history(), &message, Some(&words))
                    .await?;
                surface.line().await?;

                let (rewritten, intent) = match decision {
                    IntentDecision::Parsed { rewritten, intent } => (rewritten, intent),
                    IntentDecision::Fallback { .. } => {
                        return Ok(TurnState::GeneralReply { message });
                    }
                };

                for url in &intent.urls_from_user_chat_bot_should_read {
                    surface.checkpoint()?;
                    self.ingest_url(url, surface).await?;
                }

                if intent.user_wants_image_generated {
                    Ok(TurnState::ImageGeneration {
                        message,
                        seed: rewritten,
                        with_text: intent.include_text_response_in_addition_to_image,
                    })
                } else {
                    Ok(TurnState::GeneralReply { message })
                }
            }
        }
    }

    /// Ingest one URL, reporting the outcome inline
    async fn ingest_url(&mut self, url: &str, surface: &Surface<'_>) -> Result<(), EngineError> {
        match self.ingestor.ingest(url, &mut self.ingested, &mut self.ledger).await {
            Ok(IngestOutcome::Ingested { url, .. }) => {
                surface.write(&format!("Read {url}")).await?;
            }
            Ok(IngestOutcome::AlreadyIngested { url }) => {
                surface.write(&format!("Already read {url}")).await?;
            }
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => {
                tracing::warn!(url, error = %e, "Ingestion failed");
                surface.write(&e.to_string()).await?;
            }
        }
        surface.line().await
    }

    async fn generate_image(
        &mut self,
        message: String,
        seed: &str,
        with_text: bool,
        surface: &Surface<'_>,
    ) -> Result<(), EngineError> {
        if with_text {
            surface.write(PREFIX_ASSISTANT).await?;
            let words = surface.words();
            self.ledger
                .send_message(ChatMessage::user(message), true, Some(&words), None)
                .await?;
            surface.line().await?;
        } else {
            self.ledger
                .send_message(ChatMessage::user(message), false, None, None)
                .await?;
        }
        self.ledger
            .send_message(ChatMessage::assistant(IMAGE_PLACEHOLDER), false, None, None)
            .await?;

        let prompt = [
            ChatMessage::system(IMAGE_PROMPT_INSTRUCTIONS),
            ChatMessage::user(seed),
        ];
        let completions = self.ledger.completions();
        let image_prompt = completions
            .create_ai_response(&prompt, None, &completions.options())
            .await?
            .text
            .trim()
            .to_string();

        surface.write("Generating an image with the following prompt:\n\n").await?;
        surface.write(&format!("`{image_prompt}`")).await?;

        match self.images.create_image(&image_prompt).await {
            Ok(data_uri) => surface.write(&image_markup(&data_uri)).await?,
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => surface.write(&image_error_markup(&e)).await?,
        }
        surface.line().await
    }

    async fn read_site(&mut self, message: String, surface: &Surface<'_>) -> Result<(), EngineError> {
        surface
            .write("Provide a full URL with the protocol included. This source can be referenced going forward.\n\n")
            .await?;
        surface.write("Enter \"Cancel\" to exit.").await?;
        surface.line().await?;

        self.ledger
            .send_message(ChatMessage::user(message), false, None, None)
            .await?;
        self.ledger
            .send_message(ChatMessage::assistant(SITE_PLACEHOLDER), false, None, None)
            .await?;

        let url = surface.read_line().await?;
        surface.write(PREFIX_USER).await?;
        surface.write(&url).await?;
        surface.line().await?;

        if url.trim().eq_ignore_ascii_case("cancel") {
            return Ok(());
        }

        surface.write(PREFIX_ASSISTANT).await?;
        let outcome = async {
            let text = self.ingestor.read_plain(&url).await?;
            self.ledger.push(ChatMessage::user(format!("Site Content:\n{text}")));
            let words = surface.words();
            self.ledger
                .send_message(ChatMessage::user(SITE_FOLLOW_UP), true, Some(&words), None)
                .await
        }
        .await;

        match outcome {
            Ok(_) => {}
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => {
                surface
                    .write(&format!("I encountered an issue loading the site: \"{e}\""))
                    .await?;
            }
        }
        surface.line().await
    }

    /// List generated replies and read the user's pick
    async fn pick_suggestion(&self, surface: &Surface<'_>) -> Result<String, EngineError> {
        let mut candidates = Vec::new();
        let mut stream = self.suggestions.generate(self.ledger.history());
        while let Some(candidate) = stream.next().await {
            let candidate = candidate?;
            surface
                .write(&format!("  {}. {candidate}\n", candidates.len() + 1))
                .await?;
            candidates.push(candidate);
        }

        surface.write("\n").await?;
        surface.write("Your prompt (1-3, or text): ").await?;
        surface.line().await?;

        let input = surface.read_line().await?;
        Ok(select_candidate(&input, &candidates))
    }

    async fn run_sales(&mut self, surface: &Surface<'_>) -> Result<(), EngineError> {
        loop {
            surface.checkpoint()?;
            let turn = self.sales_turn(surface).await;
            self.recover(surface, turn).await?;
        }
    }

    async fn sales_turn(&mut self, surface: &Surface<'_>) -> Result<(), EngineError> {
        surface
            .write("Select one of the possible responses (1-3), or enter a custom response.\n")
            .await?;
        let message = self.pick_suggestion(surface).await?;

        surface.write(PREFIX_USER).await?;
        surface.write(&message).await?;
        surface.line().await?;

        surface.write(PREFIX_ASSISTANT).await?;
        let words = surface.words();
        self.ledger
            .send_message(ChatMessage::user(message), true, Some(&words), None)
            .await?;
        surface.line().await
    }
}

/// A number in range picks that candidate; anything else is taken verbatim
#[must_use]
pub fn select_candidate(input: &str, candidates: &[String]) -> String {
    input
        .trim()
        .parse::<usize>()
        .ok()
        .and_then(|n| n.checked_sub(1))
        .and_then(|i| candidates.get(i))
        .cloned()
        .unwrap_or_else(|| input.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::MessageRole;
    use crate::prompts::{CHAT_IDENTIFICATION_INSTRUCTIONS, GENERALBOT_BEGIN, GENERALBOT_INSTRUCTIONS};
    use crate::sink::{ChannelSink, SinkEvent};
    use crate::test_utils::{
        services_with, MockImageBackend, MockReply, MockSiteReader, ScriptedSink,
    };
    use pretty_assertions::assert_eq;

    fn letters(letter: &str) -> Vec<MockReply> {
        (0..5).map(|_| MockReply::text(letter)).collect()
    }

    #[test]
    fn test_select_candidate() {
        let candidates = vec!["a?".to_string(), "b?".to_string(), "c?".to_string()];
        assert_eq!(select_candidate("2", &candidates), "b?");
        assert_eq!(select_candidate(" 3 ", &candidates), "c?");
        assert_eq!(select_candidate("4", &candidates), "4");
        assert_eq!(select_candidate("0", &candidates), "0");
        assert_eq!(select_candidate("tell me more", &candidates), "tell me more");
    }

    #[tokio::test]
    async fn test_greeting_records_persona() {
        let harness = services_with(vec![MockReply::text("Hi, I am Generalbot.")]);
        let mut engine =
            ConversationEngine::new(&harness.services, Persona::Generalbot, ClassifierStrategy::Letter);
        let sink = ScriptedSink::new(Vec::<String>::new());

        engine.run(&sink, &CancellationToken::new()).await.unwrap();

        assert_eq!(
            engine.ledger().history(),
            &[
                ChatMessage::system(GENERALBOT_INSTRUCTIONS),
                ChatMessage::user(GENERALBOT_BEGIN),
                ChatMessage::assistant("Hi, I am Generalbot."),
            ]
        );
        assert_eq!(sink.output(), "Assistant: Hi, I am Generalbot.\n");
    }

    #[tokio::test]
    async fn test_general_reply_with_letter_classifier() {
        let mut replies = vec![MockReply::text("Hello!")];
        replies.extend(letters("G"));
        replies.push(MockReply::text("It is sunny."));
        let harness = services_with(replies);
        let mut engine =
            ConversationEngine::new(&harness.services, Persona::Generalbot, ClassifierStrategy::Letter);
        let sink = ScriptedSink::new(["What's the weather?"]);

        engine.run(&sink, &CancellationToken::new()).await.unwrap();

        let history = engine.ledger().history();
        assert_eq!(history.len(), 5);
        assert_eq!(history[3], ChatMessage::user("What's the weather?"));
        assert_eq!(history[4], ChatMessage::assistant("It is sunny."));
        assert_eq!(
            sink.output(),
            "Assistant: Hello!\n\
             You: What's the weather?\n\
             Identification = G\n\
             Assistant: It is sunny.\n"
        );
        // Five classification votes, each outside the ledger
        let requests = harness.factory.requests();
        assert_eq!(requests[1][0], ChatMessage::system(CHAT_IDENTIFICATION_INSTRUCTIONS));
        assert_eq!(requests.len(), 7);
    }

    #[tokio::test]
    async fn test_structured_image_generation() {
        let harness = services_with(vec![
            MockReply::text("Hello!"),
            MockReply::text("Draw a cat floating in space"),
            MockReply::text(
                r#"{"userWantsImageGenerated":true,"includeTextResponseInAdditionToImage":false,"userWantsSimpleChatResponse":false,"urlsFromUserChatBotShouldRead":[]}"#,
            ),
            MockReply::text("cat, space, stars"),
        ]);
        let mut engine = ConversationEngine::new(
            &harness.services,
            Persona::Generalbot,
            ClassifierStrategy::Structured,
        );
        let sink = ScriptedSink::new(["space cat please"]);

        engine.run(&sink, &CancellationToken::new()).await.unwrap();

        assert_eq!(harness.images.prompts(), vec!["cat, space, stars".to_string()]);
        let output = sink.output();
        assert!(output.contains("Interpreted: Draw a cat floating in space\n"));
        assert!(output.contains("`cat, space, stars`"));
        assert!(output.contains("<img src=\"data:image/png;base64,"));

        let history = engine.ledger().history();
        assert_eq!(history.len(), 5);
        assert_eq!(history[3], ChatMessage::user("space cat please"));
        assert_eq!(history[4], ChatMessage::assistant(IMAGE_PLACEHOLDER));
        // Keywords are derived from the rewritten text
        assert_eq!(
            harness.factory.requests()[3][1],
            ChatMessage::user("Draw a cat floating in space")
        );
    }

    #[tokio::test]
    async fn test_image_failure_is_reported_and_loop_continues() {
        let harness = services_with(vec![
            MockReply::text("Hello!"),
            MockReply::text("Draw a dog"),
            MockReply::text(r#"{"userWantsImageGenerated":true}"#),
            MockReply::text("dog"),
            MockReply::text("Say hello"),
            MockReply::text(r#"{"userWantsSimpleChatResponse":true}"#),
            MockReply::text("Hi there!"),
        ])
        .with_image_backend(MockImageBackend::failing("GPU on fire"));
        let mut engine = ConversationEngine::new(
            &harness.services,
            Persona::Generalbot,
            ClassifierStrategy::Structured,
        );
        let sink = ScriptedSink::new(["draw a dog", "hello"]);

        engine.run(&sink, &CancellationToken::new()).await.unwrap();

        let output = sink.output();
        assert!(output.contains("GPU on fire"));
        assert!(output.contains("Refer to the error above."));
        assert!(output.ends_with("Assistant: Hi there!\n"));
    }

    #[tokio::test]
    async fn test_structured_ingests_urls_before_reply() {
        let harness = services_with(vec![
            MockReply::text("Hello!"),
            MockReply::text("Summarize a.test and b.test"),
            MockReply::text(r#"{"urlsFromUserChatBotShouldRead":["a.test","b.test"]}"#),
            MockReply::text("Alpha content"),
            MockReply::text("Both pages are about letters."),
        ])
        .with_site_reader(
            MockSiteReader::new()
                .with_page("https://a.test", "<body>Alpha content</body>")
                .with_failure("https://b.test", "connection refused"),
        );
        let mut engine = ConversationEngine::new(
            &harness.services,
            Persona::Generalbot,
            ClassifierStrategy::Structured,
        );
        let sink = ScriptedSink::new(["summarize a.test and b.test"]);

        engine.run(&sink, &CancellationToken::new()).await.unwrap();

        let output = sink.output();
        assert!(output.contains("Read https://a.test\n"));
        assert!(output.contains("Could not load https://b.test: connection refused\n"));
        assert!(output.ends_with("Assistant: Both pages are about letters.\n"));

        let history = engine.ledger().history();
        assert_eq!(history[3], ChatMessage::user("Content of https://a.test:\nAlpha content"));
        assert_eq!(history[4], ChatMessage::user("summarize a.test and b.test"));
        assert_eq!(engine.ingested().len(), 1);
    }

    #[tokio::test]
    async fn test_fallback_replies_to_original_message() {
        let harness = services_with(vec![
            MockReply::text("Hello!"),
            MockReply::text("Greet the assistant"),
            MockReply::text("The user says hi"),
            MockReply::text("Hi yourself."),
        ]);
        let mut engine = ConversationEngine::new(
            &harness.services,
            Persona::Generalbot,
            ClassifierStrategy::Structured,
        );
        let sink = ScriptedSink::new(["hey"]);

        engine.run(&sink, &CancellationToken::new()).await.unwrap();

        let history = engine.ledger().history();
        assert_eq!(history[3], ChatMessage::user("hey"));
        assert_eq!(history[4], ChatMessage::assistant("Hi yourself."));
    }

    #[tokio::test]
    async fn test_suggested_reply_reenters_classification() {
        let mut replies = vec![MockReply::text("Hello!")];
        replies.extend(letters("Q"));
        replies.extend([
            MockReply::text("What can you draw?"),
            MockReply::text("Can you read websites?"),
            MockReply::text("Tell me a joke?"),
        ]);
        replies.extend(letters("G"));
        replies.push(MockReply::text("Yes, paste a link."));
        let harness = services_with(replies);
        let mut engine =
            ConversationEngine::new(&harness.services, Persona::Generalbot, ClassifierStrategy::Letter);
        let sink = ScriptedSink::new(["give me ideas", "2"]);

        engine.run(&sink, &CancellationToken::new()).await.unwrap();

        let output = sink.output();
        assert!(output.contains("  1. What can you draw?\n  2. Can you read websites?\n  3. Tell me a joke?\n"));
        assert!(output.contains("You: Can you read websites?\n"));
        assert!(!output.contains("You: 2\n"));

        // Second classification ran on the substituted text
        let requests = harness.factory.requests();
        assert_eq!(requests[9][1], ChatMessage::user("Can you read websites?"));

        let history = engine.ledger().history();
        let tail: Vec<_> = history[3..].iter().map(|m| (m.role, m.text.as_str())).collect();
        assert_eq!(
            tail,
            vec![
                (MessageRole::User, "give me ideas"),
                (MessageRole::User, "Can you read websites?"),
                (MessageRole::Assistant, "Yes, paste a link."),
            ]
        );
    }

    #[tokio::test]
    async fn test_site_prompt_reads_page() {
        let mut replies = vec![MockReply::text("Hello!")];
        replies.extend(letters("S"));
        replies.push(MockReply::text("Interesting read."));
        let harness = services_with(replies).with_site_reader(
            MockSiteReader::new().with_page("http://news.test", "<body><p>Big  news</p></body>"),
        );
        let mut engine =
            ConversationEngine::new(&harness.services, Persona::Generalbot, ClassifierStrategy::Letter);
        let sink = ScriptedSink::new(["read a page", "http://news.test"]);

        engine.run(&sink, &CancellationToken::new()).await.unwrap();

        let output = sink.output();
        assert!(output.contains("Enter \"Cancel\" to exit.\n"));
        assert!(output.contains("You: http://news.test\nAssistant: Interesting read.\n"));

        let texts: Vec<_> = engine.ledger().history()[3..]
            .iter()
            .map(|m| m.text.as_str())
            .collect();
        assert_eq!(
            texts,
            vec![
                "read a page",
                SITE_PLACEHOLDER,
                "Site Content:\nBig news",
                SITE_FOLLOW_UP,
                "Interesting read.",
            ]
        );
    }

    #[tokio::test]
    async fn test_site_prompt_cancel_skips_fetch() {
        let mut replies = vec![MockReply::text("Hello!")];
        replies.extend(letters("S"));
        let harness = services_with(replies);
        let mut engine =
            ConversationEngine::new(&harness.services, Persona::Generalbot, ClassifierStrategy::Letter);
        let sink = ScriptedSink::new(["read a page", "  CANCEL "]);

        engine.run(&sink, &CancellationToken::new()).await.unwrap();

        assert_eq!(harness.site_reader.fetch_count(), 0);
        assert_eq!(engine.ledger().len(), 5);
    }

    #[tokio::test]
    async fn test_site_prompt_failure_is_inline() {
        let mut replies = vec![MockReply::text("Hello!")];
        replies.extend(letters("S"));
        let harness = services_with(replies)
            .with_site_reader(MockSiteReader::new().with_failure("http://x.test", "404 Not Found"));
        let mut engine =
            ConversationEngine::new(&harness.services, Persona::Generalbot, ClassifierStrategy::Letter);
        let sink = ScriptedSink::new(["read", "http://x.test"]);

        engine.run(&sink, &CancellationToken::new()).await.unwrap();

        assert!(sink
            .output()
            .contains("Assistant: I encountered an issue loading the site: \"Could not load http://x.test: 404 Not Found\"\n"));
    }

    #[tokio::test]
    async fn test_salesbot_turn() {
        let harness = services_with(vec![
            MockReply::text("Welcome, I am Salesbot."),
            MockReply::text("What does it cost?"),
            MockReply::text("Is it durable?"),
            MockReply::text("Can I try it?"),
            MockReply::text("It is very durable."),
        ]);
        let mut engine =
            ConversationEngine::new(&harness.services, Persona::Salesbot, ClassifierStrategy::Letter);
        let sink = ScriptedSink::new(["2"]);

        engine.run(&sink, &CancellationToken::new()).await.unwrap();

        assert!(sink
            .output()
            .contains("You: Is it durable?\nAssistant: It is very durable.\n"));
        let history = engine.ledger().history();
        assert_eq!(history[3], ChatMessage::user("Is it durable?"));
        assert_eq!(history[4], ChatMessage::assistant("It is very durable."));
    }

    #[tokio::test]
    async fn test_backend_failure_is_reported_inline() {
        let mut replies = vec![MockReply::text("Hello!")];
        replies.extend(letters("G"));
        replies.push(MockReply::Error("model unloaded".into()));
        let harness = services_with(replies);
        let mut engine =
            ConversationEngine::new(&harness.services, Persona::Generalbot, ClassifierStrategy::Letter);
        let sink = ScriptedSink::new(["hi"]);

        engine.run(&sink, &CancellationToken::new()).await.unwrap();

        assert!(sink.output().ends_with("Assistant: \nBackend error: model unloaded\n"));
    }

    #[tokio::test]
    async fn test_cancel_while_reading_stops_writes() {
        let harness = services_with(vec![MockReply::text("Hello!")]);
        let mut engine =
            ConversationEngine::new(&harness.services, Persona::Generalbot, ClassifierStrategy::Letter);
        let (sink, mut events, _input) = ChannelSink::new_pair();
        let cancel = CancellationToken::new();

        let task_cancel = cancel.clone();
        let handle = tokio::spawn(async move { engine.run(&sink, &task_cancel).await });

        loop {
            if events.recv().await == Some(SinkEvent::EndLine) {
                break;
            }
        }
        cancel.cancel();

        handle.await.unwrap().unwrap();
        assert!(events.recv().await.is_none());
        assert_eq!(harness.factory.created(), 1);
    }

    #[tokio::test]
    async fn test_cancelled_before_start_writes_nothing() {
        let harness = services_with(vec![]);
        let mut engine =
            ConversationEngine::new(&harness.services, Persona::Generalbot, ClassifierStrategy::Letter);
        let sink = ScriptedSink::new(Vec::<String>::new());
        let cancel = CancellationToken::new();
        cancel.cancel();

        engine.run(&sink, &cancel).await.unwrap();

        assert_eq!(sink.output(), "");
        assert!(engine.ledger().is_empty());
    }
}
