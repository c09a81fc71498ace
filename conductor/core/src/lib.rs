//! Palaver Core - Conversation Orchestration Engine
//!
//! This crate runs text conversations against local language models. Every
//! user message is routed to a capability (plain chat, image generation, web
//! page ingestion, suggested replies) and the results are streamed to a
//! front end through a [`Sink`]. It has no terminal or UI dependencies.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                          Front End                               │
//! │        terminal (stdin/stdout)      │      ChannelSink           │
//! └───────────────────────┬──────────────────────────────────────────┘
//!                         │ write / write_line / read_line
//! ┌───────────────────────┼──────────────────────────────────────────┐
//! │                  PALAVER CORE                                    │
//! │  ┌────────────────────┴─────────────────────────────────────────┐│
//! │  │ ConversationHost ──> ConversationEngine (state machine)      ││
//! │  │                                                              ││
//! │  │  ┌────────────┐ ┌──────────┐ ┌───────────┐ ┌──────────────┐ ││
//! │  │  │ Classifier │ │  Intent  │ │ Ingestor  │ │ Suggestions  │ ││
//! │  │  │  (letter)  │ │  (JSON)  │ │  (pages)  │ │              │ ││
//! │  │  └─────┬──────┘ └────┬─────┘ └─────┬─────┘ └──────┬───────┘ ││
//! │  │        └─────────────┴──── Ledger ─┴──────────────┘         ││
//! │  │                              │                               ││
//! │  │                        Completions      ImageService         ││
//! │  │                              │               │               ││
//! │  │                      ConnectionPool    (single slot)         ││
//! │  └──────────────────────────────┼───────────────┼───────────────┘│
//! └─────────────────────────────────┼───────────────┼────────────────┘
//!                                   │               │
//!                                Ollama     Stable Diffusion
//! ```
//!
//! # Key Types
//!
//! - [`ConversationHost`]: admits one conversation at a time
//! - [`ConversationEngine`]: the per-conversation state machine
//! - [`Ledger`]: ordered conversation history
//! - [`Completions`]: streamed chat completions through the pool
//! - [`ConnectionPool`]: bounded, FIFO access to model backends
//! - [`Sink`]: the front-end capability
//!
//! # Module Overview
//!
//! - [`backend`]: chat backend traits and the Ollama client
//! - [`classifier`]: single-letter classification by majority vote
//! - [`completion`]: streamed completions with per-chunk callbacks
//! - [`config`]: TOML and environment configuration
//! - [`engine`]: conversation state machine
//! - [`error`]: engine error type
//! - [`image`]: image generation client and service
//! - [`ingestion`]: web page fetching, cropping and storage
//! - [`intent`]: structured JSON intent extraction
//! - [`keepalive`]: periodic model warm-up pings
//! - [`ledger`]: conversation history
//! - [`messages`]: chat messages and roles
//! - [`prompts`]: personas and instruction texts
//! - [`routing`]: connection pool
//! - [`session`]: single-conversation host
//! - [`sink`]: front-end capability and the channel sink
//! - [`suggestions`]: suggested replies

#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod backend;
pub mod classifier;
pub mod completion;
pub mod config;
pub mod engine;
pub mod error;
pub mod image;
pub mod ingestion;
pub mod intent;
pub mod keepalive;
pub mod ledger;
pub mod messages;
pub mod prompts;
pub mod routing;
pub mod session;
pub mod sink;
pub mod suggestions;

#[cfg(test)]
pub(crate) mod test_utils;

// Re-exports for convenience
pub use backend::{BackendFactory, ChatBackend, OllamaBackend, OllamaFactory, StreamingToken};
pub use classifier::{ChatIdentification, LetterClassifier};
pub use completion::{CompletionOptions, Completions, WordCallback};
pub use engine::{ConversationEngine, Services, TurnState};
pub use error::EngineError;
pub use image::{ImageBackend, ImageService, StableDiffusionClient};
pub use ingestion::{HttpSiteReader, IngestedUrlSet, Ingestor, SiteReader};
pub use intent::{IntentDecision, IntentExtractor, StructuredIntent};
pub use keepalive::spawn_keepalive;
pub use ledger::Ledger;
pub use messages::{ChatMessage, ConversationId, MessageRole};
pub use prompts::Persona;
pub use routing::{ConnectionPool, PoolError, PoolStats};
pub use session::{ActiveConversation, ConversationHost};
pub use sink::{ChannelSink, Sink, SinkError, SinkEvent, SinkWords};
pub use suggestions::SuggestionGenerator;

// Config exports
pub use config::{
    default_config_path, load_config, load_config_from_path, ClassifierStrategy, ConfigError,
    ConfigOverrides, ConfigSource, PalaverConfig,
};
