//! Chat Backend Integration
//!
//! Abstracted access to chat model servers through a common trait interface.
//!
//! # Available Backends
//!
//! - **Ollama**: Local model server via `/api/chat` (default)
//!
//! # Usage
//!
//! ```ignore
//! use palaver_core::backend::{BackendFactory, OllamaFactory};
//! use palaver_core::messages::ChatMessage;
//!
//! let factory = OllamaFactory::new(Duration::from_secs(300));
//! let backend = factory.create("http://localhost:11434", "llama3.1:8b")?;
//! let rx = backend.complete_streaming(&[ChatMessage::user("Hello!")], 4000).await?;
//! ```

mod ollama;
mod traits;

pub use ollama::{OllamaBackend, OllamaFactory};
pub use traits::{BackendFactory, ChatBackend, StreamingToken};
