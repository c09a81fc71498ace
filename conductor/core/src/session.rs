//! Session Management
//!
//! A [`ConversationHost`] owns the process-wide services and admits one
//! conversation at a time. Starting a second conversation while one is
//! running fails with [`EngineError::AlreadyActiveConversation`] and leaves
//! the running one untouched. The slot frees up when the conversation ends.

use std::sync::atomic::{AtomicBool, Ordering};

use tokio_util::sync::CancellationToken;

use crate::config::ClassifierStrategy;
use crate::engine::{ConversationEngine, Services};
use crate::error::EngineError;
use crate::messages::ConversationId;
use crate::prompts::Persona;
use crate::sink::Sink;

/// Admits conversations one at a time
pub struct ConversationHost {
    services: Services,
    strategy: ClassifierStrategy,
    active: AtomicBool,
}

impl ConversationHost {
    /// Create a host over shared services
    pub fn new(services: Services, strategy: ClassifierStrategy) -> Self {
        Self {
            services,
            strategy,
            active: AtomicBool::new(false),
        }
    }

    /// Whether a conversation currently holds the slot
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Claim the slot and create a conversation for `persona_name`
    ///
    /// Unknown persona names fall back to Generalbot.
    ///
    /// # Errors
    ///
    /// [`EngineError::AlreadyActiveConversation`] if the slot is taken.
    pub fn begin(&self, persona_name: &str) -> Result<ActiveConversation<'_>, EngineError> {
        if self
            .active
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            tracing::warn!(persona = persona_name, "Rejected conversation: another is active");
            return Err(EngineError::AlreadyActiveConversation);
        }

        let persona = Persona::from_name(persona_name);
        let engine = ConversationEngine::new(&self.services, persona, self.strategy);
        tracing::info!(id = %engine.id(), %persona, "Conversation admitted");

        Ok(ActiveConversation {
            engine,
            _slot: SlotGuard { flag: &self.active },
        })
    }
}

/// Releases the host slot on drop
struct SlotGuard<'a> {
    flag: &'a AtomicBool,
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

/// A conversation holding the host slot
pub struct ActiveConversation<'a> {
    engine: ConversationEngine,
    _slot: SlotGuard<'a>,
}

impl ActiveConversation<'_> {
    /// Conversation identifier
    #[must_use]
    pub fn id(&self) -> ConversationId {
        self.engine.id()
    }

    /// The underlying engine
    #[must_use]
    pub fn engine(&self) -> &ConversationEngine {
        &self.engine
    }

    /// Run to completion, then release the slot
    ///
    /// # Errors
    ///
    /// Sink failures other than cancellation.
    pub async fn run(mut self, sink: &dyn Sink, cancel: &CancellationToken) -> Result<(), EngineError> {
        self.engine.run(sink, cancel).await
    }
}
