//! Model Keepalive
//!
//! Ollama unloads idle models after a few minutes. A background task sends a
//! one-token prompt on a fixed interval so the first real turn does not pay
//! the load time. Pings go through the pool like any other completion.

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::completion::Completions;
use crate::messages::ChatMessage;
use crate::prompts::KEEPALIVE_PROMPT;

/// Ping the default model every `interval` until `cancel` fires
///
/// The first ping happens one interval after spawning. Failures are logged
/// and the loop keeps going.
pub fn spawn_keepalive(
    completions: Completions,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let prompt = [ChatMessage::user(KEEPALIVE_PROMPT)];
        let options = completions.options().with_max_output_tokens(1);

        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    tracing::debug!("Keepalive stopped");
                    break;
                }
                _ = ticker.tick() => {
                    match completions.create_ai_response(&prompt, None, &options).await {
                        Ok(_) => tracing::trace!("Keepalive ping sent"),
                        Err(e) => tracing::warn!(error = %e, "Keepalive ping failed"),
                    }
                }
            }
        }
    })
}
