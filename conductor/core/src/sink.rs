//! Streaming Sink
//!
//! The conversation's only connection to its front end. The engine writes
//! streamed text and prompts to the sink and blocks on [`Sink::read_line`]
//! for the next user input.
//!
//! # Design
//!
//! A sink is a capability object: writes are append-only, order is
//! preserved, and reads are cancellable. Cancellation observed during a read
//! surfaces as [`SinkError::Cancelled`] and the engine stops without writing
//! anything further.
//!
//! [`ChannelSink`] is the in-process variant for surfaces that are not a
//! terminal: output arrives as [`SinkEvent`]s and input is pushed through a
//! channel.

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::completion::WordCallback;

/// Sink failures
#[derive(Debug, Error)]
pub enum SinkError {
    /// Cancellation was requested while the sink was in use
    #[error("Sink operation cancelled")]
    Cancelled,

    /// The other side of the sink has gone away
    #[error("Sink is closed")]
    Closed,

    /// I/O failure on the underlying stream
    #[error("Sink I/O error: {0}")]
    Io(String),
}

impl From<std::io::Error> for SinkError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

/// Output surface and input source of a conversation
#[async_trait]
pub trait Sink: Send + Sync {
    /// Append text without a line break
    async fn write(&self, text: &str) -> Result<(), SinkError>;

    /// End the current line
    async fn write_line(&self) -> Result<(), SinkError>;

    /// Wait for the next line of user input
    ///
    /// Returns [`SinkError::Cancelled`] if `cancel` fires first.
    async fn read_line(&self, cancel: &CancellationToken) -> Result<String, SinkError>;
}

/// Adapts a sink into a per-chunk completion callback
///
/// Checks for cancellation before each write, so a cancelled conversation
/// stops streaming at the next chunk.
pub struct SinkWords<'a> {
    sink: &'a dyn Sink,
    cancel: &'a CancellationToken,
}

impl<'a> SinkWords<'a> {
    /// Wrap `sink`, observing `cancel`
    pub fn new(sink: &'a dyn Sink, cancel: &'a CancellationToken) -> Self {
        Self { sink, cancel }
    }
}

#[async_trait]
impl WordCallback for SinkWords<'_> {
    async fn on_word(&self, word: &str) -> Result<(), SinkError> {
        if self.cancel.is_cancelled() {
            return Err(SinkError::Cancelled);
        }
        self.sink.write(word).await
    }
}

// ============================================================================
// In-process channel sink
// ============================================================================

/// Output produced by a [`ChannelSink`]
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SinkEvent {
    /// Text appended to the current line
    Text(String),
    /// Line break
    EndLine,
}

/// Channel-backed sink for embedding the engine in another surface
pub struct ChannelSink {
    events: mpsc::Sender<SinkEvent>,
    input: Mutex<mpsc::Receiver<String>>,
}

impl ChannelSink {
    /// Create a sink together with its surface-side channel ends
    ///
    /// Returns:
    /// - `ChannelSink`: hand this to the engine
    /// - `mpsc::Receiver<SinkEvent>`: the surface renders these
    /// - `mpsc::Sender<String>`: the surface sends user lines here
    #[must_use]
    pub fn new_pair() -> (Self, mpsc::Receiver<SinkEvent>, mpsc::Sender<String>) {
        let (event_tx, event_rx) = mpsc::channel(256);
        let (input_tx, input_rx) = mpsc::channel(16);

        let sink = Self {
            events: event_tx,
            input: Mutex::new(input_rx),
        };

        (sink, event_rx, input_tx)
    }
}

#[async_trait]
impl Sink for ChannelSink {
    async fn write(&self, text: &str) -> Result<(), SinkError> {
        self.events
            .send(SinkEvent::Text(text.to_string()))
            .await
            .map_err(|_| SinkError::Closed)
    }

    async fn write_line(&self) -> Result<(), SinkError> {
        self.events
            .send(SinkEvent::EndLine)
            .await
            .map_err(|_| SinkError::Closed)
    }

    async fn read_line(&self, cancel: &CancellationToken) -> Result<String, SinkError> {
        let mut input = self.input.lock().await;
        tokio::select! {
            biased;
            () = cancel.cancelled() => Err(SinkError::Cancelled),
            line = input.recv() => line.ok_or(SinkError::Closed),
        }
    }
}
