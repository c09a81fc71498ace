//! Test Utilities
//!
//! Scripted stand-ins for the chat, image and web backends plus a sink that
//! replays canned user input. Replies are consumed in the order requests are
//! made, across every backend the factory hands out.
//!
//! ```ignore
//! let harness = services_with(vec![MockReply::text("Hello!")]);
//! let mut engine = ConversationEngine::new(&harness.services, Persona::Generalbot, strategy);
//! let sink = ScriptedSink::new(["hi"]);
//! engine.run(&sink, &CancellationToken::new()).await?;
//! assert_eq!(harness.factory.created(), 2);
//! ```

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::backend::{BackendFactory, ChatBackend, StreamingToken};
use crate::completion::{Completions, WordCallback};
use crate::config::{EndpointConfig, PoolConfig, CHEAP_ENDPOINT_PREFIX, DEFAULT_ENDPOINT_PREFIX};
use crate::engine::Services;
use crate::image::{GeneratedImage, ImageBackend, ImageService};
use crate::ingestion::{Ingestor, SiteReader};
use crate::messages::ChatMessage;
use crate::routing::ConnectionPool;
use crate::sink::{Sink, SinkError};

// ============================================================================
// Chat backend
// ============================================================================

/// One scripted completion
#[derive(Clone, Debug)]
pub enum MockReply {
    /// Stream this text, split after each space
    Text(String),
    /// Emit an error token
    Error(String),
    /// Fail before streaming starts
    Refuse(String),
}

impl MockReply {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text(text.into())
    }
}

#[derive(Default)]
struct MockState {
    replies: Mutex<VecDeque<MockReply>>,
    requests: Mutex<Vec<Vec<ChatMessage>>>,
    max_tokens: Mutex<Vec<u32>>,
    endpoints: Mutex<Vec<(String, String)>>,
    fail_next_create: Mutex<Option<String>>,
    created: AtomicUsize,
}

/// Factory whose backends share one reply queue and request log
#[derive(Default)]
pub struct MockBackendFactory {
    state: Arc<MockState>,
}

impl MockBackendFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_replies(replies: Vec<MockReply>) -> Self {
        let factory = Self::new();
        factory.state.replies.lock().unwrap().extend(replies);
        factory
    }

    /// Backends created so far
    pub fn created(&self) -> usize {
        self.state.created.load(Ordering::SeqCst)
    }

    /// `(base_url, model)` of each created backend, in order
    pub fn endpoints_used(&self) -> Vec<(String, String)> {
        self.state.endpoints.lock().unwrap().clone()
    }

    /// Histories passed to `complete_streaming`, in order
    pub fn requests(&self) -> Vec<Vec<ChatMessage>> {
        self.state.requests.lock().unwrap().clone()
    }

    pub fn max_tokens_seen(&self) -> Vec<u32> {
        self.state.max_tokens.lock().unwrap().clone()
    }

    /// Make the next `create` call fail
    pub fn fail_next_create(&self, reason: &str) {
        *self.state.fail_next_create.lock().unwrap() = Some(reason.to_string());
    }
}

impl BackendFactory for MockBackendFactory {
    fn create(&self, endpoint: &str, model: &str) -> anyhow::Result<Box<dyn ChatBackend>> {
        if let Some(reason) = self.state.fail_next_create.lock().unwrap().take() {
            anyhow::bail!(reason);
        }
        self.state.created.fetch_add(1, Ordering::SeqCst);
        self.state
            .endpoints
            .lock()
            .unwrap()
            .push((endpoint.to_string(), model.to_string()));
        Ok(Box::new(MockBackend {
            state: Arc::clone(&self.state),
        }))
    }
}

struct MockBackend {
    state: Arc<MockState>,
}

#[async_trait]
impl ChatBackend for MockBackend {
    fn name(&self) -> &str {
        "Mock"
    }

    async fn complete_streaming(
        &self,
        history: &[ChatMessage],
        max_output_tokens: u32,
    ) -> anyhow::Result<mpsc::Receiver<StreamingToken>> {
        self.state.requests.lock().unwrap().push(history.to_vec());
        self.state.max_tokens.lock().unwrap().push(max_output_tokens);

        let reply = self
            .state
            .replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| MockReply::text("OK"));

        let tokens: Vec<StreamingToken> = match reply {
            MockReply::Text(text) => text
                .split_inclusive(' ')
                .map(|chunk| StreamingToken::Token(chunk.to_string()))
                .chain(std::iter::once(StreamingToken::Complete { message: text.clone() }))
                .collect(),
            MockReply::Error(e) => vec![StreamingToken::Error(e)],
            MockReply::Refuse(e) => anyhow::bail!(e),
        };

        let (tx, rx) = mpsc::channel(tokens.len().max(1));
        for token in tokens {
            tx.try_send(token)?;
        }
        Ok(rx)
    }
}

/// Completions over a mock pool with `""` and `"Cheap"` endpoints
pub fn completions_with(
    max_concurrent: usize,
    replies: Vec<MockReply>,
) -> (Completions, Arc<MockBackendFactory>) {
    let factory = Arc::new(MockBackendFactory::with_replies(replies));
    let mut endpoints = HashMap::new();
    endpoints.insert(
        DEFAULT_ENDPOINT_PREFIX.to_string(),
        EndpointConfig::new("http://mock", "main-model"),
    );
    endpoints.insert(
        CHEAP_ENDPOINT_PREFIX.to_string(),
        EndpointConfig::new("http://mock", "cheap-model"),
    );
    let config = PoolConfig {
        max_concurrent,
        wait_timeout: Duration::from_secs(5),
    };
    let pool = ConnectionPool::new(endpoints, factory.clone(), &config);
    (Completions::new(Arc::new(pool)), factory)
}

/// Records streamed chunks, optionally failing after a number of them
#[derive(Default)]
pub struct RecordingWords {
    words: Mutex<Vec<String>>,
    fail_after: Option<usize>,
}

impl RecordingWords {
    pub fn failing_after(count: usize) -> Self {
        Self {
            words: Mutex::default(),
            fail_after: Some(count),
        }
    }

    pub fn words(&self) -> Vec<String> {
        self.words.lock().unwrap().clone()
    }
}

#[async_trait]
impl WordCallback for RecordingWords {
    async fn on_word(&self, word: &str) -> Result<(), SinkError> {
        let mut words = self.words.lock().unwrap();
        if self.fail_after.is_some_and(|limit| words.len() >= limit) {
            return Err(SinkError::Closed);
        }
        words.push(word.to_string());
        Ok(())
    }
}

// ============================================================================
// Web pages
// ============================================================================

/// Site reader serving canned pages by exact URL
#[derive(Default)]
pub struct MockSiteReader {
    pages: HashMap<String, Result<String, String>>,
    fetches: AtomicUsize,
}

impl MockSiteReader {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_page(mut self, url: &str, body: &str) -> Self {
        self.pages.insert(url.to_string(), Ok(body.to_string()));
        self
    }

    #[must_use]
    pub fn with_failure(mut self, url: &str, reason: &str) -> Self {
        self.pages.insert(url.to_string(), Err(reason.to_string()));
        self
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SiteReader for MockSiteReader {
    async fn fetch(&self, url: &str) -> anyhow::Result<String> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        match self.pages.get(url) {
            Some(Ok(body)) => Ok(body.clone()),
            Some(Err(reason)) => anyhow::bail!("{reason}"),
            None => anyhow::bail!("no page at {url}"),
        }
    }
}

// ============================================================================
// Images
// ============================================================================

enum ImageBehavior {
    Succeed,
    Fail(String),
    Block,
}

/// Image backend with a fixed outcome
pub struct MockImageBackend {
    behavior: ImageBehavior,
    prompts: Mutex<Vec<String>>,
}

impl MockImageBackend {
    fn with_behavior(behavior: ImageBehavior) -> Self {
        Self {
            behavior,
            prompts: Mutex::default(),
        }
    }

    /// Returns a tiny PNG
    pub fn succeeding() -> Self {
        Self::with_behavior(ImageBehavior::Succeed)
    }

    pub fn failing(reason: &str) -> Self {
        Self::with_behavior(ImageBehavior::Fail(reason.to_string()))
    }

    /// Records the prompt, then never completes
    pub fn blocking() -> Self {
        Self::with_behavior(ImageBehavior::Block)
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }
}

#[async_trait]
impl ImageBackend for MockImageBackend {
    async fn generate(&self, prompt: &str) -> anyhow::Result<GeneratedImage> {
        self.prompts.lock().unwrap().push(prompt.to_string());
        match &self.behavior {
            ImageBehavior::Succeed => Ok(GeneratedImage {
                base64: STANDARD.encode(b"\x89PNG\r\n\x1a\n"),
                mime_type: "image/png".to_string(),
            }),
            ImageBehavior::Fail(reason) => anyhow::bail!("{reason}"),
            ImageBehavior::Block => std::future::pending().await,
        }
    }
}

// ============================================================================
// Engine harness
// ============================================================================

/// Services wired to mocks, with handles for assertions
pub struct TestHarness {
    pub services: Services,
    pub factory: Arc<MockBackendFactory>,
    pub images: Arc<MockImageBackend>,
    pub site_reader: Arc<MockSiteReader>,
}

impl TestHarness {
    #[must_use]
    pub fn with_image_backend(mut self, backend: MockImageBackend) -> Self {
        self.images = Arc::new(backend);
        self.services.images = Arc::new(ImageService::new(
            self.images.clone(),
            Duration::from_secs(1),
        ));
        self
    }

    #[must_use]
    pub fn with_site_reader(mut self, reader: MockSiteReader) -> Self {
        self.site_reader = Arc::new(reader);
        self.services.ingestor = Ingestor::new(
            self.site_reader.clone(),
            self.services.completions.clone(),
            Duration::from_secs(1),
        );
        self
    }
}

/// Harness with one pool slot, a succeeding image backend and no pages
pub fn services_with(replies: Vec<MockReply>) -> TestHarness {
    let (completions, factory) = completions_with(1, replies);
    let images = Arc::new(MockImageBackend::succeeding());
    let site_reader = Arc::new(MockSiteReader::new());
    let services = Services {
        completions: completions.clone(),
        images: Arc::new(ImageService::new(images.clone(), Duration::from_secs(1))),
        ingestor: Ingestor::new(site_reader.clone(), completions, Duration::from_secs(1)),
    };
    TestHarness {
        services,
        factory,
        images,
        site_reader,
    }
}

// ============================================================================
// Sink
// ============================================================================

/// Sink that replays scripted input and records a transcript
///
/// When input runs out it cancels the conversation.
pub struct ScriptedSink {
    inputs: Mutex<VecDeque<String>>,
    transcript: Mutex<String>,
}

impl ScriptedSink {
    pub fn new<I, S>(inputs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            inputs: Mutex::new(inputs.into_iter().map(Into::into).collect()),
            transcript: Mutex::default(),
        }
    }

    /// Everything written so far; line ends appear as `\n`
    pub fn output(&self) -> String {
        self.transcript.lock().unwrap().clone()
    }
}

#[async_trait]
impl Sink for ScriptedSink {
    async fn write(&self, text: &str) -> Result<(), SinkError> {
        self.transcript.lock().unwrap().push_str(text);
        Ok(())
    }

    async fn write_line(&self) -> Result<(), SinkError> {
        self.transcript.lock().unwrap().push('\n');
        Ok(())
    }

    async fn read_line(&self, cancel: &CancellationToken) -> Result<String, SinkError> {
        if cancel.is_cancelled() {
            return Err(SinkError::Cancelled);
        }
        let next = self.inputs.lock().unwrap().pop_front();
        next.ok_or_else(|| {
            cancel.cancel();
            SinkError::Cancelled
        })
    }
}
