//! URL Ingestion
//!
//! Turns a URL into conversation context: fetch, strip to body text,
//! collapse whitespace, crop through the cheap model, cap, and append to the
//! ledger as a non-responding user message.
//!
//! # Design
//!
//! Each conversation owns an [`IngestedUrlSet`]. A URL enters the set only
//! after its content reached the ledger, and never leaves it, so asking for
//! the same page twice costs nothing the second time. Failures are per URL;
//! the caller reports them and moves on to the next one.

use std::collections::HashSet;
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;

use crate::completion::Completions;
use crate::config::CHEAP_ENDPOINT_PREFIX;
use crate::error::EngineError;
use crate::ledger::Ledger;
use crate::messages::ChatMessage;
use crate::prompts::CROP_INSTRUCTIONS;

/// Most page characters handed to the crop completion
pub const CROP_INPUT_LIMIT: usize = 20_000;

/// Most characters stored per page
pub const STORED_CONTENT_LIMIT: usize = 5_000;

// ============================================================================
// Text helpers
// ============================================================================

static BODY_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<body[^>]*>(.*)</body>").expect("Invalid body regex"));

static NOISE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)<script[^>]*>.*?</script>|<style[^>]*>.*?</style>|<noscript[^>]*>.*?</noscript>|<!--.*?-->")
        .expect("Invalid noise regex")
});

static TAG_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<[^>]*>").expect("Invalid tag regex"));

static WHITESPACE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s+").expect("Invalid whitespace regex"));

/// Visible text of an HTML document's body
///
/// Falls back to the whole document when there is no `<body>`.
#[must_use]
pub fn html_body_text(html: &str) -> String {
    let body = BODY_RE
        .captures(html)
        .and_then(|c| c.get(1))
        .map_or(html, |m| m.as_str());
    let without_noise = NOISE_RE.replace_all(body, " ");
    let text = TAG_RE.replace_all(&without_noise, " ");
    decode_entities(&text)
}

static ENTITY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"&(?:#([xX]?)([0-9a-fA-F]{1,6})|([a-zA-Z]+));").expect("Invalid entity regex")
});

fn named_entity(name: &str) -> Option<&'static str> {
    Some(match name {
        "nbsp" | "ensp" | "emsp" | "thinsp" => " ",
        "lt" => "<",
        "gt" => ">",
        "quot" => "\"",
        "apos" => "'",
        "amp" => "&",
        "mdash" => "\u{2014}",
        "ndash" => "\u{2013}",
        "hellip" => "\u{2026}",
        "lsquo" => "\u{2018}",
        "rsquo" => "\u{2019}",
        "ldquo" => "\u{201C}",
        "rdquo" => "\u{201D}",
        "laquo" => "\u{AB}",
        "raquo" => "\u{BB}",
        "bull" => "\u{2022}",
        "middot" => "\u{B7}",
        "copy" => "\u{A9}",
        "reg" => "\u{AE}",
        "trade" => "\u{2122}",
        "deg" => "\u{B0}",
        "euro" => "\u{20AC}",
        "pound" => "\u{A3}",
        "times" => "\u{D7}",
        _ => return None,
    })
}

/// Decode character references in one pass, so `&amp;lt;` stays `&lt;`
///
/// Unknown names and invalid code points are left as written.
fn decode_entities(text: &str) -> String {
    ENTITY_RE
        .replace_all(text, |caps: &regex::Captures<'_>| {
            let decoded = match (caps.get(2), caps.get(3)) {
                (Some(digits), _) => {
                    let radix = if caps[1].is_empty() { 10 } else { 16 };
                    u32::from_str_radix(digits.as_str(), radix)
                        .ok()
                        .and_then(char::from_u32)
                        .map(String::from)
                }
                (None, Some(name)) => named_entity(name.as_str()).map(String::from),
                (None, None) => None,
            };
            decoded.unwrap_or_else(|| caps[0].to_string())
        })
        .into_owned()
}

/// Replace every whitespace run with one space and trim the ends
#[must_use]
pub fn collapse_whitespace(text: &str) -> String {
    WHITESPACE_RE.replace_all(text.trim(), " ").into_owned()
}

/// At most `max` characters of `text`
#[must_use]
pub fn truncate_chars(text: &str, max: usize) -> &str {
    text.char_indices()
        .nth(max)
        .map_or(text, |(end, _)| &text[..end])
}

/// Prepend `https://` when the URL has no scheme
#[must_use]
pub fn normalize_url(url: &str) -> String {
    let url = url.trim();
    if url.contains("://") {
        url.to_string()
    } else {
        format!("https://{url}")
    }
}

// ============================================================================
// Site readers
// ============================================================================

/// Fetches web pages
#[async_trait]
pub trait SiteReader: Send + Sync {
    /// Download the raw document at `url`
    async fn fetch(&self, url: &str) -> anyhow::Result<String>;

    /// Visible text of a downloaded document
    fn extract_body_text(&self, html: &str) -> String {
        html_body_text(html)
    }
}

/// [`SiteReader`] over HTTP
pub struct HttpSiteReader {
    http_client: reqwest::Client,
}

impl HttpSiteReader {
    /// Create a reader whose requests time out after `timeout`
    ///
    /// # Errors
    ///
    /// Fails if the HTTP client cannot be constructed.
    pub fn new(timeout: Duration) -> anyhow::Result<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("palaver/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { http_client })
    }
}

#[async_trait]
impl SiteReader for HttpSiteReader {
    async fn fetch(&self, url: &str) -> anyhow::Result<String> {
        let response = self.http_client.get(url).send().await?;
        let response = response.error_for_status()?;
        Ok(response.text().await?)
    }
}

// ============================================================================
// Ingestion
// ============================================================================

/// URLs whose content is already in the conversation
#[derive(Clone, Debug, Default)]
pub struct IngestedUrlSet {
    urls: HashSet<String>,
}

impl IngestedUrlSet {
    /// Empty set
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `url` (already normalized) was ingested
    #[must_use]
    pub fn contains(&self, url: &str) -> bool {
        self.urls.contains(url)
    }

    /// Record `url`; returns false if it was already present
    pub fn insert(&mut self, url: String) -> bool {
        self.urls.insert(url)
    }

    /// Number of ingested URLs
    #[must_use]
    pub fn len(&self) -> usize {
        self.urls.len()
    }

    /// Whether nothing was ingested yet
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.urls.is_empty()
    }
}

/// Result of one ingestion request
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum IngestOutcome {
    /// Content was appended to the ledger
    Ingested {
        /// Normalized URL
        url: String,
        /// Characters stored
        chars: usize,
    },
    /// The URL was ingested earlier; nothing happened
    AlreadyIngested {
        /// Normalized URL
        url: String,
    },
}

/// Fetch, crop and store pages
#[derive(Clone)]
pub struct Ingestor {
    reader: Arc<dyn SiteReader>,
    completions: Completions,
    fetch_timeout: Duration,
}

impl Ingestor {
    /// Create an ingestor
    pub fn new(reader: Arc<dyn SiteReader>, completions: Completions, fetch_timeout: Duration) -> Self {
        Self {
            reader,
            completions,
            fetch_timeout,
        }
    }

    /// Fetch `url` and return its collapsed body text
    async fn fetch_text(&self, url: &str) -> Result<String, EngineError> {
        let html = match tokio::time::timeout(self.fetch_timeout, self.reader.fetch(url)).await {
            Ok(Ok(html)) => html,
            Ok(Err(e)) => {
                return Err(EngineError::ExternalFetchFailure {
                    url: url.to_string(),
                    reason: format!("{e:#}"),
                })
            }
            Err(_) => {
                return Err(EngineError::Timeout {
                    what: format!("{url} to load"),
                    waited: self.fetch_timeout,
                })
            }
        };

        let text = collapse_whitespace(&self.reader.extract_body_text(&html));
        if text.is_empty() {
            return Err(EngineError::ExternalFetchFailure {
                url: url.to_string(),
                reason: "the page has no readable text".to_string(),
            });
        }
        Ok(text)
    }

    /// Ingest `url` into `ledger` unless it is already in `ingested`
    ///
    /// # Errors
    ///
    /// Fetch failures, timeouts, and crop completion failures. The URL is
    /// not recorded when an error is returned.
    pub async fn ingest(
        &self,
        url: &str,
        ingested: &mut IngestedUrlSet,
        ledger: &mut Ledger,
    ) -> Result<IngestOutcome, EngineError> {
        let url = normalize_url(url);
        if ingested.contains(&url) {
            tracing::debug!(%url, "Page already ingested");
            return Ok(IngestOutcome::AlreadyIngested { url });
        }

        let text = self.fetch_text(&url).await?;

        let prompt = [
            ChatMessage::system(CROP_INSTRUCTIONS),
            ChatMessage::user(truncate_chars(&text, CROP_INPUT_LIMIT)),
        ];
        let options = self.completions.options().with_endpoint(CHEAP_ENDPOINT_PREFIX);
        let cropped = self
            .completions
            .create_ai_response(&prompt, None, &options)
            .await?;
        let content = truncate_chars(cropped.text.trim(), STORED_CONTENT_LIMIT);
        let chars = content.chars().count();

        ledger.push(ChatMessage::user(format!("Content of {url}:\n{content}")));
        ingested.insert(url.clone());

        tracing::info!(%url, chars, "Ingested page");
        Ok(IngestOutcome::Ingested { url, chars })
    }

    /// Fetch `url` as-is and return at most [`STORED_CONTENT_LIMIT`] characters of body text
    ///
    /// # Errors
    ///
    /// Fetch failures and timeouts.
    pub async fn read_plain(&self, url: &str) -> Result<String, EngineError> {
        let text = self.fetch_text(url.trim()).await?;
        Ok(truncate_chars(&text, STORED_CONTENT_LIMIT).to_string())
    }
}
