//! Ollama Backend Implementation
//!
//! Chat backend for Ollama (local model server).
//!
//! # Ollama API
//!
//! - `/api/chat` - Chat completions with message history (streaming NDJSON)
//! - `/api/tags` - List available models, used as a health probe
//!
//! Each streamed line carries `message.content` and a `done` flag; a line
//! with an `error` field aborts the stream.

use std::time::Duration;

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use tokio::sync::mpsc;

use super::traits::{BackendFactory, ChatBackend, StreamingToken};
use crate::messages::ChatMessage;

/// Ollama backend client bound to one model
#[derive(Clone)]
pub struct OllamaBackend {
    /// Base URL, e.g. `http://localhost:11434`
    base_url: String,
    /// Model identifier
    model: String,
    /// HTTP client
    http_client: reqwest::Client,
}

impl OllamaBackend {
    /// Create a new Ollama backend
    ///
    /// # Errors
    ///
    /// Fails if the HTTP client cannot be constructed.
    pub fn new(
        base_url: impl Into<String>,
        model: impl Into<String>,
        request_timeout: Duration,
    ) -> anyhow::Result<Self> {
        let http_client = reqwest::Client::builder().timeout(request_timeout).build()?;
        Ok(Self::with_client(base_url, model, http_client))
    }

    /// Create a backend sharing an existing HTTP client
    pub fn with_client(
        base_url: impl Into<String>,
        model: impl Into<String>,
        http_client: reqwest::Client,
    ) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            model: model.into(),
            http_client,
        }
    }

    /// Model this client requests
    #[must_use]
    pub fn model(&self) -> &str {
        &self.model
    }

    /// Get chat endpoint URL
    fn chat_url(&self) -> String {
        format!("{}/api/chat", self.base_url)
    }

    /// Get tags endpoint URL
    fn tags_url(&self) -> String {
        format!("{}/api/tags", self.base_url)
    }

    /// Build the JSON body of a chat request
    fn build_request(&self, history: &[ChatMessage], max_output_tokens: u32) -> serde_json::Value {
        let messages: Vec<serde_json::Value> = history
            .iter()
            .map(|m| {
                serde_json::json!({
                    "role": m.role.as_str(),
                    "content": m.text,
                })
            })
            .collect();

        let mut body = serde_json::json!({
            "model": self.model,
            "messages": messages,
            "stream": true,
        });
        if max_output_tokens > 0 {
            body["options"] = serde_json::json!({ "num_predict": max_output_tokens });
        }
        body
    }

    /// Check if the server answers its model listing
    pub async fn health_check(&self) -> bool {
        self.http_client
            .get(self.tags_url())
            .timeout(Duration::from_secs(5))
            .send()
            .await
            .is_ok_and(|response| response.status().is_success())
    }
}

/// One decoded NDJSON line
#[derive(Debug, PartialEq, Eq)]
enum ChatLine {
    /// Content chunk, possibly on the final line
    Chunk { content: String, done: bool },
    /// Server-side error
    Error(String),
    /// Unparseable or irrelevant line
    Skip,
}

fn parse_chat_line(line: &str) -> ChatLine {
    let Ok(data) = serde_json::from_str::<serde_json::Value>(line) else {
        return ChatLine::Skip;
    };

    if let Some(err) = data.get("error").and_then(|e| e.as_str()) {
        return ChatLine::Error(err.to_string());
    }

    let content = data
        .get("message")
        .and_then(|m| m.get("content"))
        .and_then(|c| c.as_str())
        .unwrap_or_default()
        .to_string();
    let done = data
        .get("done")
        .and_then(serde_json::Value::as_bool)
        .unwrap_or(false);

    ChatLine::Chunk { content, done }
}

/// Decode an NDJSON chat stream into tokens on `tx`
///
/// Bytes are buffered until a newline so a multibyte character split across
/// network chunks is decoded whole.
async fn forward_ndjson<S, B, E>(mut stream: S, tx: mpsc::Sender<StreamingToken>)
where
    S: Stream<Item = Result<B, E>> + Unpin,
    B: AsRef<[u8]>,
    E: std::fmt::Display,
{
    let mut buffer: Vec<u8> = Vec::new();
    let mut full_response = String::new();

    while let Some(chunk) = stream.next().await {
        match chunk {
            Ok(bytes) => buffer.extend_from_slice(bytes.as_ref()),
            Err(e) => {
                let _ = tx.send(StreamingToken::Error(e.to_string())).await;
                return;
            }
        }

        while let Some(pos) = buffer.iter().position(|&b| b == b'\n') {
            let raw: Vec<u8> = buffer.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&raw[..pos]);
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            match parse_chat_line(line) {
                ChatLine::Chunk { content, done } => {
                    if !content.is_empty() {
                        full_response.push_str(&content);
                        if tx.send(StreamingToken::Token(content)).await.is_err() {
                            // Receiver dropped, stop streaming
                            return;
                        }
                    }
                    if done {
                        let _ = tx
                            .send(StreamingToken::Complete {
                                message: full_response,
                            })
                            .await;
                        return;
                    }
                }
                ChatLine::Error(err) => {
                    let _ = tx.send(StreamingToken::Error(err)).await;
                    return;
                }
                ChatLine::Skip => {}
            }
        }
    }

    // Stream ended without done signal
    let _ = tx
        .send(StreamingToken::Complete {
            message: full_response,
        })
        .await;
}

#[async_trait]
impl ChatBackend for OllamaBackend {
    fn name(&self) -> &'static str {
        "Ollama"
    }

    async fn complete_streaming(
        &self,
        history: &[ChatMessage],
        max_output_tokens: u32,
    ) -> anyhow::Result<mpsc::Receiver<StreamingToken>> {
        let (tx, rx) = mpsc::channel(100);

        let response = self
            .http_client
            .post(self.chat_url())
            .json(&self.build_request(history, max_output_tokens))
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Ollama returned {status}: {body}");
        }

        tokio::spawn(forward_ndjson(response.bytes_stream(), tx));

        Ok(rx)
    }
}

/// Creates [`OllamaBackend`]s sharing one HTTP client
pub struct OllamaFactory {
    http_client: reqwest::Client,
}

impl OllamaFactory {
    /// Create a factory whose clients time out after `request_timeout`
    ///
    /// # Errors
    ///
    /// Fails if the HTTP client cannot be constructed.
    pub fn new(request_timeout: Duration) -> anyhow::Result<Self> {
        let http_client = reqwest::Client::builder().timeout(request_timeout).build()?;
        Ok(Self { http_client })
    }
}

impl BackendFactory for OllamaFactory {
    fn create(&self, endpoint: &str, model: &str) -> anyhow::Result<Box<dyn ChatBackend>> {
        Ok(Box::new(OllamaBackend::with_client(
            endpoint,
            model,
            self.http_client.clone(),
        )))
    }
}
