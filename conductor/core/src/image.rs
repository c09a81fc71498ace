//! Image Generation
//!
//! Stable Diffusion web UI client plus a single-slot service in front of it.
//! The image server handles one job at a time, so the service owns its own
//! one-permit lock, separate from the chat connection pool, with its own
//! wait timeout.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;

use crate::config::ImageConfig;
use crate::error::EngineError;

/// A generated image as returned by the backend
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GeneratedImage {
    /// Base64 payload
    pub base64: String,
    /// MIME type of the decoded payload
    pub mime_type: String,
}

impl GeneratedImage {
    /// `data:` URI embedding the image
    #[must_use]
    pub fn data_uri(&self) -> String {
        format!("data:{};base64,{}", self.mime_type, self.base64)
    }
}

/// Generates images from text prompts
#[async_trait]
pub trait ImageBackend: Send + Sync {
    /// Generate one image for `prompt`
    async fn generate(&self, prompt: &str) -> anyhow::Result<GeneratedImage>;
}

/// MIME type from an image's magic bytes
#[must_use]
pub fn sniff_mime(bytes: &[u8]) -> Option<&'static str> {
    match bytes {
        [0x89, b'P', b'N', b'G', ..] => Some("image/png"),
        [0xFF, 0xD8, 0xFF, ..] => Some("image/jpeg"),
        [b'G', b'I', b'F', b'8', ..] => Some("image/gif"),
        [b'R', b'I', b'F', b'F', _, _, _, _, b'W', b'E', b'B', b'P', ..] => Some("image/webp"),
        [b'B', b'M', ..] => Some("image/bmp"),
        _ => None,
    }
}

/// HTML block shown for a generated image
#[must_use]
pub fn image_markup(data_uri: &str) -> String {
    format!(
        "\n\n<center><img src=\"{data_uri}\" class=\"mb-2 border shadow\" style=\"width: 300px;max-width: 100%;\" />\n\nComplete!</center>"
    )
}

/// Text shown when generation failed
#[must_use]
pub fn image_error_markup(error: &EngineError) -> String {
    format!("\n\n```\n{error}\n```\n\nRefer to the error above.")
}

// ============================================================================
// Stable Diffusion client
// ============================================================================

#[derive(Serialize)]
struct Txt2ImgRequest<'a> {
    prompt: &'a str,
    steps: u32,
}

#[derive(Deserialize)]
struct Txt2ImgResponse {
    #[serde(default)]
    images: Vec<String>,
}

/// Client for the Stable Diffusion web UI `txt2img` API
pub struct StableDiffusionClient {
    endpoint: String,
    steps: u32,
    http_client: reqwest::Client,
}

impl StableDiffusionClient {
    /// Create a client from configuration
    ///
    /// # Errors
    ///
    /// Fails if the HTTP client cannot be constructed.
    pub fn new(config: &ImageConfig) -> anyhow::Result<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()?;
        Ok(Self {
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            steps: config.steps,
            http_client,
        })
    }

    fn txt2img_url(&self) -> String {
        format!("{}/sdapi/v1/txt2img", self.endpoint)
    }
}

#[async_trait]
impl ImageBackend for StableDiffusionClient {
    async fn generate(&self, prompt: &str) -> anyhow::Result<GeneratedImage> {
        let response = self
            .http_client
            .post(self.txt2img_url())
            .json(&Txt2ImgRequest {
                prompt,
                steps: self.steps,
            })
            .send()
            .await
            .with_context(|| format!("Image request to {} failed", self.endpoint))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Image backend returned {status}: {body}");
        }

        let body: Txt2ImgResponse = response
            .json()
            .await
            .context("Image backend returned an unreadable response")?;
        let base64 = body
            .images
            .into_iter()
            .next()
            .context("Image backend returned no images")?;

        let bytes = STANDARD
            .decode(base64.as_bytes())
            .context("Image payload is not valid base64")?;
        let mime_type = sniff_mime(&bytes).unwrap_or("image/png").to_string();

        Ok(GeneratedImage { base64, mime_type })
    }
}

// ============================================================================
// Image service
// ============================================================================

/// Serializes access to the image backend
pub struct ImageService {
    backend: Arc<dyn ImageBackend>,
    lock: Semaphore,
    wait_timeout: Duration,
}

impl ImageService {
    /// Create a service; `wait_timeout` of zero waits forever
    pub fn new(backend: Arc<dyn ImageBackend>, wait_timeout: Duration) -> Self {
        Self {
            backend,
            lock: Semaphore::new(1),
            wait_timeout,
        }
    }

    /// Generate an image and return it as a `data:` URI
    ///
    /// # Errors
    ///
    /// [`EngineError::Timeout`] if the image slot stays busy past the wait
    /// timeout, [`EngineError::ImageGenerationFailure`] for backend errors.
    pub async fn create_image(&self, prompt: &str) -> Result<String, EngineError> {
        let acquired = if self.wait_timeout.is_zero() {
            self.lock.acquire().await
        } else {
            tokio::time::timeout(self.wait_timeout, self.lock.acquire())
                .await
                .map_err(|_| EngineError::Timeout {
                    what: "the image generator".to_string(),
                    waited: self.wait_timeout,
                })?
        };
        let _permit = acquired.map_err(|_| {
            EngineError::ImageGenerationFailure("image service is shut down".to_string())
        })?;

        tracing::info!(prompt, "Generating image");
        let image = self.backend.generate(prompt).await.map_err(|e| {
            tracing::warn!(error = %e, "Image generation failed");
            EngineError::ImageGenerationFailure(format!("{e:#}"))
        })?;

        Ok(image.data_uri())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::MockImageBackend;
    use tokio_test::{assert_pending, task};

    #[test]
    fn test_sniff_mime() {
        assert_eq!(sniff_mime(b"\x89PNG\r\n\x1a\n"), Some("image/png"));
        assert_eq!(sniff_mime(&[0xFF, 0xD8, 0xFF, 0xE0]), Some("image/jpeg"));
        assert_eq!(sniff_mime(b"GIF89a"), Some("image/gif"));
        assert_eq!(sniff_mime(b"RIFF\0\0\0\0WEBPVP8 "), Some("image/webp"));
        assert_eq!(sniff_mime(b"BM\0\0"), Some("image/bmp"));
        assert_eq!(sniff_mime(b"hello"), None);
    }

    #[test]
    fn test_data_uri_and_markup() {
        let image = GeneratedImage {
            base64: "AAAA".into(),
            mime_type: "image/png".into(),
        };
        assert_eq!(image.data_uri(), "data:image/png;base64,AAAA");
        assert!(image_markup(&image.data_uri()).contains("<img src=\"data:image/png;base64,AAAA\""));

        let err = image_error_markup(&EngineError::ImageGenerationFailure("boom".into()));
        assert!(err.contains("boom"));
        assert!(err.ends_with("Refer to the error above."));
    }

    #[test]
    fn test_txt2img_url() {
        let client = StableDiffusionClient::new(&ImageConfig {
            endpoint: "http://sd:7860/".into(),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(client.txt2img_url(), "http://sd:7860/sdapi/v1/txt2img");
        assert_eq!(client.steps, 5);
    }

    #[tokio::test]
    async fn test_create_image_returns_data_uri() {
        let backend = Arc::new(MockImageBackend::succeeding());
        let service = ImageService::new(backend.clone(), Duration::from_secs(1));

        let uri = service.create_image("fox, red, forest").await.unwrap();
        assert!(uri.starts_with("data:image/png;base64,"));
        assert_eq!(backend.prompts(), vec!["fox, red, forest".to_string()]);
    }

    #[tokio::test]
    async fn test_create_image_maps_failure() {
        let service = ImageService::new(
            Arc::new(MockImageBackend::failing("CUDA out of memory")),
            Duration::from_secs(1),
        );

        let result = service.create_image("x").await;
        assert!(
            matches!(result, Err(EngineError::ImageGenerationFailure(ref e)) if e.contains("CUDA"))
        );
    }

    #[tokio::test]
    async fn test_single_slot_times_out() {
        let backend = Arc::new(MockImageBackend::blocking());
        let service = ImageService::new(backend.clone(), Duration::from_millis(20));

        let mut first = task::spawn(service.create_image("slow"));
        assert_pending!(first.poll());

        let second = service.create_image("fast").await;
        assert!(matches!(second, Err(EngineError::Timeout { .. })));
        assert_eq!(backend.prompts(), vec!["slow".to_string()]);
    }
}
