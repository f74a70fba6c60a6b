//! # Image Ingestion Pipeline
//!
//! Fetches remote images for multimodal prompts, works out their MIME type,
//! drops anything over the byte ceiling and base64-encodes the survivors.
//! Every URL is handled on its own: a failure is logged and skipped, the rest
//! of the batch carries on.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

use crate::models::ImageFormat;

/// Most restrictive provider ceiling for inline images.
pub const MAX_IMAGE_BYTES: usize = 4 * 1024 * 1024;

/// An image ready to embed in a prompt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageAsset {
    pub source_url: String,
    pub mime_type: String,
    pub size_bytes: usize,
    /// Base64 (standard alphabet) of the raw bytes
    pub encoded_payload: String,
}

impl ImageAsset {
    pub fn from_bytes(source_url: impl Into<String>, mime_type: impl Into<String>, bytes: &[u8]) -> Self {
        Self {
            source_url: source_url.into(),
            mime_type: mime_type.into(),
            size_bytes: bytes.len(),
            encoded_payload: general_purpose::STANDARD.encode(bytes),
        }
    }

    pub fn data_url(&self) -> String {
        format!("data:{};base64,{}", self.mime_type, self.encoded_payload)
    }

    /// Provider-specific wrapper around the payload.
    pub fn envelope(&self, format: ImageFormat) -> Value {
        match format {
            ImageFormat::OpenAi => json!({
                "type": "image_url",
                "image_url": { "url": self.data_url() }
            }),
            ImageFormat::InlineData => json!({
                "inlineData": { "mimeType": self.mime_type, "data": self.encoded_payload }
            }),
        }
    }
}

#[derive(Debug, Error)]
pub enum ImageError {
    #[error("fetch failed for {url}: {reason}")]
    Fetch { url: String, reason: String },

    #[error("{url} returned HTTP {status}")]
    Status { url: String, status: u16 },

    #[error("unsupported image type for {url}")]
    UnsupportedType { url: String },

    #[error("{url} is {size} bytes, over the {limit} byte limit")]
    TooLarge { url: String, size: usize, limit: usize },
}

/// Raw fetch result before typing and gating.
#[derive(Debug, Clone)]
pub struct FetchedImage {
    pub content_type: Option<String>,
    pub bytes: Vec<u8>,
}

#[async_trait]
pub trait ImageFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<FetchedImage, ImageError>;
}

/// Fetches images over HTTP with reqwest.
///
/// Bodies are read incrementally and abandoned once they pass `max_bytes`.
pub struct HttpImageFetcher {
    client: reqwest::Client,
    max_bytes: usize,
}

impl HttpImageFetcher {
    pub fn new() -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            client,
            max_bytes: MAX_IMAGE_BYTES,
        })
    }

    pub fn with_max_bytes(mut self, max_bytes: usize) -> Self {
        self.max_bytes = max_bytes;
        self
    }

    fn too_large(&self, url: &str, size: usize) -> ImageError {
        ImageError::TooLarge {
            url: url.to_string(),
            size,
            limit: self.max_bytes,
        }
    }
}

#[async_trait]
impl ImageFetcher for HttpImageFetcher {
    async fn fetch(&self, url: &str) -> Result<FetchedImage, ImageError> {
        let fetch_error = |e: reqwest::Error| ImageError::Fetch {
            url: url.to_string(),
            reason: e.to_string(),
        };
        let response = self.client.get(url).send().await.map_err(fetch_error)?;

        let status = response.status();
        if !status.is_success() {
            return Err(ImageError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }
        if let Some(length) = response.content_length() {
            if length > self.max_bytes as u64 {
                return Err(self.too_large(url, usize::try_from(length).unwrap_or(usize::MAX)));
            }
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        let mut bytes = Vec::new();
        let mut body = response.bytes_stream();
        while let Some(chunk) = body.next().await {
            bytes.extend_from_slice(&chunk.map_err(fetch_error)?);
            if bytes.len() > self.max_bytes {
                return Err(self.too_large(url, bytes.len()));
            }
        }

        Ok(FetchedImage { content_type, bytes })
    }
}

/// MIME type from the URL's extension, limited to jpeg/png/webp/gif.
/// Query strings and fragments are ignored.
pub fn infer_mime(url: &str) -> Option<&'static str> {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    let file = path.rsplit('/').next().unwrap_or(path);
    let (_, ext) = file.rsplit_once('.')?;
    match ext.to_ascii_lowercase().as_str() {
        "jpg" | "jpeg" => Some("image/jpeg"),
        "png" => Some("image/png"),
        "webp" => Some("image/webp"),
        "gif" => Some("image/gif"),
        _ => None,
    }
}

/// Header MIME type when it names an image, otherwise extension inference.
pub fn resolve_mime(content_type: Option<&str>, url: &str) -> Option<String> {
    let header = content_type
        .and_then(|ct| ct.split(';').next())
        .map(|ct| ct.trim().to_ascii_lowercase())
        .filter(|ct| ct.starts_with("image/"));
    header.or_else(|| infer_mime(url).map(str::to_string))
}

pub struct ImagePipeline {
    fetcher: Arc<dyn ImageFetcher>,
    max_bytes: usize,
}

impl ImagePipeline {
    pub fn new(fetcher: Arc<dyn ImageFetcher>) -> Self {
        Self {
            fetcher,
            max_bytes: MAX_IMAGE_BYTES,
        }
    }

    pub fn with_max_bytes(mut self, max_bytes: usize) -> Self {
        self.max_bytes = max_bytes;
        self
    }

    /// Ingest a loosely-typed list (e.g. straight from a request body).
    ///
    /// Non-string and empty entries are skipped. The result keeps source order.
    pub async fn ingest(&self, inputs: &[Value]) -> Vec<ImageAsset> {
        let urls: Vec<&str> = inputs
            .iter()
            .filter_map(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect();
        self.ingest_urls(&urls).await
    }

    pub async fn ingest_urls<S: AsRef<str>>(&self, urls: &[S]) -> Vec<ImageAsset> {
        let results = futures::future::join_all(
            urls.iter()
                .map(|u| u.as_ref().trim())
                .filter(|u| !u.is_empty())
                .map(|url| self.ingest_one(url)),
        )
        .await;

        results
            .into_iter()
            .filter_map(|result| match result {
                Ok(asset) => Some(asset),
                Err(e) => {
                    tracing::warn!("Skipping image: {}", e);
                    None
                }
            })
            .collect()
    }

    async fn ingest_one(&self, url: &str) -> Result<ImageAsset, ImageError> {
        let fetched = self.fetcher.fetch(url).await?;

        let mime = resolve_mime(fetched.content_type.as_deref(), url).ok_or_else(|| {
            ImageError::UnsupportedType {
                url: url.to_string(),
            }
        })?;

        if fetched.bytes.len() > self.max_bytes {
            return Err(ImageError::TooLarge {
                url: url.to_string(),
                size: fetched.bytes.len(),
                limit: self.max_bytes,
            });
        }

        tracing::debug!("Ingested {} ({}, {} bytes)", url, mime, fetched.bytes.len());
        Ok(ImageAsset::from_bytes(url, mime, &fetched.bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    /// Serves canned responses keyed by URL.
    #[derive(Default)]
    struct FakeFetcher {
        responses: HashMap<String, FetchedImage>,
    }

    impl FakeFetcher {
        fn with(mut self, url: &str, content_type: Option<&str>, size: usize) -> Self {
            self.responses.insert(
                url.to_string(),
                FetchedImage {
                    content_type: content_type.map(str::to_string),
                    bytes: vec![7u8; size],
                },
            );
            self
        }
    }

    #[async_trait]
    impl ImageFetcher for FakeFetcher {
        async fn fetch(&self, url: &str) -> Result<FetchedImage, ImageError> {
            self.responses.get(url).cloned().ok_or_else(|| ImageError::Status {
                url: url.to_string(),
                status: 404,
            })
        }
    }

    fn pipeline(fetcher: FakeFetcher) -> ImagePipeline {
        ImagePipeline::new(Arc::new(fetcher))
    }

    #[tokio::test]
    async fn mixed_list_keeps_only_typed_assets() {
        let fetcher = FakeFetcher::default()
            .with("https://x/a.png", None, 10)
            .with("https://x/b.unknownext", Some("application/octet-stream"), 10);
        let inputs = vec![
            json!("https://x/a.png"),
            json!(42),
            json!(""),
            json!("https://x/b.unknownext"),
        ];

        let assets = pipeline(fetcher).ingest(&inputs).await;
        assert_eq!(assets.len(), 1);
        assert_eq!(assets[0].source_url, "https://x/a.png");
        assert_eq!(assets[0].mime_type, "image/png");
        assert_eq!(assets[0].size_bytes, 10);
    }

    #[tokio::test]
    async fn oversized_and_unreachable_are_dropped_in_order() {
        let fetcher = FakeFetcher::default()
            .with("https://x/1.jpg", None, 5)
            .with("https://x/big.png", Some("image/png"), MAX_IMAGE_BYTES + 1)
            .with("https://x/3", Some("image/webp"), 5)
            .with("https://x/edge.gif", None, MAX_IMAGE_BYTES);
        let urls = [
            "https://x/1.jpg",
            "https://x/big.png",
            "https://x/missing.png",
            "https://x/3",
            "https://x/edge.gif",
        ];

        let assets = pipeline(fetcher).ingest_urls(&urls).await;
        let kept: Vec<_> = assets.iter().map(|a| a.source_url.as_str()).collect();
        assert_eq!(kept, vec!["https://x/1.jpg", "https://x/3", "https://x/edge.gif"]);
        assert_eq!(assets[1].mime_type, "image/webp");
        assert_eq!(assets[2].size_bytes, MAX_IMAGE_BYTES);
    }

    #[tokio::test]
    async fn header_wins_over_extension() {
        let fetcher = FakeFetcher::default().with("https://x/pic.png", Some("image/jpeg; charset=binary"), 3);
        let assets = pipeline(fetcher).ingest_urls(&["https://x/pic.png"]).await;
        assert_eq!(assets[0].mime_type, "image/jpeg");
    }

    #[test]
    fn extension_inference_ignores_query_string() {
        assert_eq!(infer_mime("https://cdn/x/photo.JPG?w=200#top"), Some("image/jpeg"));
        assert_eq!(infer_mime("https://cdn/x/photo.webp"), Some("image/webp"));
        assert_eq!(infer_mime("https://cdn/x/photo.svg"), None);
        assert_eq!(infer_mime("https://cdn.example/x"), None);
    }

    #[test]
    fn envelopes_per_provider_family() {
        let asset = ImageAsset::from_bytes("u", "image/png", &[0, 1, 2]);
        assert_eq!(asset.encoded_payload, "AAEC");

        let openai = asset.envelope(ImageFormat::OpenAi);
        assert_eq!(openai["image_url"]["url"], "data:image/png;base64,AAEC");

        let inline = asset.envelope(ImageFormat::InlineData);
        assert_eq!(inline["inlineData"]["mimeType"], "image/png");
        assert_eq!(inline["inlineData"]["data"], "AAEC");
    }

    /// Answer one GET with `head` and a `size`-byte body, then close.
    async fn serve_body(head: &'static str, size: usize) -> String {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut buf = [0u8; 1024];
            while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                let n = socket.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                request.extend_from_slice(&buf[..n]);
            }
            let head = head.replace("{size}", &size.to_string());
            let _ = socket.write_all(head.as_bytes()).await;
            let _ = socket.write_all(&vec![7u8; size]).await;
            let _ = socket.shutdown().await;
        });
        format!("http://{addr}/pic.png")
    }

    #[tokio::test]
    async fn http_fetch_rejects_declared_length_over_limit() {
        let url = serve_body(
            "HTTP/1.1 200 OK\r\ncontent-type: image/png\r\ncontent-length: {size}\r\n\r\n",
            64,
        )
        .await;
        let fetcher = HttpImageFetcher::new().unwrap().with_max_bytes(16);
        let err = fetcher.fetch(&url).await.unwrap_err();
        assert!(matches!(err, ImageError::TooLarge { size: 64, limit: 16, .. }), "{err}");
    }

    #[tokio::test]
    async fn http_fetch_stops_reading_undeclared_body_over_limit() {
        let url = serve_body(
            "HTTP/1.1 200 OK\r\ncontent-type: image/png\r\nconnection: close\r\n\r\n",
            64 * 1024,
        )
        .await;
        let fetcher = HttpImageFetcher::new().unwrap().with_max_bytes(16);
        let err = fetcher.fetch(&url).await.unwrap_err();
        match err {
            ImageError::TooLarge { size, limit, .. } => {
                assert!(size > 16);
                assert_eq!(limit, 16);
            }
            other => panic!("expected TooLarge, got {other}"),
        }
    }

    #[tokio::test]
    async fn http_fetch_returns_small_bodies_whole() {
        let url = serve_body(
            "HTTP/1.1 200 OK\r\ncontent-type: image/png\r\ncontent-length: {size}\r\n\r\n",
            12,
        )
        .await;
        let fetcher = HttpImageFetcher::new().unwrap().with_max_bytes(16);
        let fetched = fetcher.fetch(&url).await.unwrap();
        assert_eq!(fetched.bytes.len(), 12);
        assert_eq!(fetched.content_type.as_deref(), Some("image/png"));
    }
}
