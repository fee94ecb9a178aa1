//! Streaming transport seam for artifact downloads.

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::BoxStream;
use futures_util::{StreamExt, TryStreamExt};
use log::error;

use crate::error::RemovalError;

/// Body of an in-flight artifact download.
pub type ByteStream = BoxStream<'static, Result<Bytes, RemovalError>>;

/// A transport response, reduced to what the caching layer needs: the
/// advertised length (when the server sends one) and the readable body.
pub struct ArtifactResponse {
    pub content_length: Option<u64>,
    pub body: ByteStream,
}

impl ArtifactResponse {
    /// Synthesize a response over an already-complete buffer.
    pub fn from_bytes(bytes: Bytes) -> Self {
        Self {
            content_length: Some(bytes.len() as u64),
            body: futures_util::stream::once(async move { Ok(bytes) }).boxed(),
        }
    }

    /// Drain the body into a single contiguous buffer.
    pub async fn bytes(self) -> Result<Bytes, RemovalError> {
        let chunks: Vec<Bytes> = self.body.try_collect().await?;
        if chunks.len() == 1 {
            return Ok(chunks.into_iter().next().unwrap());
        }
        let mut buffer = Vec::with_capacity(chunks.iter().map(Bytes::len).sum());
        for chunk in &chunks {
            buffer.extend_from_slice(chunk);
        }
        Ok(Bytes::from(buffer))
    }
}

/// Fetch-like seam over the streaming network transport. The cache layer
/// wraps one of these; it never talks to the network itself.
#[async_trait]
pub trait ArtifactTransport: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<ArtifactResponse, RemovalError>;
}

/// Plain HTTP transport.
pub struct HttpTransport {
    client: reqwest::Client,
}

impl Default for HttpTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpTransport {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl ArtifactTransport for HttpTransport {
    async fn fetch(&self, url: &str) -> Result<ArtifactResponse, RemovalError> {
        let response = self.client.get(url).send().await.map_err(|e| {
            error!("Failed to start download: {}", e);
            RemovalError::Transfer(format!("Failed to start download: {}", e))
        })?;

        if !response.status().is_success() {
            return Err(RemovalError::Transfer(format!(
                "Download failed with status: {}",
                response.status()
            )));
        }

        let content_length = response.content_length();
        let body = response
            .bytes_stream()
            .map_err(|e| RemovalError::Transfer(format!("Download error: {}", e)))
            .boxed();

        Ok(ArtifactResponse {
            content_length,
            body,
        })
    }
}
