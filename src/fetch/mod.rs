mod cache;
mod transport;

pub use cache::FetchCache;
pub use transport::{ArtifactResponse, ArtifactTransport, ByteStream, HttpTransport};

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use bytes::Bytes;
    use futures_util::StreamExt;

    use crate::error::RemovalError;

    use super::{ArtifactResponse, ArtifactTransport};

    /// Transport that serves a scripted chunk sequence and counts how many
    /// network requests were actually issued.
    pub struct ScriptedTransport {
        chunks: Vec<Vec<u8>>,
        content_length: Option<u64>,
        /// Index of the chunk to fail after, if any.
        fail_after: Option<usize>,
        pub hits: AtomicUsize,
    }

    impl ScriptedTransport {
        pub fn new(chunks: Vec<Vec<u8>>) -> Self {
            let content_length = Some(chunks.iter().map(|c| c.len() as u64).sum());
            Self {
                chunks,
                content_length,
                fail_after: None,
                hits: AtomicUsize::new(0),
            }
        }

        pub fn failing_after(mut self, chunk_index: usize) -> Self {
            self.fail_after = Some(chunk_index);
            self
        }

        pub fn request_count(&self) -> usize {
            self.hits.load(Ordering::SeqCst)
        }

        pub fn payload(&self) -> Vec<u8> {
            self.chunks.concat()
        }
    }

    #[async_trait]
    impl ArtifactTransport for ScriptedTransport {
        async fn fetch(&self, _url: &str) -> Result<ArtifactResponse, RemovalError> {
            self.hits.fetch_add(1, Ordering::SeqCst);
            let chunks = self.chunks.clone();
            let fail_after = self.fail_after;
            let body = futures_util::stream::iter(chunks.into_iter().enumerate())
                .then(move |(index, chunk)| async move {
                    // Let concurrent requesters pile up while the stream is live.
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    match fail_after {
                        Some(boundary) if index > boundary => {
                            Err(RemovalError::Transfer("connection reset".to_string()))
                        }
                        _ => Ok(Bytes::from(chunk)),
                    }
                })
                .boxed();
            Ok(ArtifactResponse {
                content_length: self.content_length,
                body,
            })
        }
    }

    pub fn scripted(chunks: Vec<Vec<u8>>) -> Arc<ScriptedTransport> {
        Arc::new(ScriptedTransport::new(chunks))
    }
}
