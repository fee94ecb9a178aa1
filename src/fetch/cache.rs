//! Caching, coalescing decoration over the artifact transport.
//!
//! Each distinct artifact URL goes over the network at most once per
//! process lifetime: completed buffers are kept in memory forever, and
//! concurrent requests for a URL that is already downloading share the
//! single in-flight transfer. Requests whose URL does not look like a
//! model artifact pass straight through to the base transport.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::future::{BoxFuture, FutureExt, Shared};
use futures_util::StreamExt;
use log::{debug, info, warn};
use sha2::{Digest, Sha256};
use tokio::sync::{mpsc, oneshot};

use crate::error::RemovalError;
use crate::progress::ProgressChannel;

use super::{ArtifactResponse, ArtifactTransport, ByteStream};

/// Download progress is capped here; 100 is reserved for the ready phase.
const DOWNLOAD_CEILING: u8 = 99;

type SharedFetch = Shared<BoxFuture<'static, Result<Bytes, RemovalError>>>;

/// Decorator over an [`ArtifactTransport`] adding the memory cache,
/// per-URL single-flight coalescing and streaming download progress.
pub struct FetchCache {
    transport: Arc<dyn ArtifactTransport>,
    progress: ProgressChannel,
    /// URL substrings that mark a request as a model artifact.
    hosts: Vec<String>,
    /// Completed buffers, retained for the life of the process.
    cache: Arc<Mutex<HashMap<String, Bytes>>>,
    /// One pending fetch per URL; the entry exists only between request
    /// start and completion or failure.
    in_flight: Arc<Mutex<HashMap<String, SharedFetch>>>,
}

impl FetchCache {
    pub fn new(
        transport: Arc<dyn ArtifactTransport>,
        progress: ProgressChannel,
        hosts: Vec<String>,
    ) -> Self {
        Self {
            transport,
            progress,
            hosts,
            cache: Arc::new(Mutex::new(HashMap::new())),
            in_flight: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Fetch a whole artifact, verifying its SHA-256 when the catalog pins
    /// one. A corrupt buffer is discarded rather than cached, so the next
    /// attempt goes back to the network.
    pub async fn fetch_bytes(
        &self,
        url: &str,
        expected_sha256: Option<&str>,
    ) -> Result<Bytes, RemovalError> {
        let bytes = self.fetch(url).await?.bytes().await?;
        if let Some(expected) = expected_sha256 {
            if let Err(e) = verify_checksum(&bytes, expected) {
                warn!("discarding artifact with bad checksum: {}", url);
                self.cache.lock().unwrap().remove(url);
                return Err(e);
            }
        }
        Ok(bytes)
    }

    fn is_artifact(&self, url: &str) -> bool {
        self.hosts.iter().any(|host| url.contains(host.as_str()))
    }

    async fn lead_download(
        &self,
        url: &str,
        session: u64,
        done_tx: oneshot::Sender<Result<Bytes, RemovalError>>,
    ) -> Result<ArtifactResponse, RemovalError> {
        info!("fetching artifact: {}", url);
        let response = match self.transport.fetch(url).await {
            Ok(response) => response,
            Err(e) => {
                self.in_flight.lock().unwrap().remove(url);
                self.progress.report_error(session, e.to_string());
                let _ = done_tx.send(Err(e.clone()));
                return Err(e);
            }
        };

        let total = response.content_length;
        let (chunk_tx, chunk_rx) = mpsc::unbounded_channel();
        let pump = DownloadPump {
            url: url.to_string(),
            session,
            total,
            cache: self.cache.clone(),
            in_flight: self.in_flight.clone(),
            progress: self.progress.clone(),
        };
        tokio::spawn(pump.run(response.body, chunk_tx, done_tx));

        let body = futures_util::stream::unfold(chunk_rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        })
        .boxed();
        Ok(ArtifactResponse {
            content_length: total,
            body,
        })
    }
}

enum Role {
    Leader(oneshot::Sender<Result<Bytes, RemovalError>>),
    Follower(SharedFetch),
}

#[async_trait]
impl ArtifactTransport for FetchCache {
    async fn fetch(&self, url: &str) -> Result<ArtifactResponse, RemovalError> {
        if !self.is_artifact(url) {
            return self.transport.fetch(url).await;
        }

        let cached = self.cache.lock().unwrap().get(url).cloned();
        if let Some(buffer) = cached {
            debug!("artifact cache hit: {}", url);
            self.progress
                .report_download(DOWNLOAD_CEILING, self.progress.active_session());
            return Ok(ArtifactResponse::from_bytes(buffer));
        }

        // Captured once at request start; the broadcaster drops reports if
        // a newer session supersedes this one mid-download.
        let session = self.progress.active_session();

        let role = {
            let mut in_flight = self.in_flight.lock().unwrap();
            match in_flight.get(url) {
                Some(pending) => Role::Follower(pending.clone()),
                None => {
                    let (done_tx, done_rx) = oneshot::channel();
                    let shared: SharedFetch = async move {
                        match done_rx.await {
                            Ok(result) => result,
                            Err(_) => {
                                Err(RemovalError::Transfer("download task dropped".to_string()))
                            }
                        }
                    }
                    .boxed()
                    .shared();
                    in_flight.insert(url.to_string(), shared);
                    Role::Leader(done_tx)
                }
            }
        };

        match role {
            Role::Follower(pending) => {
                debug!("coalescing request for in-flight artifact: {}", url);
                let body = futures_util::stream::once(async move { pending.await }).boxed();
                Ok(ArtifactResponse {
                    content_length: None,
                    body,
                })
            }
            Role::Leader(done_tx) => self.lead_download(url, session, done_tx).await,
        }
    }
}

/// Drives one network download to completion independently of the
/// requester that started it: forwards every chunk unmodified, accumulates
/// the full buffer, reports byte-accurate progress, and settles the shared
/// future for coalesced waiters.
struct DownloadPump {
    url: String,
    session: u64,
    total: Option<u64>,
    cache: Arc<Mutex<HashMap<String, Bytes>>>,
    in_flight: Arc<Mutex<HashMap<String, SharedFetch>>>,
    progress: ProgressChannel,
}

impl DownloadPump {
    async fn run(
        self,
        mut body: ByteStream,
        chunk_tx: mpsc::UnboundedSender<Result<Bytes, RemovalError>>,
        done_tx: oneshot::Sender<Result<Bytes, RemovalError>>,
    ) {
        let mut received = Vec::with_capacity(self.total.unwrap_or(0) as usize);
        let mut last_percent = 0u8;

        while let Some(next) = body.next().await {
            match next {
                Ok(chunk) => {
                    received.extend_from_slice(&chunk);
                    if let Some(total) = self.total.filter(|t| *t > 0) {
                        let percent = (received.len() as u64 * 100 / total)
                            .min(DOWNLOAD_CEILING as u64) as u8;
                        if percent > last_percent {
                            last_percent = percent;
                            self.progress.report_download(percent, self.session);
                        }
                    }
                    // A requester that stopped reading does not abort the
                    // transfer; coalesced waiters still need the buffer.
                    let _ = chunk_tx.send(Ok(chunk));
                }
                Err(e) => {
                    warn!("artifact download failed: {}: {}", self.url, e);
                    self.in_flight.lock().unwrap().remove(&self.url);
                    self.progress.report_error(self.session, e.to_string());
                    let _ = chunk_tx.send(Err(e.clone()));
                    let _ = done_tx.send(Err(e));
                    return;
                }
            }
        }

        let buffer = Bytes::from(received);
        debug!("artifact stored: {} ({} bytes)", self.url, buffer.len());
        self.cache
            .lock()
            .unwrap()
            .insert(self.url.clone(), buffer.clone());
        let _ = done_tx.send(Ok(buffer));
        self.in_flight.lock().unwrap().remove(&self.url);
    }
}

/// Verify the SHA-256 of a downloaded buffer against the catalog's pin.
fn verify_checksum(bytes: &[u8], expected: &str) -> Result<(), RemovalError> {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    let computed = format!("{:x}", hasher.finalize());
    if computed != expected {
        return Err(RemovalError::Transfer(format!(
            "Hash mismatch: expected {}, got {}",
            expected, computed
        )));
    }
    Ok(())
}
