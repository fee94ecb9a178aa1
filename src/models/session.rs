//! Session management for model acquisition.
//!
//! A session is one attempt to turn catalog metadata into a ready
//! `{segmenter, processor}` pair. The result is memoized as a shared
//! future, so concurrent callers ride the same acquisition and a warm call
//! resolves immediately. A failed session is replaced wholesale on the
//! next call; it is never patched in place.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use futures_util::future::{BoxFuture, FutureExt, Shared};
use log::{info, warn};

use crate::capability::{Backend, Capabilities, Precision};
use crate::error::RemovalError;
use crate::fetch::FetchCache;
use crate::inference::{Processor, Segmenter, SegmenterLoader};
use crate::models::ModelCatalogEntry;
use crate::progress::ProgressChannel;

/// The ready handle pair a session produces.
pub struct SessionHandles {
    pub segmenter: Arc<dyn Segmenter>,
    pub processor: Processor,
}

impl std::fmt::Debug for SessionHandles {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandles").finish_non_exhaustive()
    }
}

type LoadFuture = Shared<BoxFuture<'static, Result<Arc<SessionHandles>, RemovalError>>>;

struct Memoized {
    generation: u64,
    future: LoadFuture,
}

/// Acquires and memoizes inference sessions.
///
/// Cloning is cheap; clones share the memoized session, the fallback flag
/// and the progress stream.
#[derive(Clone)]
pub struct SessionManager {
    progress: ProgressChannel,
    capabilities: Arc<dyn Capabilities>,
    fetch: Arc<FetchCache>,
    loader: Arc<dyn SegmenterLoader>,
    entry: Arc<ModelCatalogEntry>,
    current: Arc<Mutex<Option<Memoized>>>,
    next_generation: Arc<AtomicU64>,
    /// One-shot: when armed, the next load skips the probe and runs on the
    /// universal fallback backend. Consumed by that load regardless of its
    /// outcome.
    fallback_armed: Arc<AtomicBool>,
}

impl SessionManager {
    pub fn new(
        progress: ProgressChannel,
        capabilities: Arc<dyn Capabilities>,
        fetch: Arc<FetchCache>,
        loader: Arc<dyn SegmenterLoader>,
        entry: ModelCatalogEntry,
    ) -> Self {
        Self {
            progress,
            capabilities,
            fetch,
            loader,
            entry: Arc::new(entry),
            current: Arc::new(Mutex::new(None)),
            next_generation: Arc::new(AtomicU64::new(0)),
            fallback_armed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Obtain the ready handle pair, acquiring it if necessary.
    ///
    /// Exactly one acquisition runs at a time; every concurrent caller
    /// shares its future and therefore its result. On failure the memoized
    /// session is invalidated so the next call starts fresh.
    pub async fn load(&self) -> Result<Arc<SessionHandles>, RemovalError> {
        let future = {
            let mut current = self.current.lock().unwrap();
            match current.as_ref() {
                Some(memoized) => memoized.future.clone(),
                None => {
                    let generation = self.next_generation.fetch_add(1, Ordering::SeqCst) + 1;
                    let this = self.clone();
                    let future: LoadFuture =
                        async move { this.run_session(generation).await }.boxed().shared();
                    *current = Some(Memoized {
                        generation,
                        future: future.clone(),
                    });
                    future
                }
            }
        };
        future.await
    }

    /// Invalidate any memoized session and force the next `load()` onto
    /// the universal fallback backend, bypassing the capability probe.
    pub fn force_fallback_mode(&self) {
        info!("fallback mode requested; invalidating current session");
        *self.current.lock().unwrap() = None;
        self.fallback_armed.store(true, Ordering::SeqCst);
    }

    async fn run_session(self, generation: u64) -> Result<Arc<SessionHandles>, RemovalError> {
        let session = self.progress.begin_session();
        match self.acquire(session).await {
            Ok(handles) => Ok(handles),
            Err(e) => {
                warn!("session {} failed: {}", session, e);
                self.invalidate(generation);
                self.progress.report_error(session, e.to_string());
                Err(e)
            }
        }
    }

    async fn acquire(&self, session: u64) -> Result<Arc<SessionHandles>, RemovalError> {
        let backend = if self.fallback_armed.swap(false, Ordering::SeqCst) {
            info!("fallback armed; skipping capability probe");
            Backend::CpuFp32
        } else {
            self.capabilities.probe().await
        };
        info!("acquiring model '{}' on {}", self.entry.name, backend);

        let weights = self.weights_for(backend.precision())?;
        let bytes = self
            .fetch
            .fetch_bytes(&weights.url, weights.sha256.as_deref())
            .await?;

        let segmenter = self.loader.load(bytes, backend).await?;
        self.progress.report_building(session);

        let config = self.fetch.fetch_bytes(&self.entry.processor_url, None).await?;
        let processor = Processor::from_config_bytes(&config)?;

        self.progress.report_ready(session);
        info!("model '{}' ready ({})", self.entry.name, backend);
        Ok(Arc::new(SessionHandles {
            segmenter,
            processor,
        }))
    }

    fn weights_for(&self, precision: Precision) -> Result<&crate::models::ModelWeights, RemovalError> {
        self.entry.weights_for(precision).ok_or_else(|| {
            RemovalError::ModelLoad(format!(
                "model '{}' ships no {} weights",
                self.entry.name, precision
            ))
        })
    }

    /// Clear the memoized session, but only if it is still the one that
    /// failed; a newer session must not be discarded by a stale failure.
    fn invalidate(&self, generation: u64) {
        let mut current = self.current.lock().unwrap();
        if current.as_ref().is_some_and(|m| m.generation == generation) {
            *current = None;
        }
    }
}
