//! End-to-end orchestration and the crate's runtime context.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use image::imageops::FilterType;
use image::{GrayImage, RgbaImage};
use log::{debug, info};
use serde::Serialize;
use uuid::Uuid;

use crate::capability::{Backend, Capabilities, CapabilityProbe};
use crate::compositing::Compositor;
use crate::config::RemovalConfig;
use crate::error::RemovalError;
use crate::fetch::{ArtifactTransport, FetchCache, HttpTransport};
use crate::inference::{OnnxLoader, ProbabilityMap, SegmenterLoader};
use crate::models::{find_model, SessionManager};
use crate::progress::{ProgressChannel, ProgressState, Subscription};

/// Locators for the produced artifacts plus measurements.
///
/// The files are owned by the caller from here on; nothing deletes them.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RemovalResult {
    pub full_path: PathBuf,
    pub preview_path: PathBuf,
    pub width: u32,
    pub height: u32,
    /// Inference + compositing only; session acquisition is not counted.
    pub processing_time_seconds: f64,
}

/// Runtime context for background removal.
///
/// Constructed once and holds every piece of process-wide state: the
/// progress stream, the artifact cache, the memoized session and the
/// compositor. All methods take `&self`; the context is cheap to share
/// behind an `Arc`.
pub struct BackgroundRemover {
    config: RemovalConfig,
    progress: ProgressChannel,
    capabilities: Arc<dyn Capabilities>,
    sessions: SessionManager,
    compositor: Compositor,
}

impl std::fmt::Debug for BackgroundRemover {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackgroundRemover").finish_non_exhaustive()
    }
}

impl BackgroundRemover {
    /// Build a context with the default collaborators: HTTP transport,
    /// wgpu capability probe and the ONNX segmenter loader.
    pub fn new(config: RemovalConfig) -> Result<Self, RemovalError> {
        Self::with_collaborators(
            config,
            Arc::new(HttpTransport::new()),
            Arc::new(CapabilityProbe::new()),
            Arc::new(OnnxLoader),
        )
    }

    /// Build a context with explicit collaborators injected at the seams.
    pub fn with_collaborators(
        config: RemovalConfig,
        transport: Arc<dyn ArtifactTransport>,
        capabilities: Arc<dyn Capabilities>,
        loader: Arc<dyn SegmenterLoader>,
    ) -> Result<Self, RemovalError> {
        let entry = find_model(&config.model).ok_or_else(|| {
            RemovalError::ModelLoad(format!("model '{}' not found in catalog", config.model))
        })?;
        let progress = ProgressChannel::new();
        let fetch = Arc::new(FetchCache::new(
            transport,
            progress.clone(),
            config.artifact_hosts.clone(),
        ));
        let sessions = SessionManager::new(
            progress.clone(),
            capabilities.clone(),
            fetch,
            loader,
            entry,
        );
        let compositor = Compositor::new(&config);
        Ok(Self {
            config,
            progress,
            capabilities,
            sessions,
            compositor,
        })
    }

    /// Detect the best available backend. Read-only and never fails.
    pub async fn probe_capabilities(&self) -> Backend {
        self.capabilities.probe().await
    }

    /// Subscribe to acquisition progress. The current state is replayed to
    /// the listener immediately.
    pub fn subscribe(
        &self,
        listener: impl Fn(&ProgressState) + Send + Sync + 'static,
    ) -> Subscription {
        self.progress.subscribe(listener)
    }

    /// Force the next model load onto the universal fallback backend.
    pub fn force_fallback_mode(&self) {
        self.sessions.force_fallback_mode();
    }

    /// Remove the background from the image at `source`.
    ///
    /// Cold calls run the full acquisition lifecycle (visible through
    /// [`subscribe`](Self::subscribe)); warm calls reuse the memoized
    /// session and start processing immediately.
    pub async fn remove_background(
        &self,
        source: impl AsRef<Path>,
    ) -> Result<RemovalResult, RemovalError> {
        let source = source.as_ref();
        if source.as_os_str().is_empty() {
            return Err(RemovalError::Input("source path is empty".to_string()));
        }

        let handles = self.sessions.load().await?;

        let path = source.to_path_buf();
        let bitmap = tokio::task::spawn_blocking(move || decode_source(&path))
            .await
            .map_err(|e| RemovalError::Input(format!("decode task panicked: {}", e)))??;
        let (width, height) = bitmap.dimensions();
        debug!("decoded {}x{} source from {}", width, height, source.display());

        let started = Instant::now();

        let segmenter = handles.segmenter.clone();
        let processor = handles.processor.clone();
        let (bitmap, map) = tokio::task::spawn_blocking(move || {
            let input = processor.prepare(&bitmap);
            segmenter.predict(input).map(|map| (bitmap, map))
        })
        .await
        .map_err(|e| RemovalError::Inference(format!("inference task panicked: {}", e)))??;

        let alpha = resample_mask(&map, width, height);
        let expected = width as usize * height as usize;
        if alpha.len() != expected {
            return Err(RemovalError::MaskMismatch {
                expected,
                actual: alpha.len(),
            });
        }

        let composite = self.compositor.composite(bitmap, alpha).await?;
        let elapsed = started.elapsed().as_secs_f64();

        let (full_path, preview_path) = self.write_artifacts(&composite).await?;
        info!(
            "background removed in {:.2}s -> {}",
            elapsed,
            full_path.display()
        );

        Ok(RemovalResult {
            full_path,
            preview_path,
            width: composite.width,
            height: composite.height,
            processing_time_seconds: elapsed,
        })
    }

    async fn write_artifacts(
        &self,
        composite: &crate::compositing::CompositeResult,
    ) -> Result<(PathBuf, PathBuf), RemovalError> {
        let dir = &self.config.artifacts_dir;
        tokio::fs::create_dir_all(dir).await.map_err(|e| {
            RemovalError::Compositing(format!("failed to create artifacts dir: {}", e))
        })?;

        let id = Uuid::new_v4();
        let full_path = dir.join(format!("{}.png", id));
        let preview_path = dir.join(format!("{}-preview.jpg", id));
        tokio::fs::write(&full_path, &composite.full_image)
            .await
            .map_err(|e| RemovalError::Compositing(format!("failed to write artifact: {}", e)))?;
        tokio::fs::write(&preview_path, &composite.preview_image)
            .await
            .map_err(|e| RemovalError::Compositing(format!("failed to write preview: {}", e)))?;
        Ok((full_path, preview_path))
    }
}

fn decode_source(path: &Path) -> Result<RgbaImage, RemovalError> {
    image::open(path)
        .map(|img| img.to_rgba8())
        .map_err(|e| RemovalError::Input(format!("failed to decode {}: {}", path.display(), e)))
}

/// Scale the probability map to a 0..255 byte mask and resample it to the
/// source resolution. Nearest-neighbor on purpose: no smoothing beyond
/// whatever the collaborator itself applied.
///
/// Returns an empty buffer when the map's claimed dimensions do not match
/// its data; the caller's length check turns that into `MaskMismatch`.
fn resample_mask(map: &ProbabilityMap, width: u32, height: u32) -> Vec<u8> {
    let bytes: Vec<u8> = map
        .data
        .iter()
        .map(|p| (p * 255.0).round() as u8)
        .collect();
    let Some(gray) = GrayImage::from_raw(map.width, map.height, bytes) else {
        return Vec::new();
    };
    if (map.width, map.height) == (width, height) {
        return gray.into_raw();
    }
    image::imageops::resize(&gray, width, height, FilterType::Nearest).into_raw()
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use bytes::Bytes;
    use image::Rgba;
    use ndarray::Array4;

    use super::*;
    use crate::fetch::testing::scripted;
    use crate::inference::Segmenter;
    use crate::progress::ProgressPhase;

    struct FixedCapabilities(Backend);

    #[async_trait]
    impl Capabilities for FixedCapabilities {
        async fn probe(&self) -> Backend {
            self.0
        }
    }

    /// Produces a uniform 0.5 probability map, or an inconsistent one when
    /// `lie` is set.
    struct StubSegmenter {
        lie: bool,
    }

    impl Segmenter for StubSegmenter {
        fn predict(&self, input: Array4<f32>) -> Result<ProbabilityMap, RemovalError> {
            let (_, _, height, width) = input.dim();
            let len = if self.lie { 10 } else { width * height };
            Ok(ProbabilityMap {
                width: width as u32,
                height: height as u32,
                data: vec![0.5; len],
            })
        }
    }

    struct StubLoader {
        lie: bool,
        loads: std::sync::atomic::AtomicUsize,
    }

    #[async_trait]
    impl SegmenterLoader for StubLoader {
        async fn load(
            &self,
            _weights: Bytes,
            _backend: Backend,
        ) -> Result<Arc<dyn Segmenter>, RemovalError> {
            self.loads.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Ok(Arc::new(StubSegmenter { lie: self.lie }))
        }
    }

    fn remover_with(lie: bool, artifacts_dir: PathBuf) -> (BackgroundRemover, Arc<StubLoader>) {
        let config = RemovalConfig {
            artifacts_dir,
            artifact_hosts: vec!["huggingface.co".to_string()],
            ..Default::default()
        };
        let loader = Arc::new(StubLoader {
            lie,
            loads: std::sync::atomic::AtomicUsize::new(0),
        });
        let remover = BackgroundRemover::with_collaborators(
            config,
            scripted(vec![br#"{"size": 16}"#.to_vec()]),
            Arc::new(FixedCapabilities(Backend::CpuFp32)),
            loader.clone(),
        )
        .unwrap();
        (remover, loader)
    }

    fn write_source(dir: &Path, width: u32, height: u32) -> PathBuf {
        let path = dir.join("source.png");
        let image = RgbaImage::from_pixel(width, height, Rgba([210, 60, 25, 255]));
        image.save(&path).unwrap();
        path
    }

    #[test]
    fn unknown_model_is_rejected_at_construction() {
        let config = RemovalConfig {
            model: "not-a-model".to_string(),
            ..Default::default()
        };
        let err = BackgroundRemover::new(config).unwrap_err();
        assert!(matches!(err, RemovalError::ModelLoad(_)));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn empty_source_locator_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let (remover, _) = remover_with(false, dir.path().to_path_buf());
        let err = remover.remove_background("").await.unwrap_err();
        assert!(matches!(err, RemovalError::Input(_)));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn removes_background_end_to_end() {
        let dir = tempfile::tempdir().unwrap();
        let (remover, _) = remover_with(false, dir.path().join("artifacts"));
        let source = write_source(dir.path(), 20, 14);

        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = seen.clone();
        remover.subscribe(move |state| {
            sink.lock().unwrap().push(state.phase);
        });

        let result = remover.remove_background(&source).await.unwrap();
        assert_eq!((result.width, result.height), (20, 14));
        assert!(result.processing_time_seconds >= 0.0);
        assert!(result.preview_path.exists());

        // Uniform 0.5 probability becomes alpha 128 everywhere, RGB intact.
        let decoded = image::open(&result.full_path).unwrap().to_rgba8();
        assert_eq!(decoded.dimensions(), (20, 14));
        for pixel in decoded.pixels() {
            assert_eq!(pixel.0, [210, 60, 25, 128]);
        }

        let phases = seen.lock().unwrap().clone();
        assert!(phases.contains(&ProgressPhase::Ready));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn warm_calls_reuse_the_session() {
        let dir = tempfile::tempdir().unwrap();
        let (remover, loader) = remover_with(false, dir.path().join("artifacts"));
        let source = write_source(dir.path(), 9, 9);

        let first = remover.remove_background(&source).await.unwrap();
        let second = remover.remove_background(&source).await.unwrap();
        assert_eq!(loader.loads.load(std::sync::atomic::Ordering::SeqCst), 1);
        // Each call produces its own artifacts.
        assert_ne!(first.full_path, second.full_path);
        assert!(first.full_path.exists() && second.full_path.exists());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn inconsistent_mask_surfaces_as_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let (remover, _) = remover_with(true, dir.path().join("artifacts"));
        let source = write_source(dir.path(), 12, 8);

        let err = remover.remove_background(&source).await.unwrap_err();
        assert!(matches!(err, RemovalError::MaskMismatch { .. }));
    }
}
