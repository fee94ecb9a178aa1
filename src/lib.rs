//! Client-side background removal.
//!
//! Everything runs in-process: the segmentation model is downloaded once
//! (cached in memory, coalesced across concurrent requests), executed
//! through ONNX Runtime on the best available backend, and the resulting
//! alpha mask is merged into the source image on a worker thread with a
//! synchronous fallback. Acquisition progress is observable through a
//! sessioned subscription stream.
//!
//! # Example
//!
//! ```no_run
//! use cutout::{BackgroundRemover, RemovalConfig};
//!
//! # async fn run() -> Result<(), cutout::RemovalError> {
//! let remover = BackgroundRemover::new(RemovalConfig::default())?;
//!
//! let subscription = remover.subscribe(|state| {
//!     println!("{:?}: {}%", state.phase, state.progress);
//! });
//!
//! let result = remover.remove_background("photo.jpg").await?;
//! println!("wrote {}", result.full_path.display());
//! subscription.unsubscribe();
//! # Ok(())
//! # }
//! ```

mod capability;
mod compositing;
mod config;
mod error;
mod fetch;
mod inference;
mod models;
mod progress;
mod remover;

pub use capability::{Backend, Capabilities, CapabilityProbe, Device, Precision};
pub use compositing::{CompositeResult, Compositor};
pub use config::RemovalConfig;
pub use error::RemovalError;
pub use fetch::{ArtifactResponse, ArtifactTransport, FetchCache, HttpTransport};
pub use inference::{OnnxLoader, ProbabilityMap, Processor, Segmenter, SegmenterLoader};
pub use models::{find_model, get_model_catalog, ModelCatalogEntry, ModelWeights};
pub use progress::{ProgressChannel, ProgressPhase, ProgressState, Subscription};
pub use remover::{BackgroundRemover, RemovalResult};
