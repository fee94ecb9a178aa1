use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Bound for the preview's longer side, in pixels.
const DEFAULT_PREVIEW_MAX: u32 = 450;

/// Rows per compositing stripe. Bounds the peak working set for very large
/// images; not load-bearing for correctness.
const DEFAULT_STRIPE_ROWS: u32 = 512;

/// JPEG quality for the downscaled preview.
const DEFAULT_JPEG_QUALITY: u8 = 80;

/// Tunables for the removal pipeline.
///
/// Defaults match the catalog's recommended model and the preview/stripe
/// constants the pipeline was tuned with.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RemovalConfig {
    /// Catalog name of the segmentation model to use.
    pub model: String,
    /// Longer side of the preview artifact is scaled down to at most this.
    pub preview_max: u32,
    /// Stripe height for the compositing pass, in rows.
    pub stripe_rows: u32,
    /// Quality used when encoding the preview.
    pub jpeg_quality: u8,
    /// URL substrings identifying model-artifact requests. Requests that
    /// match none of these bypass the fetch cache entirely.
    pub artifact_hosts: Vec<String>,
    /// Directory the result artifacts are written into. Created on demand;
    /// files placed here are owned by the caller and never deleted.
    pub artifacts_dir: PathBuf,
}

impl Default for RemovalConfig {
    fn default() -> Self {
        Self {
            model: "rmbg-1.4".to_string(),
            preview_max: DEFAULT_PREVIEW_MAX,
            stripe_rows: DEFAULT_STRIPE_ROWS,
            jpeg_quality: DEFAULT_JPEG_QUALITY,
            artifact_hosts: vec!["huggingface.co".to_string()],
            artifacts_dir: std::env::temp_dir().join("cutout"),
        }
    }
}
