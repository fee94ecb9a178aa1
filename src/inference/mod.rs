//! Boundary to the segmentation collaborator.
//!
//! The collaborator is opaque: weights in, probability map out. Everything
//! model-specific (graph shape, output naming, execution providers) stays
//! behind [`Segmenter`]/[`SegmenterLoader`]; the rest of the crate only
//! sees tensors and the preprocessing companion parsed from the model's
//! processor configuration.

mod onnx;

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use image::imageops::FilterType;
use image::RgbaImage;
use ndarray::Array4;
use serde::Deserialize;

use crate::capability::Backend;
use crate::error::RemovalError;

pub use onnx::OnnxLoader;

/// Single-channel probability map at inference resolution, values in [0, 1].
pub struct ProbabilityMap {
    pub width: u32,
    pub height: u32,
    pub data: Vec<f32>,
}

/// A ready inference handle: normalized NCHW tensor in, probability map out.
pub trait Segmenter: Send + Sync {
    fn predict(&self, input: Array4<f32>) -> Result<ProbabilityMap, RemovalError>;
}

/// Builds a [`Segmenter`] from fetched weight bytes for a chosen backend.
#[async_trait]
pub trait SegmenterLoader: Send + Sync {
    async fn load(
        &self,
        weights: Bytes,
        backend: Backend,
    ) -> Result<Arc<dyn Segmenter>, RemovalError>;
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum ProcessorSize {
    Uniform(u32),
    Explicit { width: u32, height: u32 },
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
struct ProcessorConfigFile {
    image_mean: [f32; 3],
    image_std: [f32; 3],
    size: ProcessorSize,
}

impl Default for ProcessorConfigFile {
    fn default() -> Self {
        Self {
            image_mean: [0.5, 0.5, 0.5],
            image_std: [1.0, 1.0, 1.0],
            size: ProcessorSize::Uniform(1024),
        }
    }
}

/// Preprocessing companion for a loaded model: resizes a decoded source to
/// the inference resolution and normalizes it into the NCHW layout the
/// collaborator expects.
#[derive(Debug, Clone)]
pub struct Processor {
    mean: [f32; 3],
    std: [f32; 3],
    width: u32,
    height: u32,
}

impl Processor {
    /// Parse the model's processor configuration (JSON). Missing fields
    /// fall back to the conventional defaults.
    pub fn from_config_bytes(bytes: &[u8]) -> Result<Self, RemovalError> {
        let file: ProcessorConfigFile = serde_json::from_slice(bytes)
            .map_err(|e| RemovalError::ModelLoad(format!("bad processor config: {}", e)))?;
        let (width, height) = match file.size {
            ProcessorSize::Uniform(side) => (side, side),
            ProcessorSize::Explicit { width, height } => (width, height),
        };
        Ok(Self {
            mean: file.image_mean,
            std: file.image_std,
            width,
            height,
        })
    }

    pub fn inference_size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    /// Resize and normalize a decoded source into a [1, 3, H, W] tensor.
    pub fn prepare(&self, image: &RgbaImage) -> Array4<f32> {
        let resized = image::imageops::resize(image, self.width, self.height, FilterType::Triangle);
        let mut tensor =
            Array4::<f32>::zeros((1, 3, self.height as usize, self.width as usize));
        for (x, y, pixel) in resized.enumerate_pixels() {
            for channel in 0..3 {
                tensor[[0, channel, y as usize, x as usize]] =
                    (pixel[channel] as f32 / 255.0 - self.mean[channel]) / self.std[channel];
            }
        }
        tensor
    }
}
