//! ONNX Runtime implementation of the segmentation boundary.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use log::{debug, info};
use ndarray::Array4;
use ort::execution_providers::{CPUExecutionProvider, WebGPUExecutionProvider};
use ort::session::Session;
use ort::value::Value;

use crate::capability::{Backend, Device};
use crate::error::RemovalError;

use super::{ProbabilityMap, Segmenter, SegmenterLoader};

/// Loads [`OnnxSegmenter`] handles. Session construction is CPU-intensive
/// (graph optimization over a large protobuf), so it runs on a blocking
/// task.
pub struct OnnxLoader;

#[async_trait]
impl SegmenterLoader for OnnxLoader {
    async fn load(
        &self,
        weights: Bytes,
        backend: Backend,
    ) -> Result<Arc<dyn Segmenter>, RemovalError> {
        let segmenter =
            tokio::task::spawn_blocking(move || OnnxSegmenter::from_bytes(&weights, backend))
                .await
                .map_err(|e| RemovalError::ModelLoad(format!("load task panicked: {}", e)))??;
        Ok(Arc::new(segmenter))
    }
}

/// Segmentation session over ONNX Runtime.
struct OnnxSegmenter {
    session: Mutex<Session>,
    output_name: String,
}

impl OnnxSegmenter {
    fn from_bytes(weights: &[u8], backend: Backend) -> Result<Self, RemovalError> {
        info!("building inference session ({})", backend);

        let builder = Session::builder()
            .map_err(|e| RemovalError::ModelLoad(e.to_string()))?;
        let builder = match backend.device() {
            Device::WebGpu => builder.with_execution_providers([
                WebGPUExecutionProvider::default().build(),
                CPUExecutionProvider::default().build(),
            ]),
            Device::Cpu => {
                builder.with_execution_providers([CPUExecutionProvider::default().build()])
            }
        }
        .map_err(|e| RemovalError::ModelLoad(e.to_string()))?;

        let session = builder
            .commit_from_memory(weights)
            .map_err(|e| RemovalError::ModelLoad(e.to_string()))?;

        let output_name = session
            .outputs
            .first()
            .map(|output| output.name.clone())
            .ok_or_else(|| RemovalError::ModelLoad("model has no outputs".to_string()))?;
        debug!("session ready, output tensor '{}'", output_name);

        Ok(Self {
            session: Mutex::new(session),
            output_name,
        })
    }
}

impl Segmenter for OnnxSegmenter {
    fn predict(&self, input: Array4<f32>) -> Result<ProbabilityMap, RemovalError> {
        let (_, _, height, width) = input.dim();

        let value =
            Value::from_array(input).map_err(|e| RemovalError::Inference(e.to_string()))?;

        let mut session = self.session.lock().unwrap();
        let outputs = session
            .run([(&value).into()])
            .map_err(|e| RemovalError::Inference(e.to_string()))?;

        let (shape, data) = outputs[self.output_name.as_str()]
            .try_extract_tensor::<f32>()
            .map_err(|e| RemovalError::Inference(e.to_string()))?;

        // The map comes back [1, 1, H, W]; anything else means the model
        // does not honor the single-channel contract.
        let expected = width * height;
        if data.len() != expected {
            return Err(RemovalError::Inference(format!(
                "expected a {}x{} single-channel map, got {} values (shape {:?})",
                width,
                height,
                data.len(),
                shape.as_ref()
            )));
        }

        let data = data.iter().map(|p| p.clamp(0.0, 1.0)).collect();
        Ok(ProbabilityMap {
            width: width as u32,
            height: height as u32,
            data,
        })
    }
}
