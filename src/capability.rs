//! Runtime detection of acceleration hardware and supported precision.

use std::sync::Arc;

use async_trait::async_trait;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use strum::Display;
use tokio::sync::Mutex;

/// Engine the inference session runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Device {
    WebGpu,
    Cpu,
}

/// Numeric precision of the model weights.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Precision {
    Fp16,
    Fp32,
}

/// Backend selection: engine plus precision, as a closed set.
///
/// Preference order is `WebGpuFp16 > WebGpuFp32 > CpuFp32`; the universal
/// CPU fallback never pairs with half precision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum Backend {
    WebGpuFp16,
    WebGpuFp32,
    CpuFp32,
}

impl Backend {
    pub fn device(&self) -> Device {
        match self {
            Backend::WebGpuFp16 | Backend::WebGpuFp32 => Device::WebGpu,
            Backend::CpuFp32 => Device::Cpu,
        }
    }

    pub fn precision(&self) -> Precision {
        match self {
            Backend::WebGpuFp16 => Precision::Fp16,
            Backend::WebGpuFp32 | Backend::CpuFp32 => Precision::Fp32,
        }
    }
}

/// Capability detection seam. The session manager only needs `probe`;
/// tests substitute a fixed answer.
#[async_trait]
pub trait Capabilities: Send + Sync {
    /// Detect the best available backend. Never fails: degrades to
    /// [`Backend::CpuFp32`] when no accelerated adapter can be negotiated.
    async fn probe(&self) -> Backend;
}

/// Probes the GPU through wgpu adapter negotiation.
///
/// The negotiated adapter handle is kept so a later device request does
/// not repeat the negotiation.
pub struct CapabilityProbe {
    adapter: Mutex<Option<Arc<wgpu::Adapter>>>,
}

impl Default for CapabilityProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl CapabilityProbe {
    pub fn new() -> Self {
        Self {
            adapter: Mutex::new(None),
        }
    }

    /// Negotiated adapter, if any. Cached after the first call.
    pub async fn adapter(&self) -> Option<Arc<wgpu::Adapter>> {
        let mut slot = self.adapter.lock().await;
        if slot.is_none() {
            *slot = Self::negotiate().await.map(Arc::new);
        }
        slot.clone()
    }

    async fn negotiate() -> Option<wgpu::Adapter> {
        let instance = wgpu::Instance::new(wgpu::InstanceDescriptor::default());
        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                ..Default::default()
            })
            .await;
        match &adapter {
            Some(adapter) => debug!("negotiated gpu adapter: {}", adapter.get_info().name),
            None => debug!("no gpu adapter available"),
        }
        adapter
    }
}

#[async_trait]
impl Capabilities for CapabilityProbe {
    async fn probe(&self) -> Backend {
        let backend = match self.adapter().await {
            Some(adapter) => {
                if adapter.features().contains(wgpu::Features::SHADER_F16) {
                    Backend::WebGpuFp16
                } else {
                    Backend::WebGpuFp32
                }
            }
            None => Backend::CpuFp32,
        };
        info!("capability probe selected {}", backend);
        backend
    }
}
