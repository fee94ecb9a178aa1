use serde::{Deserialize, Serialize};

use crate::capability::Precision;

/// Weight artifact for one numeric precision.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelWeights {
    pub precision: Precision,
    /// Download URL
    pub url: String,
    /// SHA-256 checksum (hex string), verified after download when present
    pub sha256: Option<String>,
}

/// Static information about a segmentation model available for download.
/// This is hardcoded and never changes at runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelCatalogEntry {
    /// Unique identifier, no spaces (e.g., "rmbg-1.4")
    pub name: String,
    /// Human-readable name (e.g., "RMBG 1.4")
    pub display_name: String,
    /// Description of the model
    pub description: String,
    /// Approximate size of the fp32 weights in bytes
    pub size_bytes: u64,
    /// URL of the companion preprocessing configuration
    pub processor_url: String,
    /// Weight files by precision
    pub weights: Vec<ModelWeights>,
}

impl ModelCatalogEntry {
    /// Weight artifact for the requested precision, if the model ships one.
    pub fn weights_for(&self, precision: Precision) -> Option<&ModelWeights> {
        self.weights.iter().find(|w| w.precision == precision)
    }
}

/// Look up a model by its catalog name.
pub fn find_model(name: &str) -> Option<ModelCatalogEntry> {
    get_model_catalog().into_iter().find(|e| e.name == name)
}

/// Hardcoded catalog of available segmentation models.
/// All weights are ONNX exports hosted on Hugging Face.
pub fn get_model_catalog() -> Vec<ModelCatalogEntry> {
    vec![
        ModelCatalogEntry {
            name: "rmbg-1.4".into(),
            display_name: "RMBG 1.4".into(),
            description: "General-purpose background removal model. Recommended default."
                .into(),
            size_bytes: 176_173_887, // ~168 MB fp32
            processor_url:
                "https://huggingface.co/briaai/RMBG-1.4/resolve/main/preprocessor_config.json"
                    .into(),
            weights: vec![
                ModelWeights {
                    precision: Precision::Fp32,
                    url: "https://huggingface.co/briaai/RMBG-1.4/resolve/main/onnx/model.onnx"
                        .into(),
                    sha256: None,
                },
                ModelWeights {
                    precision: Precision::Fp16,
                    url:
                        "https://huggingface.co/briaai/RMBG-1.4/resolve/main/onnx/model_fp16.onnx"
                            .into(),
                    sha256: None,
                },
            ],
        },
        ModelCatalogEntry {
            name: "modnet".into(),
            display_name: "MODNet".into(),
            description: "Portrait matting model. Smaller and faster; tuned for people."
                .into(),
            size_bytes: 25_888_438, // ~25 MB fp32
            processor_url:
                "https://huggingface.co/Xenova/modnet/resolve/main/preprocessor_config.json"
                    .into(),
            weights: vec![
                ModelWeights {
                    precision: Precision::Fp32,
                    url: "https://huggingface.co/Xenova/modnet/resolve/main/onnx/model.onnx"
                        .into(),
                    sha256: None,
                },
                ModelWeights {
                    precision: Precision::Fp16,
                    url: "https://huggingface.co/Xenova/modnet/resolve/main/onnx/model_fp16.onnx"
                        .into(),
                    sha256: None,
                },
            ],
        },
    ]
}
