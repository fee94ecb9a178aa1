/// Errors surfaced by the background-removal pipeline.
///
/// Variants carry plain messages (third-party errors are stringified at the
/// boundary) and the enum is `Clone` so a failed load result can be shared
/// between every caller of the same memoized session future.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RemovalError {
    #[error("invalid input: {0}")]
    Input(String),
    #[error("transfer failed: {0}")]
    Transfer(String),
    #[error("mask length mismatch: expected {expected} bytes, got {actual}")]
    MaskMismatch { expected: usize, actual: usize },
    #[error("compositing failed: {0}")]
    Compositing(String),
    #[error("failed to load model: {0}")]
    ModelLoad(String),
    #[error("inference failed: {0}")]
    Inference(String),
}
