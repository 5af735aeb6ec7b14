use thiserror::Error;

pub type Result<T, E = VigilError> = std::result::Result<T, E>;

/// Unified error type covering common failure scenarios across subsystems.
#[derive(Debug, Error)]
pub enum VigilError {
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("capture error: {0}")]
    Capture(String),
    #[error("vision error: {0}")]
    Vision(String),
    #[error("stream error: {0}")]
    Stream(String),
    #[error("operational error: {0}")]
    Ops(String),
    #[error("orchestrator error: {0}")]
    Orchestrator(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
