pub mod config;
pub mod dataset;
pub mod export;
pub mod model;
pub mod session;
pub mod train;

pub use config::{ModelType, TrainConfig};
pub use dataset::{normalize_phonemes, Sample};
pub use train::{EpochMetrics, EpochSummary, TrainOutcome};

/// Error taxonomy for the training pipeline.
///
/// `Data` and `Config` are user-visible and abort the current run without
/// taking the process down; candle errors propagate unwrapped since the
/// core cannot recover from them.
#[derive(thiserror::Error, Debug)]
pub enum PipelineError {
    #[error("data error: {0}")]
    Data(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("session error: {0}")]
    Session(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("model error: {0}")]
    Candle(#[from] candle_core::Error),
}

pub type Result<T> = std::result::Result<T, PipelineError>;
