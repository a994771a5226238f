//! Error type shared by the model, data and training layers.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SurvivalError {
    #[error("model type {0} not implemented")]
    UnsupportedModel(String),

    #[error("optimizer {0} not implemented")]
    UnsupportedOptimizer(String),

    #[error("loss {0} not implemented")]
    UnsupportedLoss(String),

    #[error("regularization {0} not implemented")]
    UnsupportedRegularization(String),

    #[error("reduction should be 'mean' or 'sum', got {0}")]
    InvalidReduction(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("shape mismatch in {context}: {detail}")]
    Shape { context: &'static str, detail: String },

    #[error("invalid data: {0}")]
    Data(String),

    #[error("checkpoint error: {0}")]
    Checkpoint(String),

    #[error("settings error: {0}")]
    Settings(#[from] config::ConfigError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, SurvivalError>;
