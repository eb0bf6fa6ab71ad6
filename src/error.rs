//! Error types for meta-training operations

use thiserror::Error;

#[derive(Error, Debug)]
pub enum MetaError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("All shared-parameter gradients are absent for task '{task}': the batch is disconnected from the shared parameters")]
    DisconnectedGraph { task: String },

    #[error("There are existing {phase} checkpoints in {dir} which would be overwritten. Enable model loading to resume from them, or delete them.")]
    ExistingCheckpoints { dir: String, phase: String },

    #[error("No consistent {phase} checkpoint found in {dir}: {reason}")]
    MissingCheckpoint {
        dir: String,
        phase: String,
        reason: String,
    },

    #[error("Shape mismatch for '{name}': expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        name: String,
        expected: Vec<usize>,
        got: Vec<usize>,
    },

    #[error("Unknown task: {0}")]
    UnknownTask(String),

    #[error("Candle error: {0}")]
    CandleError(#[from] candle_core::Error),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl From<serde_json::Error> for MetaError {
    fn from(e: serde_json::Error) -> Self {
        MetaError::SerializationError(e.to_string())
    }
}
