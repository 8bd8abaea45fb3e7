use std::path::PathBuf;

use thiserror::Error;

/// Errors surfaced by the loader nodes.
///
/// Failures from the hub client, file parsing and device transfers propagate
/// unchanged; nothing here is retried or rolled back.
#[derive(Debug, Error)]
pub enum LoaderError {
    #[error(transparent)]
    Candle(#[from] candle_core::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("failed to parse JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("hub request for '{repo_id}' failed: {source}")]
    Hub {
        repo_id: String,
        #[source]
        source: hf_hub::api::tokio::ApiError,
    },

    #[error("failed to start the download runtime: {0}")]
    Runtime(String),

    #[error("invalid file pattern '{pattern}': {reason}")]
    Pattern { pattern: String, reason: String },

    #[error(
        "CogVideo nodes require pipeline backend >= {required} (found {found}); \
         upgrade the backend before loading models"
    )]
    IncompatibleBackend { found: String, required: String },

    #[error("cannot determine model size (2b/5b) from '{0}'")]
    UnknownModelSize(String),

    #[error("unknown node type '{0}'")]
    UnknownNode(String),

    #[error("invalid input '{field}': {reason}")]
    InvalidInput { field: String, reason: String },

    #[error("block index {index} is out of range for a transformer with {num_blocks} blocks")]
    BlockIndexOutOfRange { index: usize, num_blocks: usize },

    #[error("no weights found at {0}")]
    MissingWeights(PathBuf),

    #[error("tensor '{0}' not found")]
    MissingTensor(String),

    #[error("invalid LoRA {path}: {reason}")]
    InvalidLora { path: PathBuf, reason: String },

    #[error("invalid Tora checkpoint: {0}")]
    InvalidTora(String),
}

pub type Result<T> = std::result::Result<T, LoaderError>;

impl LoaderError {
    pub(crate) fn invalid_input(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidInput {
            field: field.into(),
            reason: reason.into(),
        }
    }
}
