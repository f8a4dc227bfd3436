use std::path::PathBuf;

/// Errors produced while building layers, loading data or training.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An error from the tensor backend.
    #[error(transparent)]
    Candle(#[from] candle_core::Error),
    /// An I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// A run config could not be parsed.
    #[error("Config error: {0}")]
    Config(#[from] serde_json::Error),
    /// A layer was configured with values it cannot be built from.
    #[error("Invalid {layer} configuration: {reason}")]
    InvalidLayer {
        /// The layer being built.
        layer: &'static str,
        /// What is wrong with the configuration.
        reason: String,
    },
    /// A dataset file exists but does not have the expected format.
    #[error("{} is not a valid {format} file: {reason}", path.display())]
    InvalidDataset {
        /// The offending file.
        path: PathBuf,
        /// The expected file format.
        format: &'static str,
        /// What is wrong with the file.
        reason: String,
    },
    /// An in-memory split whose images and labels do not line up.
    #[error("Invalid dataset split: {0}")]
    InvalidSplit(String),
    /// A dataset file is missing.
    #[error("Dataset file not found: {}", .0.display())]
    MissingFile(PathBuf),
    /// Training produced a NaN or infinite loss.
    #[error("Loss is not finite at epoch {epoch}, batch {batch}")]
    NonFiniteLoss {
        /// The epoch, starting at 1.
        epoch: usize,
        /// The batch within the epoch, starting at 0.
        batch: usize,
    },
    /// A saved tensor file is missing an expected entry.
    #[error("Missing tensor {0} in saved file")]
    MissingTensor(String),
}

impl Error {
    pub(crate) fn invalid_layer(layer: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidLayer {
            layer,
            reason: reason.into(),
        }
    }
}

/// A result with the crate's [`Error`] type.
pub type Result<T> = std::result::Result<T, Error>;
