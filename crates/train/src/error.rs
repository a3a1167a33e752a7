//! Error taxonomy of the training engine.
//!
//! Every variant here aborts the run: the trainer never swallows them, so the
//! last successfully written checkpoint stays the recovery point. Recoverable
//! conditions (an empty evaluation split) are not errors at all.

use std::path::PathBuf;

use mwp_common::VocabError;

pub type Result<T> = std::result::Result<T, TrainError>;

#[derive(Debug, thiserror::Error)]
pub enum TrainError {
    /// A checkpoint lacks a key the current model/optimiser layout expects.
    #[error("checkpoint {path} is missing key `{key}`")]
    MissingCheckpointKey { path: PathBuf, key: String },

    /// Shared-vocabulary re-indexing hit a word the output vocabulary lacks.
    #[error(transparent)]
    Vocab(#[from] VocabError),

    /// Loss became NaN or infinite; stepping would corrupt optimiser state.
    #[error("non-finite loss {value} at epoch {epoch}, batch {batch}")]
    NonFiniteLoss { value: f64, epoch: usize, batch: usize },

    /// A batch does not have the shape the variant requires.
    #[error("invalid batch: {0}")]
    InvalidBatch(String),

    /// Optimiser roles overlap, are empty, or are unknown.
    #[error("optimizer group: {0}")]
    OptimizerGroup(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Candle(#[from] candle_core::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl TrainError {
    /// Attach the epoch/batch position to a loss error raised without it.
    pub(crate) fn at(self, epoch: usize, batch: usize) -> Self {
        match self {
            Self::NonFiniteLoss { value, .. } => Self::NonFiniteLoss { value, epoch, batch },
            other => other,
        }
    }
}
