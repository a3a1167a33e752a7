//! Trainer variants: what one batch does for each training paradigm.
//!
//! | variant              | model trait        | optimiser slots                  | schedule          |
//! |----------------------|--------------------|----------------------------------|-------------------|
//! | [`Seq2SeqVariant`]   | `Seq2SeqModel`     | `model`                          | none              |
//! | [`TreeVariant`]      | `TreeModel`        | five tree submodules             | halve per epochs  |
//! | [`TransformerVariant`] | `TransformerModel` | `model`                        | warmup per step   |
//! | [`GanVariant`]       | `GanModel`         | `generator`, `discriminator`     | none              |
//! | [`SourceVariant`]    | `SourceModel`      | `model`                          | warmup per step   |

mod gan;
mod seq2seq;
mod source;
mod transformer;
mod tree;

pub use gan::GanVariant;
pub use seq2seq::{EquationMode, Seq2SeqVariant};
pub use source::SourceVariant;
pub use transformer::TransformerVariant;
pub use tree::TreeVariant;

use mwp_common::{Batch, DatasetMeta, TrainingConfig, VocabBridge};

use crate::error::Result;
use crate::optim::AdamConfig;

/// Adam settings shared by every slot of a variant.
pub(crate) fn adam_config(config: &TrainingConfig) -> AdamConfig {
    AdamConfig {
        lr: config.learning_rate,
        weight_decay: config.weight_decay,
        ..Default::default()
    }
}

/// Turns batch equations into output-vocabulary rows.
///
/// With a shared vocabulary the equations arrive as input-vocabulary ids and
/// are mapped through a precomputed [`VocabBridge`]; otherwise they pass
/// through unchanged.
#[derive(Debug, Clone)]
pub(crate) struct TargetIndexer {
    bridge: Option<VocabBridge>,
}

impl TargetIndexer {
    pub(crate) fn new(meta: &DatasetMeta, share_vocab: bool) -> Self {
        Self {
            bridge: share_vocab.then(|| VocabBridge::new(meta)),
        }
    }

    pub(crate) fn rows(&self, batch: &Batch) -> Result<Vec<Vec<u32>>> {
        match &self.bridge {
            Some(bridge) => Ok(bridge.reindex_batch(&batch.equation)?),
            None => Ok(batch.equation.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TrainError;
    use mwp_common::{Example, VocabError};

    fn meta() -> DatasetMeta {
        let s = |v: &[&str]| v.iter().map(|x| x.to_string()).collect::<Vec<_>>();
        DatasetMeta::new(
            s(&["<PAD>", "x", "y", "+", "z", "w", "-", "n"]),
            s(&["<PAD>", "+", "<UNK>", "-", "x", "w", "q", "y", "z", "v"]),
            4,
            vec![],
        )
    }

    fn batch(equation: &[u32]) -> Batch {
        Batch::from_examples(
            &[Example {
                question: vec![1],
                equation: equation.to_vec(),
                ..Default::default()
            }],
            0,
            0,
        )
    }

    #[test]
    fn shared_vocab_targets_are_reindexed() {
        let idx = TargetIndexer::new(&meta(), true);
        // "+" → 1, "w" → 5, "z" → 8
        assert_eq!(idx.rows(&batch(&[3, 5, 4])).unwrap(), vec![vec![1, 5, 8]]);
    }

    #[test]
    fn separate_vocab_passes_through() {
        let idx = TargetIndexer::new(&meta(), false);
        assert_eq!(idx.rows(&batch(&[3, 7, 2])).unwrap(), vec![vec![3, 7, 2]]);
    }

    #[test]
    fn missing_output_word_is_fatal() {
        let idx = TargetIndexer::new(&meta(), true);
        let err = idx.rows(&batch(&[7])).unwrap_err();
        assert!(matches!(
            err,
            TrainError::Vocab(VocabError::UnknownToken { index: 7, .. })
        ));
    }
}
