//! Trainer progress counters and best-so-far metrics.

use serde::{Deserialize, Serialize};

use crate::runner::EvalReport;

/// Lifecycle of a trainer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Uninitialized,
    Resuming,
    Ready,
    TrainingEpoch,
    Evaluating,
    Finished,
}

/// Best validation/test accuracies seen so far.
///
/// The four fields move together: they are replaced only when validation
/// value accuracy reaches or beats the recorded best, so each field is
/// non-decreasing in that key.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct BestMetrics {
    pub valid_equ_accuracy: f64,
    pub valid_value_accuracy: f64,
    pub test_equ_accuracy: f64,
    pub test_value_accuracy: f64,
}

impl BestMetrics {
    /// Record a validation/test pair; returns `true` when it became the best.
    pub fn observe(&mut self, valid: &EvalReport, test: &EvalReport) -> bool {
        if valid.value_accuracy < self.valid_value_accuracy {
            return false;
        }
        *self = Self {
            valid_equ_accuracy: valid.equation_accuracy,
            valid_value_accuracy: valid.value_accuracy,
            test_equ_accuracy: test.equation_accuracy,
            test_value_accuracy: test.value_accuracy,
        };
        true
    }
}

/// Mutable progress of one run, persisted in every checkpoint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainerState {
    /// Epoch this run started from (non-zero after a resume).
    pub start_epoch: usize,
    /// Next epoch to run; equals the number of completed epochs.
    pub epoch: usize,
    /// Batch index within the current epoch.
    pub batch_idx: usize,
    pub best: BestMetrics,
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn report(equ: f64, value: f64) -> EvalReport {
        EvalReport {
            equation_accuracy: equ,
            value_accuracy: value,
            total: 10,
            elapsed: Duration::ZERO,
        }
    }

    #[test]
    fn ties_count_as_improvement() {
        let mut best = BestMetrics::default();
        assert!(best.observe(&report(0.0, 0.0), &report(0.1, 0.2)));
        assert_eq!(best.test_value_accuracy, 0.2);
        assert!(best.observe(&report(0.1, 0.0), &report(0.3, 0.4)));
        assert_eq!(best.valid_equ_accuracy, 0.1);
    }

    #[test]
    fn worse_validation_keeps_all_fields() {
        let mut best = BestMetrics::default();
        best.observe(&report(0.4, 0.5), &report(0.3, 0.35));
        let before = best;
        assert!(!best.observe(&report(0.9, 0.45), &report(0.9, 0.9)));
        assert_eq!(best, before);
    }
}
