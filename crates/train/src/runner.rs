//! Epoch and evaluation runners.
//!
//! Both are free functions over the capability traits so the trainer can pass
//! its state in explicitly instead of the runners reaching into it.

use std::time::{Duration, Instant};

use candle_core::backprop::GradStore;
use indicatif::{ProgressBar, ProgressStyle};

use mwp_common::Batch;
use mwp_core::Verdict;

use crate::error::Result;
use crate::group::OptimizerGroup;
use crate::loss::LossAdapter;
use crate::state::TrainerState;
use crate::trainer::{BatchEval, TrainerVariant};

// ── Reports ─────────────────────────────────────────────────────────────────

/// Losses of one training batch.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct BatchLoss {
    pub primary: f64,
    /// Second objective of two-player variants (discriminator loss).
    pub secondary: Option<f64>,
}

impl BatchLoss {
    pub fn single(loss: f64) -> Self {
        Self {
            primary: loss,
            secondary: None,
        }
    }
}

/// Summary of one training pass.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct EpochReport {
    pub loss_total: f64,
    pub secondary_loss_total: Option<f64>,
    pub batches: usize,
    pub elapsed: Duration,
}

impl EpochReport {
    fn add(&mut self, loss: &BatchLoss) {
        self.loss_total += loss.primary;
        if let Some(s) = loss.secondary {
            *self.secondary_loss_total.get_or_insert(0.0) += s;
        }
        self.batches += 1;
    }

    pub fn avg_loss(&self) -> f64 {
        self.loss_total / self.batches.max(1) as f64
    }

    pub fn avg_secondary_loss(&self) -> Option<f64> {
        self.secondary_loss_total.map(|t| t / self.batches.max(1) as f64)
    }
}

/// Accuracy of one evaluation pass.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EvalReport {
    pub equation_accuracy: f64,
    pub value_accuracy: f64,
    /// Examples evaluated; 0 marks an empty split.
    pub total: usize,
    pub elapsed: Duration,
}

// ── Accuracy ────────────────────────────────────────────────────────────────

/// Equation/value/total counters, reset every evaluation pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AccuracyAccumulator {
    pub equation_correct: usize,
    pub value_correct: usize,
    pub total: usize,
}

impl AccuracyAccumulator {
    pub fn record(&mut self, verdict: &Verdict) {
        self.equation_correct += usize::from(verdict.equation_correct);
        self.value_correct += usize::from(verdict.value_correct || verdict.equation_correct);
        self.total += 1;
    }

    pub fn equation_accuracy(&self) -> f64 {
        ratio(self.equation_correct, self.total)
    }

    pub fn value_accuracy(&self) -> f64 {
        ratio(self.value_correct, self.total)
    }
}

/// `count / total`, or 0 for an empty split.
fn ratio(count: usize, total: usize) -> f64 {
    if total == 0 {
        0.0
    } else {
        count as f64 / total as f64
    }
}

// ── Schedule ────────────────────────────────────────────────────────────────

/// When `fit` evaluates and checkpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EvalSchedule {
    /// Evaluate on epochs divisible by this.
    pub interval: usize,
    /// Always evaluate during the last `tail` epochs.
    pub tail: usize,
    /// Write a full checkpoint on epochs divisible by this.
    pub checkpoint_interval: usize,
}

impl Default for EvalSchedule {
    fn default() -> Self {
        Self {
            interval: 2,
            tail: 5,
            checkpoint_interval: 5,
        }
    }
}

impl EvalSchedule {
    pub fn should_evaluate(&self, epoch: usize, epoch_nums: usize) -> bool {
        epoch % self.interval.max(1) == 0 || epoch + self.tail > epoch_nums
    }

    pub fn should_checkpoint(&self, epoch: usize) -> bool {
        epoch % self.checkpoint_interval.max(1) == 0
    }
}

// ── Epoch runner ────────────────────────────────────────────────────────────

/// One training pass over `batches`.
///
/// Leaves the model in training mode. A failing batch aborts the pass; the
/// error carries the epoch and batch position.
pub fn run_epoch<V: TrainerVariant + ?Sized>(
    variant: &mut V,
    optim: &mut OptimizerGroup,
    state: &mut TrainerState,
    batches: impl Iterator<Item = Batch>,
    progress: &ProgressBar,
) -> Result<EpochReport> {
    let start = Instant::now();
    variant.set_training(true);
    let mut report = EpochReport::default();
    state.batch_idx = 0;
    for batch in batches {
        let loss = variant
            .train_batch(&batch, optim)
            .map_err(|e| e.at(state.epoch, state.batch_idx))?;
        report.add(&loss);
        state.batch_idx += 1;
        progress.inc(1);
    }
    report.elapsed = start.elapsed();
    Ok(report)
}

/// forward → accumulate → backward → step → reset for single-loss variants.
///
/// Gradients live in the `GradStore` returned by this backward pass only,
/// which is what zeroes them between batches.
pub fn supervised_update<L: LossAdapter>(
    loss: &mut L,
    optim: &mut OptimizerGroup,
    forward: impl FnOnce(&mut L) -> Result<()>,
) -> Result<f64> {
    loss.reset();
    forward(loss)?;
    let value = loss.value()?;
    let grads: GradStore = loss.backward()?;
    optim.step(&grads)?;
    loss.reset();
    Ok(value)
}

/// [`supervised_update`] that steps only the slot named `role`.
pub fn role_update<L: LossAdapter>(
    loss: &mut L,
    optim: &mut OptimizerGroup,
    role: &str,
    forward: impl FnOnce(&mut L) -> Result<()>,
) -> Result<f64> {
    loss.reset();
    forward(loss)?;
    let value = loss.value()?;
    let grads = loss.backward()?;
    optim.step_role(role, &grads)?;
    loss.reset();
    Ok(value)
}

// ── Evaluation runner ───────────────────────────────────────────────────────

/// Inference over `batches`, aggregating per-example verdicts.
pub fn run_evaluation<V: BatchEval + ?Sized>(
    variant: &V,
    batches: impl Iterator<Item = Batch>,
) -> Result<EvalReport> {
    let start = Instant::now();
    let mut acc = AccuracyAccumulator::default();
    for batch in batches {
        for verdict in variant.eval_batch(&batch)? {
            acc.record(&verdict);
        }
    }
    Ok(EvalReport {
        equation_accuracy: acc.equation_accuracy(),
        value_accuracy: acc.value_accuracy(),
        total: acc.total,
        elapsed: start.elapsed(),
    })
}

// ── Formatting ──────────────────────────────────────────────────────────────

/// `1h02m03s` style wall-clock time.
pub fn format_elapsed(d: Duration) -> String {
    let secs = d.as_secs();
    let (h, m, s) = (secs / 3600, (secs % 3600) / 60, secs % 60);
    if h > 0 {
        format!("{h}h{m:02}m{s:02}s")
    } else if m > 0 {
        format!("{m}m{s:02}s")
    } else {
        format!("{:.2}s", d.as_secs_f64())
    }
}

/// Batch progress bar, hidden unless requested.
pub fn progress_bar(batches: usize, visible: bool) -> ProgressBar {
    if !visible {
        return ProgressBar::hidden();
    }
    let pb = ProgressBar::new(batches as u64);
    if let Ok(style) =
        ProgressStyle::default_bar().template("  {bar:40} {pos}/{len} [{elapsed_precise}] {msg}")
    {
        pb.set_style(style);
    }
    pb
}

// ── Tests ───────────────────────────────────────────────────────────────────
