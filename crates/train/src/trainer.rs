//! Trainer: the fit / evaluate / test state machine shared by every variant.
//!
//! Variants only decide what one batch does (forward, loss, which optimiser
//! slots step). Everything around that is common: epoch iteration, the
//! evaluation schedule, best-model tracking, checkpoint cadence and resume.
//!
//! ```text
//! Uninitialized ─(resume)→ Resuming ─→ Ready ─fit→ TrainingEpoch ⇄ Evaluating
//!                                        │                     │
//!                                        └──────── Finished ←──┘
//! ```

use candle_nn::VarMap;

use mwp_common::{Batch, DataLoader, DataSplit, TrainingConfig};
use mwp_core::Verdict;

use crate::checkpoint::CheckpointManager;
use crate::error::{Result, TrainError};
use crate::group::{OptimizerGroup, RoleSpec};
use crate::metrics::MetricsLog;
use crate::runner::{format_elapsed, progress_bar, run_epoch, run_evaluation, BatchLoss, EvalReport, EvalSchedule};
use crate::state::{BestMetrics, Phase, TrainerState};

// ── Variant capabilities ────────────────────────────────────────────────────

/// One optimisation step on one batch.
pub trait BatchForward {
    fn train_batch(&mut self, batch: &Batch, optim: &mut OptimizerGroup) -> Result<BatchLoss>;
}

/// Inference on one batch, one verdict per example.
pub trait BatchEval {
    fn eval_batch(&self, batch: &Batch) -> Result<Vec<Verdict>>;
}

/// A complete training paradigm: model, loss, optimiser topology.
pub trait TrainerVariant: BatchForward + BatchEval {
    fn name(&self) -> &'static str;

    fn varmap(&self) -> &VarMap;

    /// Optimiser slots this variant steps, in declaration order.
    fn optimizer_roles(&self, config: &TrainingConfig) -> Vec<RoleSpec>;

    fn set_training(&mut self, training: bool);

    /// Examples per optimiser step when the variant fixes it; larger loader
    /// batches are split by the variant itself.
    fn fixed_batch_size(&self) -> Option<usize> {
        None
    }

    /// Work done once before the first epoch of a fresh run.
    fn pretrain(&mut self, _loader: &dyn DataLoader, _optim: &mut OptimizerGroup, _config: &TrainingConfig) -> Result<()> {
        Ok(())
    }
}

// ── Trainer ─────────────────────────────────────────────────────────────────

/// Owns a variant, its data, its optimiser group and the run state.
pub struct Trainer<V, L> {
    variant: V,
    loader: L,
    optim: OptimizerGroup,
    config: TrainingConfig,
    state: TrainerState,
    checkpoints: CheckpointManager,
    schedule: EvalSchedule,
    metrics: Option<MetricsLog>,
    phase: Phase,
}

impl<V: TrainerVariant, L: DataLoader> Trainer<V, L> {
    /// Build the optimiser group and, if `config.resume`, restore the last
    /// checkpoint. A missing or incomplete checkpoint is fatal on resume.
    pub fn new(config: TrainingConfig, variant: V, loader: L) -> Result<Self> {
        config.validate().map_err(|e| TrainError::Config(format!("{e:#}")))?;
        if let Some(required) = variant.fixed_batch_size() {
            if config.train_batch_size != required {
                tracing::info!(
                    variant = variant.name(),
                    configured = config.train_batch_size,
                    per_step = required,
                    "Loader batches are split into fixed-size updates"
                );
            }
        }
        let device = config.device()?;
        let optim = OptimizerGroup::new(variant.varmap(), variant.optimizer_roles(&config))?;
        let checkpoints = CheckpointManager::new(&config.checkpoint_path, &config.trained_model_path, device);
        let schedule = EvalSchedule {
            interval: config.eval_interval,
            tail: config.eval_tail,
            checkpoint_interval: config.checkpoint_interval,
        };
        let metrics = config.metrics_path.as_deref().map(MetricsLog::create).transpose()?;

        let mut trainer = Self {
            variant,
            loader,
            optim,
            config,
            state: TrainerState::default(),
            checkpoints,
            schedule,
            metrics,
            phase: Phase::Uninitialized,
        };
        if trainer.config.resume {
            trainer.resume()?;
        }
        trainer.phase = Phase::Ready;
        tracing::info!(
            variant = trainer.variant.name(),
            trainset = trainer.loader.trainset_nums(),
            roles = ?trainer.optim.roles().collect::<Vec<_>>(),
            start_epoch = trainer.state.start_epoch,
            epoch_nums = trainer.config.epoch_nums,
            "Trainer ready"
        );
        Ok(trainer)
    }

    fn resume(&mut self) -> Result<()> {
        self.phase = Phase::Resuming;
        let mut state = self
            .checkpoints
            .load_checkpoint(self.variant.varmap(), &mut self.optim)?;
        state.start_epoch = state.epoch;
        state.batch_idx = 0;
        self.state = state;
        tracing::info!(
            start_epoch = state.start_epoch,
            best_valid_value_accuracy = state.best.valid_value_accuracy,
            "Resuming"
        );
        Ok(())
    }

    // ── Accessors ───────────────────────────────────────────────────────────

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn state(&self) -> &TrainerState {
        &self.state
    }

    pub fn best(&self) -> &BestMetrics {
        &self.state.best
    }

    pub fn optimizers(&self) -> &OptimizerGroup {
        &self.optim
    }

    pub fn variant(&self) -> &V {
        &self.variant
    }

    pub fn config(&self) -> &TrainingConfig {
        &self.config
    }

    pub fn checkpoints(&self) -> &CheckpointManager {
        &self.checkpoints
    }

    fn batches_per_epoch(&self) -> usize {
        self.loader
            .trainset_nums()
            .div_ceil(self.config.train_batch_size.max(1))
    }

    // ── Fit ─────────────────────────────────────────────────────────────────

    /// Train to `epoch_nums` and log the best metrics.
    pub fn fit(&mut self) -> Result<BestMetrics> {
        self.fit_until(self.config.epoch_nums)?;
        self.phase = Phase::Finished;
        let best = self.state.best;
        tracing::info!(
            best_valid_equ_accuracy = format!("{:.3}", best.valid_equ_accuracy),
            best_valid_value_accuracy = format!("{:.3}", best.valid_value_accuracy),
            best_test_equ_accuracy = format!("{:.3}", best.test_equ_accuracy),
            best_test_value_accuracy = format!("{:.3}", best.test_value_accuracy),
            "Training finished"
        );
        Ok(best)
    }

    /// Run epochs `[state.epoch, min(stop_epoch, epoch_nums))`.
    ///
    /// Each epoch trains, advances per-epoch schedules, evaluates on the
    /// schedule (saving the best model on improvement) and checkpoints on
    /// the checkpoint cadence.
    pub fn fit_until(&mut self, stop_epoch: usize) -> Result<()> {
        let epoch_nums = self.config.epoch_nums;
        let stop = stop_epoch.min(epoch_nums);
        if self.state.epoch == 0 && stop > 0 {
            self.variant
                .pretrain(&self.loader, &mut self.optim, &self.config)?;
        }

        while self.state.epoch < stop {
            let epo = self.state.epoch;
            self.phase = Phase::TrainingEpoch;
            let pb = progress_bar(self.batches_per_epoch(), self.config.show_progress);
            let report = run_epoch(
                &mut self.variant,
                &mut self.optim,
                &mut self.state,
                self.loader.load_data(DataSplit::Train),
                &pb,
            )?;
            pb.finish_and_clear();
            self.optim.end_epoch();
            self.state.epoch = epo + 1;

            tracing::info!(
                epoch = epo,
                avg_loss = format!("{:.8}", report.avg_loss()),
                avg_secondary_loss = ?report.avg_secondary_loss(),
                lr = ?self.optim.learning_rates(),
                train_time = %format_elapsed(report.elapsed),
                "Epoch finished"
            );

            if self.schedule.should_evaluate(epo, epoch_nums) {
                let valid = self.evaluate(DataSplit::Valid)?;
                let test = self.evaluate(DataSplit::Test)?;
                if self.state.best.observe(&valid, &test) {
                    self.checkpoints.save_model(self.variant.varmap())?;
                }
                if let Some(metrics) = &mut self.metrics {
                    metrics.record(epo, &report, &valid, &test)?;
                }
            }

            if self.schedule.should_checkpoint(epo) {
                self.checkpoints
                    .save_checkpoint(self.variant.varmap(), &self.optim, &self.state)?;
            }
        }
        self.phase = Phase::Ready;
        Ok(())
    }

    // ── Evaluate / test ─────────────────────────────────────────────────────

    /// Accuracy on one split with the current weights. An empty split yields
    /// zero accuracies and `total == 0`.
    pub fn evaluate(&mut self, split: DataSplit) -> Result<EvalReport> {
        let previous = self.phase;
        self.phase = Phase::Evaluating;
        self.variant.set_training(false);
        let report = run_evaluation(&self.variant, self.loader.load_data(split))?;
        self.phase = previous;
        if report.total == 0 {
            tracing::warn!(split = %split, "Evaluation split is empty");
        }
        tracing::info!(
            split = %split,
            total = report.total,
            equ_acc = format!("{:.3}", report.equation_accuracy),
            value_acc = format!("{:.3}", report.value_accuracy),
            test_time = %format_elapsed(report.elapsed),
            "Evaluated"
        );
        Ok(report)
    }

    /// Load the best model and evaluate it on the test split.
    ///
    /// Trainer state and best metrics are left untouched.
    pub fn test(&mut self) -> Result<EvalReport> {
        self.checkpoints.load_model(self.variant.varmap())?;
        let report = self.evaluate(DataSplit::Test)?;
        tracing::info!(
            test_equ_accuracy = format!("{:.3}", report.equation_accuracy),
            test_value_accuracy = format!("{:.3}", report.value_accuracy),
            "Test finished"
        );
        Ok(report)
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
