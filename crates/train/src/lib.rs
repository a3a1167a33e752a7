//! # mwp-train — The Training Engine
//!
//! Fit / evaluate / test orchestration for math-word-problem solvers:
//!
//! * **[`Trainer`]** — owns a variant, its data loader, the optimiser group
//!   and run state. [`Trainer::fit`] runs epochs, evaluates on schedule,
//!   keeps the best model and writes resumable checkpoints.
//! * **[`variants`]** — what one batch does: seq2seq, multi-equation,
//!   tree decoder, transformer, SeqGAN, source-augmented.
//! * **[`OptimizerGroup`]** — named Adam + LR-schedule slots stepped, saved
//!   and restored as a unit.
//! * **[`CheckpointManager`]** — strict, atomic safetensors checkpoints.
//! * **[`LossAdapter`]** — accumulate / backward / reset loss wrappers.

pub mod checkpoint;
pub mod error;
pub mod group;
pub mod loss;
pub mod metrics;
pub mod optim;
pub mod runner;
pub mod scheduler;
pub mod state;
pub mod trainer;
pub mod variants;

pub use checkpoint::CheckpointManager;
pub use error::{Result, TrainError};
pub use group::{OptimizerGroup, RoleSpec};
pub use loss::{BinaryCrossEntropyLoss, LossAdapter, MaskedCrossEntropyLoss, NllLoss};
pub use metrics::MetricsLog;
pub use optim::{Adam, AdamConfig};
pub use runner::{AccuracyAccumulator, BatchLoss, EpochReport, EvalReport, EvalSchedule};
pub use scheduler::{LrDecay, LrScheduler, ScheduleCadence};
pub use state::{BestMetrics, Phase, TrainerState};
pub use trainer::{BatchEval, BatchForward, Trainer, TrainerVariant};
pub use variants::{EquationMode, GanVariant, Seq2SeqVariant, SourceVariant, TransformerVariant, TreeVariant};
