//! Training configuration for the equation trainers.
//!
//! Serialised as JSON. Every field has a sensible default so a minimal `{}`
//! JSON produces a working (if short) run. The config is read-only once a
//! trainer has been constructed.

use std::path::{Path, PathBuf};

use anyhow::Context;
use candle_core::Device;
use serde::{Deserialize, Serialize};

/// Options recognised by every trainer variant.
///
/// Backwards-compatible: missing fields fall back to their
/// `#[serde(default)]` values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingConfig {
    // ── Optimisation ────────────────────────────────────────────────────────
    /// Base learning rate of every optimiser.
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f64,
    /// Examples per training batch.
    #[serde(default = "default_train_batch_size")]
    pub train_batch_size: usize,
    /// Total number of training epochs.
    #[serde(default = "default_epoch_nums")]
    pub epoch_nums: usize,
    /// L2 penalty folded into every Adam gradient.
    #[serde(default)]
    pub weight_decay: f64,
    /// Epochs between step-decay halvings (tree decoder).
    #[serde(default = "default_step_size")]
    pub step_size: usize,
    /// Warmup steps of the transformer learning-rate schedule.
    #[serde(default = "default_warmup_steps")]
    pub warmup_steps: usize,
    /// Model width; scales the warmup schedule.
    #[serde(default = "default_embedding_size")]
    pub embedding_size: usize,
    /// Weight of the discriminator output-layer norm penalty.
    #[serde(default = "default_l2_reg_lambda")]
    pub l2_reg_lambda: f64,

    // ── Adversarial phases ──────────────────────────────────────────────────
    /// Supervised generator epochs before adversarial training.
    #[serde(default = "default_pretrain_epochs")]
    pub generator_pretrain_epochs: usize,
    /// Discriminator epochs before adversarial training.
    #[serde(default = "default_pretrain_epochs")]
    pub discriminator_pretrain_epochs: usize,

    // ── Vocabulary ──────────────────────────────────────────────────────────
    /// Targets are expressed in the input vocabulary and must be re-indexed.
    #[serde(default)]
    pub share_vocab: bool,

    // ── Cadence ─────────────────────────────────────────────────────────────
    /// Evaluate every N epochs.
    #[serde(default = "default_eval_interval")]
    pub eval_interval: usize,
    /// Always evaluate during the last N epochs.
    #[serde(default = "default_eval_tail")]
    pub eval_tail: usize,
    /// Write a full checkpoint every N epochs.
    #[serde(default = "default_checkpoint_interval")]
    pub checkpoint_interval: usize,

    // ── Placement & persistence ─────────────────────────────────────────────
    /// `"cpu"`, `"cuda"`, `"cuda:N"` or `"auto"`.
    #[serde(default = "default_device")]
    pub device: String,
    /// Full checkpoint file (weights + optimiser + progress).
    #[serde(default = "default_checkpoint_path")]
    pub checkpoint_path: PathBuf,
    /// Best-model file (weights only).
    #[serde(default = "default_trained_model_path")]
    pub trained_model_path: PathBuf,
    /// Optional CSV of evaluation results.
    #[serde(default)]
    pub metrics_path: Option<PathBuf>,
    /// Restore from `checkpoint_path` before training.
    #[serde(default)]
    pub resume: bool,

    // ── Misc ────────────────────────────────────────────────────────────────
    /// Seed for parameter initialisation.
    #[serde(default = "default_seed")]
    pub seed: u64,
    /// Draw a batch progress bar during training epochs.
    #[serde(default)]
    pub show_progress: bool,
}

// ── Default value functions ─────────────────────────────────────────────────

fn default_learning_rate() -> f64 {
    1e-3
}
fn default_train_batch_size() -> usize {
    64
}
fn default_epoch_nums() -> usize {
    100
}
fn default_step_size() -> usize {
    20
}
fn default_warmup_steps() -> usize {
    4000
}
fn default_embedding_size() -> usize {
    128
}
fn default_l2_reg_lambda() -> f64 {
    0.2
}
fn default_pretrain_epochs() -> usize {
    20
}
fn default_eval_interval() -> usize {
    2
}
fn default_eval_tail() -> usize {
    5
}
fn default_checkpoint_interval() -> usize {
    5
}
fn default_device() -> String {
    "auto".to_string()
}
fn default_checkpoint_path() -> PathBuf {
    PathBuf::from("checkpoint/checkpoint.safetensors")
}
fn default_trained_model_path() -> PathBuf {
    PathBuf::from("trained_model/model.safetensors")
}
fn default_seed() -> u64 {
    2020
}

// ── Impl ────────────────────────────────────────────────────────────────────

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            learning_rate: default_learning_rate(),
            train_batch_size: default_train_batch_size(),
            epoch_nums: default_epoch_nums(),
            weight_decay: 0.0,
            step_size: default_step_size(),
            warmup_steps: default_warmup_steps(),
            embedding_size: default_embedding_size(),
            l2_reg_lambda: default_l2_reg_lambda(),
            generator_pretrain_epochs: default_pretrain_epochs(),
            discriminator_pretrain_epochs: default_pretrain_epochs(),
            share_vocab: false,
            eval_interval: default_eval_interval(),
            eval_tail: default_eval_tail(),
            checkpoint_interval: default_checkpoint_interval(),
            device: default_device(),
            checkpoint_path: default_checkpoint_path(),
            trained_model_path: default_trained_model_path(),
            metrics_path: None,
            resume: false,
            seed: default_seed(),
            show_progress: false,
        }
    }
}

impl TrainingConfig {
    /// Save config to a JSON file.
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json).with_context(|| format!("write {}", path.display()))?;
        Ok(())
    }

    /// Load config from a JSON file.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let json =
            std::fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
        let config: Self = serde_json::from_str(&json)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values that would make a run meaningless or divide by zero.
    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(self.learning_rate > 0.0, "learning_rate must be positive");
        anyhow::ensure!(self.train_batch_size > 0, "train_batch_size must be positive");
        anyhow::ensure!(self.step_size > 0, "step_size must be positive");
        anyhow::ensure!(self.warmup_steps > 0, "warmup_steps must be positive");
        anyhow::ensure!(self.embedding_size > 0, "embedding_size must be positive");
        anyhow::ensure!(self.eval_interval > 0, "eval_interval must be positive");
        anyhow::ensure!(
            self.checkpoint_interval > 0,
            "checkpoint_interval must be positive"
        );
        Ok(())
    }

    /// Resolve the `device` string to a candle device.
    pub fn device(&self) -> candle_core::Result<Device> {
        match self.device.as_str() {
            "cpu" => Ok(Device::Cpu),
            "auto" => Device::cuda_if_available(0),
            "cuda" => Device::new_cuda(0),
            other => match other.strip_prefix("cuda:").map(str::parse::<usize>) {
                Some(Ok(ordinal)) => Device::new_cuda(ordinal),
                _ => Err(candle_core::Error::Msg(format!("unknown device `{other}`"))),
            },
        }
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
