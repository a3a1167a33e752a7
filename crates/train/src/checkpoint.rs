//! Checkpoint manager: full resumable checkpoints and best-model weights.
//!
//! A checkpoint is one safetensors file holding every piece of resumable
//! state under a flat key scheme:
//!
//! ```text
//! model.<param>                         weights
//! optimizer.<role>.{step,lr}            Adam counters
//! optimizer.<role>.exp_avg[_sq].<param> Adam moments
//! scheduler.<role>.step                 LR schedule counter
//! trainer.{start_epoch,epoch,batch_idx} progress
//! trainer.best_*                        best-so-far metrics
//! ```
//!
//! Loading is strict: every key the current model and optimiser layout
//! expects must be present, and all of them are checked before anything is
//! mutated. Files are written to `<path>.tmp` and renamed into place, so a
//! crash mid-write leaves the previous checkpoint intact.
//!
//! A `<path>.json` sidecar records the trainer state for humans; it is never
//! read back.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use candle_core::{Device, Tensor};
use candle_nn::VarMap;
use tracing::info;

use crate::error::{Result, TrainError};
use crate::group::OptimizerGroup;
use crate::optim::{read_f64, read_i64, scalar_f64, scalar_i64};
use crate::state::{BestMetrics, TrainerState};

const MODEL_PREFIX: &str = "model";

const START_EPOCH: &str = "trainer.start_epoch";
const EPOCH: &str = "trainer.epoch";
const BATCH_IDX: &str = "trainer.batch_idx";
const BEST_VALID_EQU: &str = "trainer.best_valid_equ_accuracy";
const BEST_VALID_VALUE: &str = "trainer.best_valid_value_accuracy";
const BEST_TEST_EQU: &str = "trainer.best_test_equ_accuracy";
const BEST_TEST_VALUE: &str = "trainer.best_test_value_accuracy";

const STATE_KEYS: [&str; 7] = [
    START_EPOCH,
    EPOCH,
    BATCH_IDX,
    BEST_VALID_EQU,
    BEST_VALID_VALUE,
    BEST_TEST_EQU,
    BEST_TEST_VALUE,
];

/// Owns the checkpoint and best-model paths of one run.
#[derive(Debug, Clone)]
pub struct CheckpointManager {
    checkpoint_path: PathBuf,
    model_path: PathBuf,
    device: Device,
}

impl CheckpointManager {
    pub fn new(checkpoint_path: impl Into<PathBuf>, model_path: impl Into<PathBuf>, device: Device) -> Self {
        Self {
            checkpoint_path: checkpoint_path.into(),
            model_path: model_path.into(),
            device,
        }
    }

    pub fn checkpoint_path(&self) -> &Path {
        &self.checkpoint_path
    }

    pub fn model_path(&self) -> &Path {
        &self.model_path
    }

    pub fn has_checkpoint(&self) -> bool {
        self.checkpoint_path.is_file()
    }

    // ── Full checkpoint ─────────────────────────────────────────────────────

    /// Write model, optimiser, scheduler and trainer state.
    pub fn save_checkpoint(&self, varmap: &VarMap, optim: &OptimizerGroup, state: &TrainerState) -> Result<()> {
        let mut tensors = model_tensors(varmap)?;
        tensors.extend(optim.state_tensors()?);
        tensors.extend(state_tensors(state)?);
        write_atomic(&tensors, &self.checkpoint_path)?;
        write_sidecar(state, &self.checkpoint_path)?;
        info!(
            path = %self.checkpoint_path.display(),
            epoch = state.epoch,
            tensors = tensors.len(),
            "Saved checkpoint"
        );
        Ok(())
    }

    /// Restore model and optimiser in place; returns the stored trainer state.
    pub fn load_checkpoint(&self, varmap: &VarMap, optim: &mut OptimizerGroup) -> Result<TrainerState> {
        let tensors = candle_core::safetensors::load(&self.checkpoint_path, &self.device)?;

        let mut expected = model_keys(varmap)?;
        expected.extend(optim.state_keys());
        expected.extend(STATE_KEYS.iter().map(|k| k.to_string()));
        self.require(&tensors, &expected, &self.checkpoint_path)?;

        let state = read_state(&tensors, &self.checkpoint_path)?;
        restore_model(varmap, &tensors)?;
        optim.restore(&tensors, &self.device)?;
        info!(
            path = %self.checkpoint_path.display(),
            epoch = state.epoch,
            "Loaded checkpoint"
        );
        Ok(state)
    }

    // ── Best model ──────────────────────────────────────────────────────────

    /// Write the current weights as the best model.
    pub fn save_model(&self, varmap: &VarMap) -> Result<()> {
        let tensors = model_tensors(varmap)?;
        write_atomic(&tensors, &self.model_path)?;
        info!(path = %self.model_path.display(), "Saved best model");
        Ok(())
    }

    /// Load the best-model weights into `varmap`.
    pub fn load_model(&self, varmap: &VarMap) -> Result<()> {
        let tensors = candle_core::safetensors::load(&self.model_path, &self.device)?;
        self.require(&tensors, &model_keys(varmap)?, &self.model_path)?;
        restore_model(varmap, &tensors)?;
        info!(path = %self.model_path.display(), "Loaded best model");
        Ok(())
    }

    fn require(&self, tensors: &HashMap<String, Tensor>, keys: &[String], path: &Path) -> Result<()> {
        match keys.iter().find(|k| !tensors.contains_key(*k)) {
            Some(key) => Err(TrainError::MissingCheckpointKey {
                path: path.to_path_buf(),
                key: key.clone(),
            }),
            None => Ok(()),
        }
    }
}

// ── Model weights ───────────────────────────────────────────────────────────

fn model_key(name: &str) -> String {
    format!("{MODEL_PREFIX}.{name}")
}

fn lock_err() -> TrainError {
    TrainError::Candle(candle_core::Error::Msg("var map lock poisoned".into()))
}

fn model_tensors(varmap: &VarMap) -> Result<HashMap<String, Tensor>> {
    let data = varmap.data().lock().map_err(|_| lock_err())?;
    Ok(data
        .iter()
        .map(|(name, var)| (model_key(name), var.as_tensor().detach()))
        .collect())
}

fn model_keys(varmap: &VarMap) -> Result<Vec<String>> {
    let data = varmap.data().lock().map_err(|_| lock_err())?;
    Ok(data.keys().map(|name| model_key(name)).collect())
}

/// Shapes are checked for every parameter before the first one is written.
fn restore_model(varmap: &VarMap, tensors: &HashMap<String, Tensor>) -> Result<()> {
    let data = varmap.data().lock().map_err(|_| lock_err())?;
    let mut updates = Vec::with_capacity(data.len());
    for (name, var) in data.iter() {
        let key = model_key(name);
        let Some(stored) = tensors.get(&key) else {
            continue;
        };
        if stored.dims() != var.dims() {
            return Err(TrainError::Candle(candle_core::Error::Msg(format!(
                "`{key}` has shape {:?}, model expects {:?}",
                stored.dims(),
                var.dims()
            ))));
        }
        updates.push((var, stored.to_dtype(var.dtype())?));
    }
    for (var, value) in updates {
        var.set(&value)?;
    }
    Ok(())
}

// ── Trainer state ───────────────────────────────────────────────────────────

fn state_tensors(state: &TrainerState) -> Result<HashMap<String, Tensor>> {
    let best = &state.best;
    let mut out = HashMap::new();
    out.insert(START_EPOCH.to_string(), scalar_i64(state.start_epoch as i64)?);
    out.insert(EPOCH.to_string(), scalar_i64(state.epoch as i64)?);
    out.insert(BATCH_IDX.to_string(), scalar_i64(state.batch_idx as i64)?);
    out.insert(BEST_VALID_EQU.to_string(), scalar_f64(best.valid_equ_accuracy)?);
    out.insert(BEST_VALID_VALUE.to_string(), scalar_f64(best.valid_value_accuracy)?);
    out.insert(BEST_TEST_EQU.to_string(), scalar_f64(best.test_equ_accuracy)?);
    out.insert(BEST_TEST_VALUE.to_string(), scalar_f64(best.test_value_accuracy)?);
    Ok(out)
}

fn read_state(tensors: &HashMap<String, Tensor>, path: &Path) -> Result<TrainerState> {
    let get = |key: &str| {
        tensors.get(key).ok_or_else(|| TrainError::MissingCheckpointKey {
            path: path.to_path_buf(),
            key: key.to_string(),
        })
    };
    let int = |key: &str| -> Result<usize> { Ok(read_i64(get(key)?)? as usize) };
    let float = |key: &str| -> Result<f64> { Ok(read_f64(get(key)?)?) };
    Ok(TrainerState {
        start_epoch: int(START_EPOCH)?,
        epoch: int(EPOCH)?,
        batch_idx: int(BATCH_IDX)?,
        best: BestMetrics {
            valid_equ_accuracy: float(BEST_VALID_EQU)?,
            valid_value_accuracy: float(BEST_VALID_VALUE)?,
            test_equ_accuracy: float(BEST_TEST_EQU)?,
            test_value_accuracy: float(BEST_TEST_VALUE)?,
        },
    })
}

// ── Files ───────────────────────────────────────────────────────────────────

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(suffix);
    path.with_file_name(name)
}

fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    Ok(())
}

fn write_atomic(tensors: &HashMap<String, Tensor>, path: &Path) -> Result<()> {
    ensure_parent(path)?;
    let tmp = with_suffix(path, ".tmp");
    candle_core::safetensors::save(tensors, &tmp)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

fn write_sidecar(state: &TrainerState, checkpoint: &Path) -> Result<()> {
    let path = checkpoint.with_extension("json");
    let tmp = with_suffix(&path, ".tmp");
    fs::write(&tmp, serde_json::to_string_pretty(state)?)?;
    fs::rename(&tmp, &path)?;
    Ok(())
}

// ── Tests ───────────────────────────────────────────────────────────────────
