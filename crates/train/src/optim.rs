//! Adam with checkpointable state.
//!
//! `candle_nn::AdamW` keeps its moments private, so resuming would restart
//! them from zero. This implementation exposes step counter, learning rate
//! and both moment buffers as named tensors.
//!
//! Update rule (L2 weight decay folded into the gradient):
//!
//! ```text
//! g  = grad + wd * θ
//! m  = β1 m + (1-β1) g
//! v  = β2 v + (1-β2) g²
//! θ -= lr · (m / (1-β1^t)) / (sqrt(v / (1-β2^t)) + ε)
//! ```

use std::collections::HashMap;

use candle_core::{backprop::GradStore, Device, Tensor, Var};

use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AdamConfig {
    pub lr: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub eps: f64,
    pub weight_decay: f64,
}

impl Default for AdamConfig {
    fn default() -> Self {
        Self {
            lr: 1e-3,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
            weight_decay: 0.0,
        }
    }
}

struct Param {
    name: String,
    var: Var,
    exp_avg: Tensor,
    exp_avg_sq: Tensor,
}

/// Adam over a fixed, named parameter set.
pub struct Adam {
    params: Vec<Param>,
    config: AdamConfig,
    step: u64,
}

impl Adam {
    /// Moments are allocated eagerly so the state always has the same keys.
    pub fn new(params: Vec<(String, Var)>, config: AdamConfig) -> Result<Self> {
        let params = params
            .into_iter()
            .map(|(name, var)| -> Result<Param> {
                let zeros = var.as_tensor().zeros_like()?;
                Ok(Param {
                    name,
                    exp_avg: zeros.clone(),
                    exp_avg_sq: zeros,
                    var,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            params,
            config,
            step: 0,
        })
    }

    pub fn learning_rate(&self) -> f64 {
        self.config.lr
    }

    pub fn set_learning_rate(&mut self, lr: f64) {
        self.config.lr = lr;
    }

    /// Number of updates applied so far.
    pub fn step_count(&self) -> u64 {
        self.step
    }

    /// Apply one update. Parameters without a gradient keep their value and
    /// moments; when none of them has one, the step counter stays put too.
    pub fn step(&mut self, grads: &GradStore) -> Result<()> {
        if !self.params.iter().any(|p| grads.get(p.var.as_tensor()).is_some()) {
            return Ok(());
        }
        self.step += 1;
        let AdamConfig {
            lr,
            beta1,
            beta2,
            eps,
            weight_decay,
        } = self.config;
        let t = self.step as i32;
        let bias1 = 1.0 - beta1.powi(t);
        let bias2 = 1.0 - beta2.powi(t);

        for p in &mut self.params {
            let Some(grad) = grads.get(p.var.as_tensor()) else {
                continue;
            };
            let theta = p.var.as_tensor().detach();
            let grad = if weight_decay != 0.0 {
                (grad + theta.affine(weight_decay, 0.0)?)?
            } else {
                grad.clone()
            };
            let exp_avg = (p.exp_avg.affine(beta1, 0.0)? + grad.affine(1.0 - beta1, 0.0)?)?;
            let exp_avg_sq = (p.exp_avg_sq.affine(beta2, 0.0)? + grad.sqr()?.affine(1.0 - beta2, 0.0)?)?;
            let denom = exp_avg_sq.affine(1.0 / bias2, 0.0)?.sqrt()?.affine(1.0, eps)?;
            let update = (exp_avg.affine(lr / bias1, 0.0)? / denom)?;
            p.var.set(&(theta - update)?)?;
            p.exp_avg = exp_avg;
            p.exp_avg_sq = exp_avg_sq;
        }
        Ok(())
    }

    // ── State ───────────────────────────────────────────────────────────────

    /// Flat `key → tensor` view of the state under `prefix`.
    pub fn state_tensors(&self, prefix: &str) -> Result<HashMap<String, Tensor>> {
        let mut out = HashMap::new();
        out.insert(format!("{prefix}.step"), scalar_i64(self.step as i64)?);
        out.insert(format!("{prefix}.lr"), scalar_f64(self.config.lr)?);
        for p in &self.params {
            out.insert(format!("{prefix}.exp_avg.{}", p.name), p.exp_avg.clone());
            out.insert(format!("{prefix}.exp_avg_sq.{}", p.name), p.exp_avg_sq.clone());
        }
        Ok(out)
    }

    /// Every key [`Adam::load_state`] will read.
    pub fn state_keys(&self, prefix: &str) -> Vec<String> {
        let mut keys = vec![format!("{prefix}.step"), format!("{prefix}.lr")];
        for p in &self.params {
            keys.push(format!("{prefix}.exp_avg.{}", p.name));
            keys.push(format!("{prefix}.exp_avg_sq.{}", p.name));
        }
        keys
    }

    /// Restore from tensors produced by [`Adam::state_tensors`]. Callers must
    /// have checked [`Adam::state_keys`] are present.
    pub fn load_state(&mut self, prefix: &str, tensors: &HashMap<String, Tensor>, device: &Device) -> Result<()> {
        let get = |key: String| {
            tensors
                .get(&key)
                .cloned()
                .ok_or_else(|| candle_core::Error::Msg(format!("missing optimizer state `{key}`")))
        };
        self.step = read_i64(&get(format!("{prefix}.step"))?)? as u64;
        self.config.lr = read_f64(&get(format!("{prefix}.lr"))?)?;
        for p in &mut self.params {
            let shape = p.var.shape().clone();
            let dtype = p.var.dtype();
            let load = |t: Tensor| -> candle_core::Result<Tensor> {
                t.to_device(device)?.to_dtype(dtype)?.reshape(shape.clone())
            };
            p.exp_avg = load(get(format!("{prefix}.exp_avg.{}", p.name))?)?;
            p.exp_avg_sq = load(get(format!("{prefix}.exp_avg_sq.{}", p.name))?)?;
        }
        Ok(())
    }
}

// ── Scalar helpers ──────────────────────────────────────────────────────────

pub(crate) fn scalar_i64(v: i64) -> candle_core::Result<Tensor> {
    Tensor::new(&[v], &Device::Cpu)
}

pub(crate) fn scalar_f64(v: f64) -> candle_core::Result<Tensor> {
    Tensor::new(&[v], &Device::Cpu)
}

pub(crate) fn read_i64(t: &Tensor) -> candle_core::Result<i64> {
    first(t.flatten_all()?.to_vec1::<i64>()?)
}

pub(crate) fn read_f64(t: &Tensor) -> candle_core::Result<f64> {
    first(t.flatten_all()?.to_vec1::<f64>()?)
}

fn first<T: Copy>(values: Vec<T>) -> candle_core::Result<T> {
    values
        .first()
        .copied()
        .ok_or_else(|| candle_core::Error::Msg("empty scalar tensor".into()))
}

// ── Tests ───────────────────────────────────────────────────────────────────
