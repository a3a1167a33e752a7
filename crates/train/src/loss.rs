//! Loss adapters: accumulate per-batch losses, backpropagate, reset.
//!
//! An adapter may be fed several pieces per batch (e.g. real and fake
//! discriminator passes). It keeps the summed loss tensor plus a count of
//! pieces; [`LossAdapter::value`] reports `sum / count` for logging while
//! [`LossAdapter::backward`] differentiates the sum.

use candle_core::{backprop::GradStore, DType, Device, Tensor, D};
use candle_nn::ops;

use crate::error::{Result, TrainError};

/// Probabilities are clamped into `[EPS, 1 - EPS]` before taking logs.
const BCE_EPS: f32 = 1e-7;

pub trait LossAdapter {
    /// Add one piece; returns that piece's scalar value.
    fn accumulate(&mut self, outputs: &Tensor, targets: &Tensor, mask: Option<&Tensor>) -> Result<f64>;

    /// Mean of the accumulated pieces, 0 when nothing was accumulated.
    fn value(&self) -> Result<f64>;

    /// Gradients of the accumulated sum. Fails on a non-finite loss before
    /// any gradient is produced.
    fn backward(&self) -> Result<GradStore>;

    fn reset(&mut self);
}

// ── Accumulator ─────────────────────────────────────────────────────────────

#[derive(Default)]
struct Accumulated {
    sum: Option<Tensor>,
    count: usize,
}

impl Accumulated {
    fn push(&mut self, piece: Tensor) -> Result<f64> {
        let value = piece.to_dtype(DType::F64)?.to_scalar::<f64>()?;
        self.sum = Some(match self.sum.take() {
            None => piece,
            Some(prev) => (prev + piece)?,
        });
        self.count += 1;
        Ok(value)
    }

    fn value(&self) -> Result<f64> {
        match &self.sum {
            Some(sum) if self.count > 0 => {
                Ok(sum.to_dtype(DType::F64)?.to_scalar::<f64>()? / self.count as f64)
            }
            _ => Ok(0.0),
        }
    }

    fn backward(&self) -> Result<GradStore> {
        let Some(sum) = &self.sum else {
            return Err(TrainError::InvalidBatch("backward on an empty loss".into()));
        };
        let value = sum.to_dtype(DType::F64)?.to_scalar::<f64>()?;
        if !value.is_finite() {
            return Err(TrainError::NonFiniteLoss {
                value,
                epoch: 0,
                batch: 0,
            });
        }
        Ok(sum.backward()?)
    }

    fn reset(&mut self) {
        self.sum = None;
        self.count = 0;
    }
}

fn zero(device: &Device) -> Result<Tensor> {
    Ok(Tensor::zeros((), DType::F32, device)?)
}

// ── NLL ─────────────────────────────────────────────────────────────────────

/// Negative log-likelihood over `(rows, classes)` log-probabilities, with
/// the padding class weighted zero. The mean is taken over non-padding rows.
pub struct NllLoss {
    pad: u32,
    acc: Accumulated,
}

impl NllLoss {
    pub fn new(pad: u32) -> Self {
        Self {
            pad,
            acc: Accumulated::default(),
        }
    }
}

impl LossAdapter for NllLoss {
    fn accumulate(&mut self, outputs: &Tensor, targets: &Tensor, _mask: Option<&Tensor>) -> Result<f64> {
        let targets = targets.flatten_all()?;
        let ids = targets.to_vec1::<u32>()?;
        let weights: Vec<f32> = ids.iter().map(|&t| if t == self.pad { 0.0 } else { 1.0 }).collect();
        let kept: f32 = weights.iter().sum();
        let piece = if kept == 0.0 {
            zero(outputs.device())?
        } else {
            let picked = outputs.gather(&targets.unsqueeze(1)?, 1)?.squeeze(1)?;
            let weights = Tensor::from_vec(weights, ids.len(), outputs.device())?.to_dtype(picked.dtype())?;
            (picked * weights)?.sum_all()?.neg()?.affine(1.0 / kept as f64, 0.0)?
        };
        self.acc.push(piece)
    }

    fn value(&self) -> Result<f64> {
        self.acc.value()
    }

    fn backward(&self) -> Result<GradStore> {
        self.acc.backward()
    }

    fn reset(&mut self) {
        self.acc.reset();
    }
}

// ── Masked cross-entropy ────────────────────────────────────────────────────

/// Cross-entropy over `(batch, steps, classes)` logits, masked by a
/// `(batch, steps)` 0/1 tensor and normalised by the mask total.
#[derive(Default)]
pub struct MaskedCrossEntropyLoss {
    acc: Accumulated,
}

impl MaskedCrossEntropyLoss {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LossAdapter for MaskedCrossEntropyLoss {
    fn accumulate(&mut self, outputs: &Tensor, targets: &Tensor, mask: Option<&Tensor>) -> Result<f64> {
        let (b, t, v) = outputs.dims3()?;
        let mask = match mask {
            Some(m) => m.to_dtype(outputs.dtype())?.reshape(b * t)?,
            None => Tensor::ones(b * t, outputs.dtype(), outputs.device())?,
        };
        let total = mask.to_dtype(DType::F64)?.sum_all()?.to_scalar::<f64>()?;
        let piece = if total == 0.0 {
            zero(outputs.device())?
        } else {
            let log_probs = ops::log_softmax(&outputs.reshape((b * t, v))?, D::Minus1)?;
            let picked = log_probs
                .gather(&targets.reshape((b * t, 1))?, 1)?
                .squeeze(1)?;
            (picked * mask)?.sum_all()?.neg()?.affine(1.0 / total, 0.0)?
        };
        self.acc.push(piece)
    }

    fn value(&self) -> Result<f64> {
        self.acc.value()
    }

    fn backward(&self) -> Result<GradStore> {
        self.acc.backward()
    }

    fn reset(&mut self) {
        self.acc.reset();
    }
}

// ── Binary cross-entropy ────────────────────────────────────────────────────

/// Mean binary cross-entropy over probabilities, plus optional penalty terms.
#[derive(Default)]
pub struct BinaryCrossEntropyLoss {
    acc: Accumulated,
}

impl BinaryCrossEntropyLoss {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a regulariser to the accumulated sum without counting a piece.
    pub fn add_penalty(&mut self, penalty: &Tensor) -> Result<()> {
        let penalty = penalty.flatten_all()?.sum_all()?;
        self.acc.sum = Some(match self.acc.sum.take() {
            None => penalty,
            Some(prev) => (prev + penalty)?,
        });
        Ok(())
    }
}

impl LossAdapter for BinaryCrossEntropyLoss {
    fn accumulate(&mut self, outputs: &Tensor, targets: &Tensor, _mask: Option<&Tensor>) -> Result<f64> {
        let p = outputs.flatten_all()?.clamp(BCE_EPS, 1.0 - BCE_EPS)?;
        let y = targets.flatten_all()?.to_dtype(p.dtype())?;
        let pos = (&y * p.log()?)?;
        let neg = (y.affine(-1.0, 1.0)? * p.affine(-1.0, 1.0)?.log()?)?;
        let piece = (pos + neg)?.mean_all()?.neg()?;
        self.acc.push(piece)
    }

    fn value(&self) -> Result<f64> {
        self.acc.value()
    }

    fn backward(&self) -> Result<GradStore> {
        self.acc.backward()
    }

    fn reset(&mut self) {
        self.acc.reset();
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
