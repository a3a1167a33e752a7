//! Learning-rate schedules.
//!
//! A schedule is a pure function of its step counter and base rate, so the
//! counter is the only state a checkpoint has to carry.

// ── LR Schedule ─────────────────────────────────────────────────────────────

/// When a schedule's counter advances.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScheduleCadence {
    /// After every optimiser step.
    PerStep,
    /// After every training epoch.
    PerEpoch,
}

/// Shape of the learning-rate curve.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum LrDecay {
    /// Multiply by `gamma` every `step_size` epochs.
    Step { step_size: usize, gamma: f64 },
    /// Noam warmup: linear ramp for `warmup_steps`, then `step^-0.5` decay,
    /// scaled by `d_model^-0.5`.
    WarmUp { d_model: usize, warmup_steps: usize },
}

/// Learning-rate schedule bound to one optimiser.
#[derive(Clone, Debug, PartialEq)]
pub struct LrScheduler {
    step: usize,
    lr: f64,
    decay: LrDecay,
}

impl LrScheduler {
    pub fn new(lr: f64, decay: LrDecay) -> Self {
        Self { step: 0, lr, decay }
    }

    /// Halve the rate every `step_size` epochs.
    pub fn step_decay(lr: f64, step_size: usize) -> Self {
        Self::new(
            lr,
            LrDecay::Step {
                step_size,
                gamma: 0.5,
            },
        )
    }

    pub fn warmup(lr: f64, d_model: usize, warmup_steps: usize) -> Self {
        Self::new(
            lr,
            LrDecay::WarmUp {
                d_model,
                warmup_steps,
            },
        )
    }

    pub fn cadence(&self) -> ScheduleCadence {
        match self.decay {
            LrDecay::Step { .. } => ScheduleCadence::PerEpoch,
            LrDecay::WarmUp { .. } => ScheduleCadence::PerStep,
        }
    }

    /// Learning rate for the next optimiser step.
    ///
    /// For warmup schedules the next step is `step + 1`, so the first update
    /// already uses a non-zero rate.
    pub fn current_lr(&self) -> f64 {
        match self.decay {
            LrDecay::Step { step_size, gamma } => {
                let halvings = self.step / step_size.max(1);
                self.lr * gamma.powi(halvings as i32)
            }
            LrDecay::WarmUp {
                d_model,
                warmup_steps,
            } => {
                let n = (self.step + 1) as f64;
                let warmup = warmup_steps.max(1) as f64;
                let scale = (d_model as f64).powf(-0.5) * n.powf(-0.5).min(n * warmup.powf(-1.5));
                self.lr * scale
            }
        }
    }

    pub fn advance(&mut self) {
        self.step += 1;
    }

    pub fn step(&self) -> usize {
        self.step
    }

    /// Restore the counter from a checkpoint.
    pub fn set_step(&mut self, step: usize) {
        self.step = step;
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
