//! Named optimiser/scheduler slots stepped, saved and restored as a unit.
//!
//! A trainer declares its topology as a list of [`RoleSpec`]s: one slot for
//! most variants, five for the tree decoder, two for the adversarial trainer.
//! Every fan-out (step, epoch end, checkpoint keys, restore) iterates the slot
//! list, so no role can be forgotten at one call site.

use std::collections::{BTreeMap, HashMap};

use candle_core::{backprop::GradStore, Device, Tensor, Var};
use candle_nn::VarMap;

use crate::error::{Result, TrainError};
use crate::optim::{read_i64, scalar_i64, Adam, AdamConfig};
use crate::scheduler::{LrScheduler, ScheduleCadence};

/// Declaration of one optimiser slot.
#[derive(Debug, Clone)]
pub struct RoleSpec {
    /// Name used in checkpoint keys and logs.
    pub role: String,
    /// Parameter-name prefix owned by this slot; empty = every parameter.
    pub prefix: String,
    pub adam: AdamConfig,
    pub scheduler: Option<LrScheduler>,
}

impl RoleSpec {
    pub fn new(role: impl Into<String>, prefix: impl Into<String>, adam: AdamConfig) -> Self {
        Self {
            role: role.into(),
            prefix: prefix.into(),
            adam,
            scheduler: None,
        }
    }

    pub fn with_scheduler(mut self, scheduler: LrScheduler) -> Self {
        self.scheduler = Some(scheduler);
        self
    }
}

struct Slot {
    role: String,
    optimizer: Adam,
    scheduler: Option<LrScheduler>,
}

/// Ordered collection of `(optimizer, scheduler)` pairs with named roles.
pub struct OptimizerGroup {
    slots: Vec<Slot>,
}

impl OptimizerGroup {
    /// Partition the parameters of `varmap` among `roles`.
    ///
    /// Fails when a parameter is claimed twice, when a role claims nothing,
    /// or when two roles share a name.
    pub fn new(varmap: &VarMap, roles: Vec<RoleSpec>) -> Result<Self> {
        let vars: BTreeMap<String, Var> = varmap
            .data()
            .lock()
            .map_err(|_| TrainError::OptimizerGroup("var map lock poisoned".into()))?
            .iter()
            .map(|(name, var)| (name.clone(), var.clone()))
            .collect();

        let mut owner: HashMap<&str, &str> = HashMap::new();
        let mut slots = Vec::with_capacity(roles.len());
        for spec in &roles {
            if slots.iter().any(|s: &Slot| s.role == spec.role) {
                return Err(TrainError::OptimizerGroup(format!("duplicate role `{}`", spec.role)));
            }
            let mut params = Vec::new();
            for (name, var) in &vars {
                if !owns(&spec.prefix, name) {
                    continue;
                }
                if let Some(other) = owner.insert(name.as_str(), spec.role.as_str()) {
                    return Err(TrainError::OptimizerGroup(format!(
                        "parameter `{name}` claimed by both `{other}` and `{}`",
                        spec.role
                    )));
                }
                params.push((name.clone(), var.clone()));
            }
            if params.is_empty() {
                return Err(TrainError::OptimizerGroup(format!(
                    "role `{}` (prefix `{}`) owns no parameters",
                    spec.role, spec.prefix
                )));
            }
            tracing::debug!(role = %spec.role, params = params.len(), "Optimizer slot");
            let mut optimizer = Adam::new(params, spec.adam)?;
            if let Some(sched) = &spec.scheduler {
                optimizer.set_learning_rate(sched.current_lr());
            }
            slots.push(Slot {
                role: spec.role.clone(),
                optimizer,
                scheduler: spec.scheduler.clone(),
            });
        }
        Ok(Self { slots })
    }

    pub fn roles(&self) -> impl Iterator<Item = &str> {
        self.slots.iter().map(|s| s.role.as_str())
    }

    /// Step every slot, in declaration order.
    pub fn step(&mut self, grads: &GradStore) -> Result<()> {
        for slot in &mut self.slots {
            slot.step(grads)?;
        }
        Ok(())
    }

    /// Step one named slot only.
    pub fn step_role(&mut self, role: &str, grads: &GradStore) -> Result<()> {
        self.slots
            .iter_mut()
            .find(|s| s.role == role)
            .ok_or_else(|| TrainError::OptimizerGroup(format!("unknown role `{role}`")))?
            .step(grads)
    }

    /// Advance every per-epoch schedule.
    pub fn end_epoch(&mut self) {
        for slot in &mut self.slots {
            if let Some(sched) = &mut slot.scheduler {
                if sched.cadence() == ScheduleCadence::PerEpoch {
                    sched.advance();
                    slot.optimizer.set_learning_rate(sched.current_lr());
                }
            }
        }
    }

    /// `(role, learning rate)` of every slot.
    pub fn learning_rates(&self) -> Vec<(&str, f64)> {
        self.slots
            .iter()
            .map(|s| (s.role.as_str(), s.optimizer.learning_rate()))
            .collect()
    }

    /// `(role, optimiser steps taken)` of every slot.
    pub fn step_counts(&self) -> Vec<(&str, u64)> {
        self.slots
            .iter()
            .map(|s| (s.role.as_str(), s.optimizer.step_count()))
            .collect()
    }

    // ── Checkpoint state ────────────────────────────────────────────────────

    /// `optimizer.<role>.*` and `scheduler.<role>.step` tensors of all slots.
    pub fn state_tensors(&self) -> Result<HashMap<String, Tensor>> {
        let mut out = HashMap::new();
        for slot in &self.slots {
            out.extend(slot.optimizer.state_tensors(&optimizer_prefix(&slot.role))?);
            if let Some(sched) = &slot.scheduler {
                out.insert(scheduler_key(&slot.role), scalar_i64(sched.step() as i64)?);
            }
        }
        Ok(out)
    }

    /// Every key [`OptimizerGroup::restore`] reads.
    pub fn state_keys(&self) -> Vec<String> {
        let mut keys = Vec::new();
        for slot in &self.slots {
            keys.extend(slot.optimizer.state_keys(&optimizer_prefix(&slot.role)));
            if slot.scheduler.is_some() {
                keys.push(scheduler_key(&slot.role));
            }
        }
        keys
    }

    /// Restore all slots. Callers validate [`OptimizerGroup::state_keys`]
    /// first so a missing role never leaves the group half restored.
    pub fn restore(&mut self, tensors: &HashMap<String, Tensor>, device: &Device) -> Result<()> {
        for slot in &mut self.slots {
            slot.optimizer
                .load_state(&optimizer_prefix(&slot.role), tensors, device)?;
            if let Some(sched) = &mut slot.scheduler {
                let key = scheduler_key(&slot.role);
                let step = tensors
                    .get(&key)
                    .ok_or_else(|| TrainError::OptimizerGroup(format!("missing `{key}`")))?;
                sched.set_step(read_i64(step)? as usize);
            }
        }
        Ok(())
    }
}

impl Slot {
    /// The optimiser always holds the rate of its next update.
    fn step(&mut self, grads: &GradStore) -> Result<()> {
        self.optimizer.step(grads)?;
        if let Some(sched) = &mut self.scheduler {
            if sched.cadence() == ScheduleCadence::PerStep {
                sched.advance();
                self.optimizer.set_learning_rate(sched.current_lr());
            }
        }
        Ok(())
    }
}

fn owns(prefix: &str, name: &str) -> bool {
    prefix.is_empty()
        || name == prefix
        || name
            .strip_prefix(prefix)
            .is_some_and(|rest| rest.starts_with('.'))
}

fn optimizer_prefix(role: &str) -> String {
    format!("optimizer.{role}")
}

fn scheduler_key(role: &str) -> String {
    format!("scheduler.{role}.step")
}

// ── Tests ───────────────────────────────────────────────────────────────────
