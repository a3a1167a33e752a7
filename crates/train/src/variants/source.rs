//! Source-augmented trainer: the model reads and writes raw text.
//!
//! The model tokenises question and equation text itself and returns targets
//! aligned with its own segmentation, so no vocabulary mapping happens here.
//! Predictions are judged as infix text through
//! [`EquationEvaluator::eval_source`].

use candle_core::D;
use candle_nn::{ops, VarMap};

use mwp_common::{Batch, TrainingConfig};
use mwp_core::{EquationEvaluator, SourceModel, Verdict};

use crate::error::Result;
use crate::group::{OptimizerGroup, RoleSpec};
use crate::loss::{LossAdapter, NllLoss};
use crate::runner::{supervised_update, BatchLoss};
use crate::scheduler::LrScheduler;
use crate::trainer::{BatchEval, BatchForward, TrainerVariant};

use super::adam_config;

pub struct SourceVariant<M> {
    model: M,
    evaluator: Box<dyn EquationEvaluator>,
    loss: NllLoss,
}

impl<M: SourceModel> SourceVariant<M> {
    pub fn new(model: M, evaluator: Box<dyn EquationEvaluator>) -> Self {
        let loss = NllLoss::new(model.pad_token_id());
        Self {
            model,
            evaluator,
            loss,
        }
    }
}

impl<M: SourceModel> BatchForward for SourceVariant<M> {
    fn train_batch(&mut self, batch: &Batch, optim: &mut OptimizerGroup) -> Result<BatchLoss> {
        let model = &self.model;
        let value = supervised_update(&mut self.loss, optim, |loss| {
            let (logits, targets) = model.forward_aligned(&batch.ques_source, &batch.equ_source)?;
            loss.accumulate(&ops::log_softmax(&logits, D::Minus1)?, &targets, None)?;
            Ok(())
        })?;
        Ok(BatchLoss::single(value))
    }
}

impl<M: SourceModel> BatchEval for SourceVariant<M> {
    fn eval_batch(&self, batch: &Batch) -> Result<Vec<Verdict>> {
        let predictions = self.model.generate(&batch.ques_source)?;
        Ok(predictions
            .iter()
            .enumerate()
            .map(|(i, pred)| {
                self.evaluator.eval_source(
                    pred,
                    &batch.equ_source[i],
                    &batch.num_list[i],
                    &batch.num_stack[i],
                )
            })
            .collect())
    }
}

impl<M: SourceModel> TrainerVariant for SourceVariant<M> {
    fn name(&self) -> &'static str {
        "source"
    }

    fn varmap(&self) -> &VarMap {
        self.model.varmap()
    }

    fn optimizer_roles(&self, config: &TrainingConfig) -> Vec<RoleSpec> {
        let schedule = LrScheduler::warmup(config.learning_rate, config.embedding_size, config.warmup_steps);
        vec![RoleSpec::new("model", "", adam_config(config)).with_scheduler(schedule)]
    }

    fn set_training(&mut self, training: bool) {
        self.model.set_training(training);
    }
}
