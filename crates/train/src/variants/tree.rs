//! Goal-driven tree-decoder trainer.
//!
//! Trains one example at a time: a loader batch of any size is split into
//! single-example updates. The five submodules each get their own Adam slot
//! and step-decay schedule; all five step together after every example and
//! halve their rate every `step_size` epochs.

use candle_core::Device;
use candle_nn::VarMap;

use mwp_common::{Batch, DatasetMeta, TrainingConfig};
use mwp_core::{EquationEvaluator, TreeContext, TreeModel, Verdict, TREE_SUBMODULES};

use crate::error::Result;
use crate::group::{OptimizerGroup, RoleSpec};
use crate::loss::{LossAdapter, MaskedCrossEntropyLoss};
use crate::runner::{supervised_update, BatchLoss};
use crate::scheduler::LrScheduler;
use crate::trainer::{BatchEval, BatchForward, TrainerVariant};

use super::adam_config;

pub struct TreeVariant<M> {
    model: M,
    evaluator: Box<dyn EquationEvaluator>,
    ctx: TreeContext,
    loss: MaskedCrossEntropyLoss,
    device: Device,
}

impl<M: TreeModel> TreeVariant<M> {
    /// Fails when `<UNK>` or a generable constant is missing from the output
    /// vocabulary.
    pub fn new(model: M, meta: &DatasetMeta, evaluator: Box<dyn EquationEvaluator>, device: Device) -> Result<Self> {
        let ctx = TreeContext {
            num_start: meta.num_start,
            generate_nums: meta.generate_nums()?,
            unk: meta.out_unk_token()?,
        };
        Ok(Self {
            model,
            evaluator,
            ctx,
            loss: MaskedCrossEntropyLoss::new(),
            device,
        })
    }

    pub fn context(&self) -> &TreeContext {
        &self.ctx
    }
}

impl<M: TreeModel> TreeVariant<M> {
    /// forward → backward → step of all five slots on a single example.
    fn train_example(&mut self, example: &Batch, optim: &mut OptimizerGroup) -> Result<f64> {
        let target = example.equation_tensor(&self.device)?;
        let mask = example.equation_mask(&self.device)?;
        let (model, ctx) = (&self.model, &self.ctx);
        supervised_update(&mut self.loss, optim, |loss| {
            let logits = model.forward_train(example, ctx)?;
            loss.accumulate(&logits, &target, Some(&mask))?;
            Ok(())
        })
    }
}

impl<M: TreeModel> BatchForward for TreeVariant<M> {
    /// Loader batches are split: every example gets its own update.
    fn train_batch(&mut self, batch: &Batch, optim: &mut OptimizerGroup) -> Result<BatchLoss> {
        let mut total = 0.0;
        for row in (0..batch.len()).filter_map(|i| batch.row(i)) {
            total += self.train_example(&row, optim)?;
        }
        Ok(BatchLoss::single(total / batch.len().max(1) as f64))
    }
}

impl<M: TreeModel> BatchEval for TreeVariant<M> {
    fn eval_batch(&self, batch: &Batch) -> Result<Vec<Verdict>> {
        let mut verdicts = Vec::with_capacity(batch.len());
        for row in (0..batch.len()).filter_map(|i| batch.row(i)) {
            let prediction = self.model.decode(&row, &self.ctx)?;
            verdicts.push(self.evaluator.result(
                &prediction,
                &row.equation[0],
                &row.num_list[0],
                &row.num_stack[0],
            ));
        }
        Ok(verdicts)
    }
}

impl<M: TreeModel> TrainerVariant for TreeVariant<M> {
    fn name(&self) -> &'static str {
        "tree"
    }

    fn varmap(&self) -> &VarMap {
        self.model.varmap()
    }

    fn optimizer_roles(&self, config: &TrainingConfig) -> Vec<RoleSpec> {
        TREE_SUBMODULES
            .iter()
            .map(|&sub| {
                RoleSpec::new(sub, sub, adam_config(config))
                    .with_scheduler(LrScheduler::step_decay(config.learning_rate, config.step_size))
            })
            .collect()
    }

    fn set_training(&mut self, training: bool) {
        self.model.set_training(training);
    }

    fn fixed_batch_size(&self) -> Option<usize> {
        Some(1)
    }
}
