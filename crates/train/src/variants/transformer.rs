//! Transformer trainer: raw logits, Noam warmup advanced every optimiser step.

use candle_core::{Device, D};
use candle_nn::{ops, VarMap};

use mwp_common::{rows_to_tensor, Batch, DatasetMeta, TrainingConfig};
use mwp_core::{EquationEvaluator, TransformerModel, Verdict};

use crate::error::Result;
use crate::group::{OptimizerGroup, RoleSpec};
use crate::loss::{LossAdapter, NllLoss};
use crate::runner::{supervised_update, BatchLoss};
use crate::scheduler::LrScheduler;
use crate::trainer::{BatchEval, BatchForward, TrainerVariant};

use super::{adam_config, TargetIndexer};

pub struct TransformerVariant<M> {
    model: M,
    evaluator: Box<dyn EquationEvaluator>,
    targets: TargetIndexer,
    loss: NllLoss,
    device: Device,
}

impl<M: TransformerModel> TransformerVariant<M> {
    pub fn new(
        model: M,
        meta: &DatasetMeta,
        evaluator: Box<dyn EquationEvaluator>,
        share_vocab: bool,
        device: Device,
    ) -> Result<Self> {
        Ok(Self {
            model,
            evaluator,
            targets: TargetIndexer::new(meta, share_vocab),
            loss: NllLoss::new(meta.out_pad_token()?),
            device,
        })
    }
}

impl<M: TransformerModel> BatchForward for TransformerVariant<M> {
    fn train_batch(&mut self, batch: &Batch, optim: &mut OptimizerGroup) -> Result<BatchLoss> {
        let question = batch.question_tensor(&self.device)?;
        let target = rows_to_tensor(&self.targets.rows(batch)?, &self.device)?;
        let model = &self.model;
        let value = supervised_update(&mut self.loss, optim, |loss| {
            let logits = model.forward_logits(&question, &target)?;
            loss.accumulate(&ops::log_softmax(&logits, D::Minus1)?, &target, None)?;
            Ok(())
        })?;
        Ok(BatchLoss::single(value))
    }
}

impl<M: TransformerModel> BatchEval for TransformerVariant<M> {
    fn eval_batch(&self, batch: &Batch) -> Result<Vec<Verdict>> {
        let question = batch.question_tensor(&self.device)?;
        let predictions = self.model.generate(&question)?;
        let targets = self.targets.rows(batch)?;
        Ok(predictions
            .iter()
            .zip(&targets)
            .enumerate()
            .map(|(i, (pred, target))| {
                self.evaluator.result(
                    pred,
                    &target[..batch.equ_len[i]],
                    &batch.num_list[i],
                    &batch.num_stack[i],
                )
            })
            .collect())
    }
}

impl<M: TransformerModel> TrainerVariant for TransformerVariant<M> {
    fn name(&self) -> &'static str {
        "transformer"
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

#[cfg(test)]
mod tests {
    use super::*;
    use mwp_common::Example;
    use mwp_core::{BaselineConfig, BowSeq2Seq, PrefixEvaluator};

    fn meta() -> DatasetMeta {
        let s = |v: &[&str]| v.iter().map(|x| x.to_string()).collect::<Vec<_>>();
        DatasetMeta::new(
            s(&["<PAD>", "a", "b"]),
            s(&["<PAD>", "<EOS>", "+", "NUM_0"]),
            3,
            vec![],
        )
    }

    fn variant() -> TransformerVariant<BowSeq2Seq> {
        let model = BowSeq2Seq::new(
            BaselineConfig {
                in_vocab_size: 3,
                out_vocab_size: 4,
                hidden_size: 4,
                max_equation_len: 3,
                in_pad: 0,
                out_eos: Some(1),
                seed: 11,
            },
            &Device::Cpu,
        )
        .unwrap();
        let meta = meta();
        TransformerVariant::new(model, &meta, Box::new(PrefixEvaluator::new(&meta)), false, Device::Cpu).unwrap()
    }

    #[test]
    fn learning_rate_warms_up_every_step() {
        let mut v = variant();
        let config = TrainingConfig {
            learning_rate: 1.0,
            embedding_size: 16,
            warmup_steps: 10,
            ..Default::default()
        };
        let mut optim = OptimizerGroup::new(v.varmap(), v.optimizer_roles(&config)).unwrap();
        let batch = Batch::from_examples(
            &[Example {
                question: vec![1, 2],
                equation: vec![3, 1],
                num_list: vec!["4".into()],
                ..Default::default()
            }],
            0,
            0,
        );
        let mut rates = vec![optim.learning_rates()[0].1];
        for _ in 0..3 {
            v.train_batch(&batch, &mut optim).unwrap();
            rates.push(optim.learning_rates()[0].1);
        }
        assert!(rates.windows(2).all(|w| w[0] < w[1]), "{rates:?}");
        // n = 1: 16^-0.5 * 10^-1.5
        assert!((rates[0] - 0.25 * 10f64.powf(-1.5)).abs() < 1e-12);
        // Per-epoch advancement leaves warmup untouched.
        optim.end_epoch();
        assert_eq!(optim.learning_rates()[0].1, rates[3]);
    }
}
