//! Sequence-to-sequence trainer, single or multiple equations per problem.

use candle_core::Device;
use candle_nn::VarMap;

use mwp_common::{rows_to_tensor, Batch, DatasetMeta, TrainingConfig};
use mwp_core::{EquationEvaluator, Seq2SeqModel, Verdict};

use crate::error::Result;
use crate::group::{OptimizerGroup, RoleSpec};
use crate::loss::{LossAdapter, NllLoss};
use crate::runner::{supervised_update, BatchLoss};
use crate::trainer::{BatchEval, BatchForward, TrainerVariant};

use super::{adam_config, TargetIndexer};

/// How predicted equations are judged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EquationMode {
    /// One prefix equation per problem.
    Single,
    /// Several equations joined by `<BRG>`.
    Multi,
}

pub struct Seq2SeqVariant<M> {
    model: M,
    evaluator: Box<dyn EquationEvaluator>,
    mode: EquationMode,
    targets: TargetIndexer,
    loss: NllLoss,
    device: Device,
}

impl<M: Seq2SeqModel> Seq2SeqVariant<M> {
    pub fn new(
        model: M,
        meta: &DatasetMeta,
        evaluator: Box<dyn EquationEvaluator>,
        mode: EquationMode,
        share_vocab: bool,
        device: Device,
    ) -> Result<Self> {
        Ok(Self {
            model,
            evaluator,
            mode,
            targets: TargetIndexer::new(meta, share_vocab),
            loss: NllLoss::new(meta.out_pad_token()?),
            device,
        })
    }

    pub fn model(&self) -> &M {
        &self.model
    }
}

impl<M: Seq2SeqModel> BatchForward for Seq2SeqVariant<M> {
    fn train_batch(&mut self, batch: &Batch, optim: &mut OptimizerGroup) -> Result<BatchLoss> {
        let question = batch.question_tensor(&self.device)?;
        let target = rows_to_tensor(&self.targets.rows(batch)?, &self.device)?;
        let model = &self.model;
        let value = supervised_update(&mut self.loss, optim, |loss| {
            let log_probs = model.forward_train(&question, &batch.ques_len, &target)?;
            loss.accumulate(&log_probs, &target, None)?;
            Ok(())
        })?;
        Ok(BatchLoss::single(value))
    }
}

impl<M: Seq2SeqModel> BatchEval for Seq2SeqVariant<M> {
    fn eval_batch(&self, batch: &Batch) -> Result<Vec<Verdict>> {
        let question = batch.question_tensor(&self.device)?;
        let predictions = self.model.decode(&question, &batch.ques_len)?;
        let targets = self.targets.rows(batch)?;
        Ok(predictions
            .iter()
            .zip(&targets)
            .enumerate()
            .map(|(i, (pred, target))| {
                let target = &target[..batch.equ_len[i]];
                let (nums, stack) = (&batch.num_list[i], &batch.num_stack[i]);
                match self.mode {
                    EquationMode::Single => self.evaluator.result(pred, target, nums, stack),
                    EquationMode::Multi => self.evaluator.result_multi(pred, target, nums, stack),
                }
            })
            .collect())
    }
}

impl<M: Seq2SeqModel> TrainerVariant for Seq2SeqVariant<M> {
    fn name(&self) -> &'static str {
        match self.mode {
            EquationMode::Single => "seq2seq",
            EquationMode::Multi => "multi_equation",
        }
    }

    fn varmap(&self) -> &VarMap {
        self.model.varmap()
    }

    fn optimizer_roles(&self, config: &TrainingConfig) -> Vec<RoleSpec> {
        vec![RoleSpec::new("model", "", adam_config(config))]
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
            s(&["<PAD>", "a", "b", "NUM_0", "NUM_1", "+"]),
            s(&["<PAD>", "<EOS>", "<UNK>", "+", "NUM_0", "NUM_1"]),
            4,
            vec![],
        )
    }

    fn model() -> BowSeq2Seq {
        BowSeq2Seq::new(
            BaselineConfig {
                in_vocab_size: 6,
                out_vocab_size: 6,
                hidden_size: 8,
                max_equation_len: 4,
                in_pad: 0,
                out_eos: Some(1),
                seed: 3,
            },
            &Device::Cpu,
        )
        .unwrap()
    }

    fn batch() -> Batch {
        let ex = Example {
            question: vec![1, 3, 2, 4],
            equation: vec![3, 4, 5, 1],
            num_list: vec!["2".into(), "3".into()],
            ..Default::default()
        };
        Batch::from_examples(&[ex.clone(), ex], 0, 0)
    }

    fn variant(share_vocab: bool) -> Seq2SeqVariant<BowSeq2Seq> {
        let meta = meta();
        Seq2SeqVariant::new(
            model(),
            &meta,
            Box::new(PrefixEvaluator::new(&meta)),
            EquationMode::Single,
            share_vocab,
            Device::Cpu,
        )
        .unwrap()
    }

    fn group(v: &Seq2SeqVariant<BowSeq2Seq>) -> OptimizerGroup {
        let config = TrainingConfig {
            learning_rate: 0.05,
            ..Default::default()
        };
        OptimizerGroup::new(v.varmap(), v.optimizer_roles(&config)).unwrap()
    }

    #[test]
    fn training_reduces_loss() {
        let mut v = variant(false);
        let mut optim = group(&v);
        let first = v.train_batch(&batch(), &mut optim).unwrap().primary;
        let mut last = first;
        for _ in 0..30 {
            last = v.train_batch(&batch(), &mut optim).unwrap().primary;
        }
        assert!(last < first, "loss {first} → {last}");
    }

    #[test]
    fn learns_to_solve_the_batch() {
        let mut v = variant(false);
        let mut optim = group(&v);
        for _ in 0..100 {
            v.train_batch(&batch(), &mut optim).unwrap();
        }
        v.set_training(false);
        let verdicts = v.eval_batch(&batch()).unwrap();
        assert_eq!(verdicts.len(), 2);
        assert!(verdicts.iter().all(|v| v.equation_correct && v.value_correct));
    }

    #[test]
    fn shared_vocab_rejects_question_only_words() {
        let mut v = variant(true);
        let mut optim = group(&v);
        let ex = Example {
            question: vec![1],
            equation: vec![1, 2],
            ..Default::default()
        };
        let err = v
            .train_batch(&Batch::from_examples(&[ex], 0, 0), &mut optim)
            .unwrap_err();
        assert!(matches!(err, crate::error::TrainError::Vocab(_)));
    }

    #[test]
    fn names_follow_mode() {
        assert_eq!(variant(false).name(), "seq2seq");
    }
}
