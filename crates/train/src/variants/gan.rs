//! Adversarial (SeqGAN) trainer.
//!
//! A fresh run first pretrains the generator with teacher forcing, then the
//! discriminator on generated-vs-gold equations. Each adversarial batch then
//! does two updates:
//!
//! 1. generator: policy gradient with Monte-Carlo rollout rewards scored by
//!    the (frozen) discriminator, masked where the sample is padding;
//! 2. discriminator: binary cross-entropy on generated (label 0) and gold
//!    (label 1) equations plus `l2_reg_lambda · ‖W_O‖ + ‖b_O‖`.

use candle_core::{backprop::GradStore, DType, Device, Tensor};
use candle_nn::VarMap;

use mwp_common::{rows_to_tensor, Batch, DataLoader, DataSplit, DatasetMeta, TrainingConfig};
use mwp_core::{
    EquationEvaluator, GanModel, GeneratorRollout, Verdict, DISCRIMINATOR_PREFIX, GENERATOR_PREFIX,
};

use crate::error::{Result, TrainError};
use crate::group::{OptimizerGroup, RoleSpec};
use crate::loss::{BinaryCrossEntropyLoss, LossAdapter, NllLoss};
use crate::runner::{role_update, BatchLoss};
use crate::trainer::{BatchEval, BatchForward, TrainerVariant};

use super::{adam_config, TargetIndexer};

const GENERATOR: &str = "generator";
const DISCRIMINATOR: &str = "discriminator";

pub struct GanVariant<M> {
    model: M,
    evaluator: Box<dyn EquationEvaluator>,
    targets: TargetIndexer,
    nll: NllLoss,
    bce: BinaryCrossEntropyLoss,
    out_pad: u32,
    l2_reg_lambda: f64,
    device: Device,
}

impl<M: GanModel> GanVariant<M> {
    pub fn new(
        model: M,
        meta: &DatasetMeta,
        evaluator: Box<dyn EquationEvaluator>,
        config: &TrainingConfig,
        device: Device,
    ) -> Result<Self> {
        let out_pad = meta.out_pad_token()?;
        Ok(Self {
            model,
            evaluator,
            targets: TargetIndexer::new(meta, config.share_vocab),
            nll: NllLoss::new(out_pad),
            bce: BinaryCrossEntropyLoss::new(),
            out_pad,
            l2_reg_lambda: config.l2_reg_lambda,
            device,
        })
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    /// Negative masked policy-gradient reward of one rollout.
    ///
    /// For every step, the discriminator scores of the step's rollouts are
    /// averaged per example, multiplied by the log-probability of the sampled
    /// token and masked where the sample is padding; the step total is
    /// divided by its unmasked count. Steps with nothing unmasked are
    /// skipped, so an all-padding sample yields exactly zero.
    pub fn reward(&self, rollout: &GeneratorRollout) -> Result<Tensor> {
        let tokens = rollout.tokens.to_vec2::<u32>()?;
        let batch = tokens.len();
        let mut total: Option<Tensor> = None;
        for (step, (sequences, log_probs)) in rollout
            .rollouts
            .iter()
            .zip(&rollout.token_log_probs)
            .enumerate()
        {
            let mask: Vec<f32> = tokens
                .iter()
                .map(|row| match row.get(step) {
                    Some(&t) if t != self.out_pad => 1.0,
                    _ => 0.0,
                })
                .collect();
            let kept: f32 = mask.iter().sum();
            if kept == 0.0 {
                continue;
            }
            let rows = sequences.dim(0)?;
            let scores = self
                .model
                .discriminate(sequences)?
                .detach()
                .reshape((batch, rows / batch.max(1)))?
                .mean(1)?
                .to_dtype(log_probs.dtype())?;
            let mask = Tensor::from_vec(mask, batch, log_probs.device())?.to_dtype(log_probs.dtype())?;
            let term = ((scores * log_probs.flatten_all()?)? * mask)?
                .sum_all()?
                .affine(1.0 / kept as f64, 0.0)?;
            total = Some(match total {
                None => term,
                Some(prev) => (prev + term)?,
            });
        }
        match total {
            Some(t) => Ok(t.neg()?),
            None => Ok(Tensor::zeros((), DType::F32, &self.device)?),
        }
    }

    /// BCE on generated (0) and gold (1) equations plus the output-layer
    /// norm penalty, stepping only the discriminator.
    fn discriminator_update(&mut self, batch: &Batch, optim: &mut OptimizerGroup) -> Result<f64> {
        let question = batch.question_tensor(&self.device)?;
        let real = rows_to_tensor(&self.targets.rows(batch)?, &self.device)?;
        let (model, lambda) = (&self.model, self.l2_reg_lambda);
        role_update(&mut self.bce, optim, DISCRIMINATOR, |loss| {
            let fake = model.generate(&question, &batch.ques_len)?.detach();
            let fake_p = model.discriminate(&fake)?;
            loss.accumulate(&fake_p, &fake_p.zeros_like()?, None)?;
            let real_p = model.discriminate(&real)?;
            loss.accumulate(&real_p, &real_p.ones_like()?, None)?;
            loss.add_penalty(&model.discriminator_output_norm()?.affine(lambda, 0.0)?)?;
            Ok(())
        })
    }

    fn pretrain_generator(&mut self, loader: &dyn DataLoader, optim: &mut OptimizerGroup, epochs: usize) -> Result<()> {
        for epoch in 0..epochs {
            self.model.set_generator_training(true);
            self.model.set_discriminator_training(false);
            let (mut total, mut batches) = (0.0, 0usize);
            for batch in loader.load_data(DataSplit::Train) {
                let question = batch.question_tensor(&self.device)?;
                let target = rows_to_tensor(&self.targets.rows(&batch)?, &self.device)?;
                let model = &self.model;
                total += role_update(&mut self.nll, optim, GENERATOR, |loss| {
                    let log_probs = model.generator_forward(&question, &batch.ques_len, &target)?;
                    loss.accumulate(&log_probs, &target, None)?;
                    Ok(())
                })
                .map_err(|e| e.at(epoch, batches))?;
                batches += 1;
            }
            tracing::info!(
                phase = "generator pretrain",
                epoch,
                avg_loss = format!("{:.8}", total / batches.max(1) as f64),
                "Pretrain epoch finished"
            );
        }
        Ok(())
    }

    fn pretrain_discriminator(
        &mut self,
        loader: &dyn DataLoader,
        optim: &mut OptimizerGroup,
        epochs: usize,
    ) -> Result<()> {
        for epoch in 0..epochs {
            self.model.set_generator_training(false);
            self.model.set_discriminator_training(true);
            let (mut total, mut batches) = (0.0, 0usize);
            for batch in loader.load_data(DataSplit::Train) {
                total += self
                    .discriminator_update(&batch, optim)
                    .map_err(|e| e.at(epoch, batches))?;
                batches += 1;
            }
            tracing::info!(
                phase = "discriminator pretrain",
                epoch,
                avg_loss = format!("{:.8}", total / batches.max(1) as f64),
                "Pretrain epoch finished"
            );
        }
        Ok(())
    }
}

/// Gradients of a scalar loss, refusing non-finite values.
fn checked_backward(loss: &Tensor) -> Result<(f64, GradStore)> {
    let value = loss.to_dtype(DType::F64)?.to_scalar::<f64>()?;
    if !value.is_finite() {
        return Err(TrainError::NonFiniteLoss {
            value,
            epoch: 0,
            batch: 0,
        });
    }
    Ok((value, loss.backward()?))
}

impl<M: GanModel> BatchForward for GanVariant<M> {
    fn train_batch(&mut self, batch: &Batch, optim: &mut OptimizerGroup) -> Result<BatchLoss> {
        // Generator step against a frozen discriminator.
        self.model.set_generator_training(true);
        self.model.set_discriminator_training(false);
        let question = batch.question_tensor(&self.device)?;
        let rollout = self.model.sample_with_rollouts(&question, &batch.ques_len)?;
        let (g_loss, grads) = checked_backward(&self.reward(&rollout)?)?;
        optim.step_role(GENERATOR, &grads)?;

        // Discriminator step against a frozen generator.
        self.model.set_generator_training(false);
        self.model.set_discriminator_training(true);
        let d_loss = self.discriminator_update(batch, optim)?;

        self.model.set_generator_training(true);
        self.model.set_discriminator_training(true);
        Ok(BatchLoss {
            primary: g_loss,
            secondary: Some(d_loss),
        })
    }
}

impl<M: GanModel> BatchEval for GanVariant<M> {
    fn eval_batch(&self, batch: &Batch) -> Result<Vec<Verdict>> {
        let question = batch.question_tensor(&self.device)?;
        let predictions = self.model.generate(&question, &batch.ques_len)?.to_vec2::<u32>()?;
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

impl<M: GanModel> TrainerVariant for GanVariant<M> {
    fn name(&self) -> &'static str {
        "seqgan"
    }

    fn varmap(&self) -> &VarMap {
        self.model.varmap()
    }

    fn optimizer_roles(&self, config: &TrainingConfig) -> Vec<RoleSpec> {
        vec![
            RoleSpec::new(GENERATOR, GENERATOR_PREFIX, adam_config(config)),
            RoleSpec::new(DISCRIMINATOR, DISCRIMINATOR_PREFIX, adam_config(config)),
        ]
    }

    fn set_training(&mut self, training: bool) {
        self.model.set_training(training);
    }

    fn pretrain(&mut self, loader: &dyn DataLoader, optim: &mut OptimizerGroup, config: &TrainingConfig) -> Result<()> {
        self.pretrain_generator(loader, optim, config.generator_pretrain_epochs)?;
        self.pretrain_discriminator(loader, optim, config.discriminator_pretrain_epochs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{Var, D};
    use candle_nn::ops;
    use mwp_common::{Example, JsonlDataLoader};
    use mwp_core::{PrefixEvaluator, Trainable};

    const STEPS: usize = 2;
    const VOCAB: usize = 3;
    const ROLLOUTS: usize = 2;

    /// Position-wise generator logits; the discriminator scores a sequence by
    /// the mean of a per-token weight.
    struct ToyGan {
        varmap: VarMap,
        logits: Var,
        w: Var,
        b: Var,
        sample: Vec<Vec<u32>>,
        generator_training: bool,
        discriminator_training: bool,
    }

    impl ToyGan {
        fn new(sample: Vec<Vec<u32>>) -> Self {
            let varmap = VarMap::new();
            let logits = Var::new(&[[0.1f32, 0.2, 0.3], [0.3, 0.1, 0.2]], &Device::Cpu).unwrap();
            let w = Var::new(&[0.5f32, -0.25, 0.75], &Device::Cpu).unwrap();
            let b = Var::new(&[0.1f32], &Device::Cpu).unwrap();
            {
                let mut data = varmap.data().lock().unwrap();
                data.insert("generator.logits".into(), logits.clone());
                data.insert("discriminator.w".into(), w.clone());
                data.insert("discriminator.b".into(), b.clone());
            }
            Self {
                varmap,
                logits,
                w,
                b,
                sample,
                generator_training: true,
                discriminator_training: true,
            }
        }

        fn log_probs(&self) -> candle_core::Result<Tensor> {
            ops::log_softmax(self.logits.as_tensor(), D::Minus1)
        }
    }

    impl Trainable for ToyGan {
        fn varmap(&self) -> &VarMap {
            &self.varmap
        }
        fn set_training(&mut self, training: bool) {
            self.generator_training = training;
            self.discriminator_training = training;
        }
    }

    impl GanModel for ToyGan {
        fn set_generator_training(&mut self, training: bool) {
            self.generator_training = training;
        }

        fn set_discriminator_training(&mut self, training: bool) {
            self.discriminator_training = training;
        }

        fn generator_forward(&self, question: &Tensor, _ques_len: &[usize], target: &Tensor) -> candle_core::Result<Tensor> {
            let b = question.dim(0)?;
            let t = target.dim(1)?;
            self.log_probs()?
                .narrow(0, 0, t)?
                .unsqueeze(0)?
                .repeat((b, 1, 1))?
                .reshape((b * t, VOCAB))
        }

        fn generate(&self, question: &Tensor, _ques_len: &[usize]) -> candle_core::Result<Tensor> {
            let b = question.dim(0)?;
            self.logits.as_tensor().argmax(D::Minus1)?.unsqueeze(0)?.repeat((b, 1))
        }

        fn sample_with_rollouts(&self, _question: &Tensor, _ques_len: &[usize]) -> candle_core::Result<GeneratorRollout> {
            let tokens = rows_to_tensor(&self.sample, &Device::Cpu)?;
            let log_probs = self.log_probs()?;
            let mut rollouts = Vec::new();
            let mut token_log_probs = Vec::new();
            for step in 0..STEPS {
                let rows: Vec<Vec<u32>> = self
                    .sample
                    .iter()
                    .flat_map(|row| std::iter::repeat(row.clone()).take(ROLLOUTS))
                    .collect();
                rollouts.push(rows_to_tensor(&rows, &Device::Cpu)?);
                let ids: Vec<u32> = self.sample.iter().map(|row| row[step]).collect();
                let ids = Tensor::new(ids, &Device::Cpu)?;
                token_log_probs.push(log_probs.get(step)?.index_select(&ids, 0)?);
            }
            Ok(GeneratorRollout {
                tokens,
                rollouts,
                token_log_probs,
            })
        }

        fn discriminate(&self, sequences: &Tensor) -> candle_core::Result<Tensor> {
            let (n, t) = sequences.dims2()?;
            let scores = self
                .w
                .as_tensor()
                .index_select(&sequences.flatten_all()?, 0)?
                .reshape((n, t))?
                .mean(1)?
                .broadcast_add(self.b.as_tensor())?;
            ops::sigmoid(&scores)
        }

        fn discriminator_output_norm(&self) -> candle_core::Result<Tensor> {
            let w = self.w.as_tensor().sqr()?.sum_all()?.sqrt()?;
            let b = self.b.as_tensor().sqr()?.sum_all()?.sqrt()?;
            w + b
        }
    }

    fn meta() -> DatasetMeta {
        let s = |v: &[&str]| v.iter().map(|x| x.to_string()).collect::<Vec<_>>();
        DatasetMeta::new(s(&["<PAD>", "a"]), s(&["<PAD>", "+", "NUM_0"]), 2, vec![])
    }

    fn variant(sample: Vec<Vec<u32>>, config: &TrainingConfig) -> GanVariant<ToyGan> {
        let meta = meta();
        GanVariant::new(
            ToyGan::new(sample),
            &meta,
            Box::new(PrefixEvaluator::new(&meta)),
            config,
            Device::Cpu,
        )
        .unwrap()
    }

    fn scalar(t: &Tensor) -> f32 {
        t.to_dtype(DType::F32).unwrap().to_scalar::<f32>().unwrap()
    }

    #[test]
    fn all_padding_sample_has_zero_reward() {
        let v = variant(vec![vec![0, 0], vec![0, 0]], &TrainingConfig::default());
        let rollout = v.model().sample_with_rollouts(&Tensor::zeros((2, 1), DType::U32, &Device::Cpu).unwrap(), &[1, 1]).unwrap();
        assert_eq!(scalar(&v.reward(&rollout).unwrap()), 0.0);
    }

    #[test]
    fn padding_steps_are_masked() {
        // Example 0 is padding at step 1; example 1 is live at both steps.
        let v = variant(vec![vec![1, 0], vec![2, 1]], &TrainingConfig::default());
        let q = Tensor::zeros((2, 1), DType::U32, &Device::Cpu).unwrap();
        let rollout = v.model().sample_with_rollouts(&q, &[1, 1]).unwrap();

        let mut expected = 0f32;
        let masks = [[1f32, 1.0], [0.0, 1.0]];
        for step in 0..STEPS {
            let scores = v
                .model()
                .discriminate(&rollout.rollouts[step])
                .unwrap()
                .reshape((2, ROLLOUTS))
                .unwrap()
                .mean(1)
                .unwrap()
                .to_vec1::<f32>()
                .unwrap();
            let lp = rollout.token_log_probs[step].to_vec1::<f32>().unwrap();
            let kept: f32 = masks[step].iter().sum();
            let sum: f32 = (0..2).map(|i| scores[i] * lp[i] * masks[step][i]).sum();
            expected += sum / kept;
        }
        let got = scalar(&v.reward(&rollout).unwrap());
        assert!((got + expected).abs() < 1e-5, "{got} vs {}", -expected);
    }

    fn loader() -> JsonlDataLoader {
        let ex = Example {
            question: vec![1],
            equation: vec![1, 2],
            num_list: vec!["3".into()],
            ..Default::default()
        };
        JsonlDataLoader::from_examples(meta(), vec![ex.clone(); 4], vec![ex.clone()], vec![ex], 2, false).unwrap()
    }

    #[test]
    fn pretrain_runs_configured_epochs_per_role() {
        let config = TrainingConfig {
            generator_pretrain_epochs: 3,
            discriminator_pretrain_epochs: 2,
            ..Default::default()
        };
        let mut v = variant(vec![vec![1, 2]], &config);
        let mut optim = OptimizerGroup::new(v.varmap(), v.optimizer_roles(&config)).unwrap();
        v.pretrain(&loader(), &mut optim, &config).unwrap();
        // Two batches per epoch.
        assert_eq!(optim.step_counts(), vec![("generator", 6), ("discriminator", 4)]);
    }

    #[test]
    fn adversarial_batch_steps_both_players() {
        let config = TrainingConfig::default();
        let mut v = variant(vec![vec![1, 2], vec![2, 0]], &config);
        let mut optim = OptimizerGroup::new(v.varmap(), v.optimizer_roles(&config)).unwrap();
        let batch = loader().load_data(DataSplit::Train).next().unwrap();
        let loss = v.train_batch(&batch, &mut optim).unwrap();
        assert!(loss.primary.is_finite());
        assert!(loss.secondary.is_some_and(|d| d > 0.0));
        assert_eq!(optim.step_counts(), vec![("generator", 1), ("discriminator", 1)]);
        assert!(v.model().generator_training && v.model().discriminator_training);
    }
}
