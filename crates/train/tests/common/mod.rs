//! Shared fixtures: a synthetic two-rule dataset and run configs.

#![allow(dead_code)]

use std::path::Path;

use candle_core::{DType, Device, Tensor, Var, D};
use candle_nn::{ops, VarMap};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use mwp_common::{rows_to_tensor, Batch, DatasetMeta, Example, JsonlDataLoader, TrainingConfig};
use mwp_core::{
    BaselineConfig, BowSeq2Seq, GanModel, GeneratorRollout, PrefixEvaluator, SourceModel, Trainable,
    TreeContext, TreeModel,
};
use mwp_train::{
    EquationMode, GanVariant, OptimizerGroup, Seq2SeqVariant, SourceVariant, TransformerVariant,
    TreeVariant,
};

pub const IN_WORDS: [&str; 5] = ["<PAD>", "add", "sub", "x", "y"];
pub const OUT_SYMBOLS: [&str; 7] = ["<PAD>", "<EOS>", "<UNK>", "+", "-", "NUM_0", "NUM_1"];

pub fn meta() -> DatasetMeta {
    let s = |v: &[&str]| v.iter().map(|x| x.to_string()).collect::<Vec<_>>();
    DatasetMeta::new(s(&IN_WORDS), s(&OUT_SYMBOLS), 5, vec![])
}

/// Questions start with `add` or `sub`; the target is `± NUM_0 NUM_1 <EOS>`.
pub fn examples(n: usize, seed: u64) -> Vec<Example> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..n)
        .map(|_| {
            let add = rng.gen_bool(0.5);
            let len = rng.gen_range(2..5);
            let mut question = vec![if add { 1 } else { 2 }];
            question.extend((0..len).map(|_| rng.gen_range(3..5u32)));
            let a: u32 = rng.gen_range(1..50);
            let b: u32 = rng.gen_range(1..50);
            Example {
                question,
                equation: vec![if add { 3 } else { 4 }, 5, 6, 1],
                num_list: vec![a.to_string(), b.to_string()],
                ..Default::default()
            }
        })
        .collect()
}

pub fn loader(train: usize, valid: usize, test: usize, batch_size: usize) -> JsonlDataLoader {
    JsonlDataLoader::from_examples(
        meta(),
        examples(train, 1),
        examples(valid, 2),
        examples(test, 3),
        batch_size,
        false,
    )
    .unwrap()
}

pub fn config(dir: &Path, epochs: usize) -> TrainingConfig {
    TrainingConfig {
        learning_rate: 0.02,
        train_batch_size: 4,
        epoch_nums: epochs,
        device: "cpu".into(),
        checkpoint_path: dir.join("checkpoint/checkpoint.safetensors"),
        trained_model_path: dir.join("trained_model/model.safetensors"),
        ..Default::default()
    }
}

pub fn baseline() -> BowSeq2Seq {
    BowSeq2Seq::new(
        BaselineConfig {
            in_vocab_size: IN_WORDS.len(),
            out_vocab_size: OUT_SYMBOLS.len(),
            hidden_size: 8,
            max_equation_len: 4,
            in_pad: 0,
            out_eos: Some(1),
            seed: 2020,
        },
        &Device::Cpu,
    )
    .unwrap()
}

pub fn seq2seq() -> Seq2SeqVariant<BowSeq2Seq> {
    let meta = meta();
    Seq2SeqVariant::new(
        baseline(),
        &meta,
        Box::new(PrefixEvaluator::new(&meta)),
        EquationMode::Single,
        false,
        Device::Cpu,
    )
    .unwrap()
}

pub fn transformer() -> TransformerVariant<BowSeq2Seq> {
    let meta = meta();
    TransformerVariant::new(
        baseline(),
        &meta,
        Box::new(PrefixEvaluator::new(&meta)),
        false,
        Device::Cpu,
    )
    .unwrap()
}

/// `(role, steps)` detached from the group's borrow.
pub fn step_counts(optim: &OptimizerGroup) -> Vec<(String, u64)> {
    optim.step_counts().into_iter().map(|(r, n)| (r.to_string(), n)).collect()
}

/// `(role, learning rate)` detached from the group's borrow.
pub fn learning_rates(optim: &OptimizerGroup) -> Vec<(String, f64)> {
    optim.learning_rates().into_iter().map(|(r, lr)| (r.to_string(), lr)).collect()
}

pub fn weights(varmap: &VarMap) -> Vec<(String, Vec<f32>)> {
    let mut out: Vec<(String, Vec<f32>)> = varmap
        .data()
        .lock()
        .unwrap()
        .iter()
        .map(|(k, v)| (k.clone(), v.as_tensor().flatten_all().unwrap().to_vec1::<f32>().unwrap()))
        .collect();
    out.sort_by(|a, b| a.0.cmp(&b.0));
    out
}

// ── Tree fixture ────────────────────────────────────────────────────────────

/// Tree model stand-in: position logits in `decoder.*`, one gain per other
/// submodule so every optimiser slot owns a parameter.
pub struct PositionTree {
    varmap: VarMap,
    logits: Var,
    gains: Vec<Var>,
}

impl PositionTree {
    pub fn new(steps: usize, vocab: usize) -> Self {
        let varmap = VarMap::new();
        let logits = Var::zeros((steps, vocab), DType::F32, &Device::Cpu).unwrap();
        let mut gains = Vec::new();
        {
            let mut data = varmap.data().lock().unwrap();
            data.insert("decoder.logits".into(), logits.clone());
            for sub in ["embedder", "encoder", "node_generator", "merge"] {
                let g = Var::new(&[1f32], &Device::Cpu).unwrap();
                data.insert(format!("{sub}.gain"), g.clone());
                gains.push(g);
            }
        }
        Self { varmap, logits, gains }
    }
}

impl Trainable for PositionTree {
    fn varmap(&self) -> &VarMap {
        &self.varmap
    }

    fn set_training(&mut self, _training: bool) {}
}

impl TreeModel for PositionTree {
    fn forward_train(&self, batch: &Batch, _ctx: &TreeContext) -> candle_core::Result<Tensor> {
        let t = batch.equation[0].len();
        let mut gain = self.gains[0].as_tensor().clone();
        for g in &self.gains[1..] {
            gain = (gain * g.as_tensor())?;
        }
        self.logits
            .as_tensor()
            .narrow(0, 0, t)?
            .broadcast_mul(&gain)?
            .unsqueeze(0)
    }

    fn decode(&self, batch: &Batch, _ctx: &TreeContext) -> candle_core::Result<Vec<u32>> {
        let t = batch.equation[0].len();
        self.logits.as_tensor().narrow(0, 0, t)?.argmax(D::Minus1)?.to_vec1::<u32>()
    }
}

pub fn tree() -> TreeVariant<PositionTree> {
    let meta = meta();
    TreeVariant::new(
        PositionTree::new(4, OUT_SYMBOLS.len()),
        &meta,
        Box::new(PrefixEvaluator::new(&meta)),
        Device::Cpu,
    )
    .unwrap()
}

// ── Adversarial fixture ─────────────────────────────────────────────────────

pub const GAN_STEPS: usize = 4;
const GAN_ROLLOUTS: usize = 2;

/// Generator: seeded position logits, one table per rule, picked by the
/// question's first word. Discriminator: sigmoid of the mean per-symbol
/// weight plus a bias. Sampling is greedy, so runs are deterministic.
pub struct RuleGan {
    varmap: VarMap,
    logits: Var,
    w: Var,
    b: Var,
}

impl RuleGan {
    pub fn new(seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let vocab = OUT_SYMBOLS.len();
        let values: Vec<f32> = (0..2 * GAN_STEPS * vocab).map(|_| rng.gen_range(-1.0..1.0)).collect();
        let logits = Var::from_vec(values, (2, GAN_STEPS, vocab), &Device::Cpu).unwrap();
        let w = Var::zeros(vocab, DType::F32, &Device::Cpu).unwrap();
        let b = Var::zeros(1, DType::F32, &Device::Cpu).unwrap();
        let varmap = VarMap::new();
        {
            let mut data = varmap.data().lock().unwrap();
            data.insert("generator.logits".into(), logits.clone());
            data.insert("discriminator.w".into(), w.clone());
            data.insert("discriminator.b".into(), b.clone());
        }
        Self { varmap, logits, w, b }
    }

    /// 0 for `add` questions, 1 for `sub`.
    fn rules(question: &Tensor) -> candle_core::Result<Vec<usize>> {
        Ok(question
            .to_vec2::<u32>()?
            .iter()
            .map(|row| usize::from(row.first() == Some(&2)))
            .collect())
    }

    fn rule_log_probs(&self, rule: usize) -> candle_core::Result<Tensor> {
        ops::log_softmax(&self.logits.as_tensor().get(rule)?, D::Minus1)
    }
}

impl Trainable for RuleGan {
    fn varmap(&self) -> &VarMap {
        &self.varmap
    }

    fn set_training(&mut self, _training: bool) {}
}

impl GanModel for RuleGan {
    fn set_generator_training(&mut self, _training: bool) {}

    fn set_discriminator_training(&mut self, _training: bool) {}

    fn generator_forward(&self, question: &Tensor, _ques_len: &[usize], target: &Tensor) -> candle_core::Result<Tensor> {
        let t = target.dim(1)?;
        let rows = Self::rules(question)?
            .into_iter()
            .map(|r| self.rule_log_probs(r)?.narrow(0, 0, t))
            .collect::<candle_core::Result<Vec<_>>>()?;
        Tensor::cat(&rows, 0)
    }

    fn generate(&self, question: &Tensor, _ques_len: &[usize]) -> candle_core::Result<Tensor> {
        let rows = Self::rules(question)?
            .into_iter()
            .map(|r| self.logits.as_tensor().get(r)?.argmax(D::Minus1))
            .collect::<candle_core::Result<Vec<_>>>()?;
        Tensor::stack(&rows, 0)
    }

    fn sample_with_rollouts(&self, question: &Tensor, ques_len: &[usize]) -> candle_core::Result<GeneratorRollout> {
        let tokens = self.generate(question, ques_len)?;
        let ids = tokens.to_vec2::<u32>()?;
        let rules = Self::rules(question)?;
        let repeated: Vec<Vec<u32>> = ids
            .iter()
            .flat_map(|row| std::iter::repeat(row.clone()).take(GAN_ROLLOUTS))
            .collect();
        let mut rollouts = Vec::with_capacity(GAN_STEPS);
        let mut token_log_probs = Vec::with_capacity(GAN_STEPS);
        for step in 0..GAN_STEPS {
            rollouts.push(rows_to_tensor(&repeated, &Device::Cpu)?);
            let picked = rules
                .iter()
                .zip(&ids)
                .map(|(&r, row)| self.rule_log_probs(r)?.get(step)?.get(row[step] as usize))
                .collect::<candle_core::Result<Vec<_>>>()?;
            token_log_probs.push(Tensor::stack(&picked, 0)?);
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

pub fn gan(config: &TrainingConfig) -> GanVariant<RuleGan> {
    let meta = meta();
    GanVariant::new(
        RuleGan::new(11),
        &meta,
        Box::new(PrefixEvaluator::new(&meta)),
        config,
        Device::Cpu,
    )
    .unwrap()
}

// ── Source-text fixture ─────────────────────────────────────────────────────

pub const SOURCE_WORDS: [&str; 5] = ["<pad>", "NUM_0", "NUM_1", "+", "-"];
const SOURCE_STEPS: usize = 4;

/// Word-level text model: one learned logit table per rule, chosen by the
/// first question word.
pub struct RuleSource {
    varmap: VarMap,
    table: Var,
}

impl RuleSource {
    pub fn new() -> Self {
        let table = Var::zeros((2, SOURCE_STEPS, SOURCE_WORDS.len()), DType::F32, &Device::Cpu).unwrap();
        let varmap = VarMap::new();
        varmap.data().lock().unwrap().insert("lm.table".into(), table.clone());
        Self { varmap, table }
    }

    fn rule(ques: &str) -> usize {
        usize::from(ques.starts_with("sub"))
    }

    fn encode(text: &str) -> Vec<u32> {
        text.split_whitespace()
            .filter_map(|w| SOURCE_WORDS.iter().position(|&s| s == w))
            .map(|i| i as u32)
            .collect()
    }
}

impl Trainable for RuleSource {
    fn varmap(&self) -> &VarMap {
        &self.varmap
    }

    fn set_training(&mut self, _training: bool) {}
}

impl SourceModel for RuleSource {
    fn forward_aligned(&self, ques_source: &[String], equ_source: &[String]) -> candle_core::Result<(Tensor, Tensor)> {
        let mut rows = Vec::with_capacity(ques_source.len());
        let mut targets = Vec::with_capacity(ques_source.len() * SOURCE_STEPS);
        for (ques, equ) in ques_source.iter().zip(equ_source) {
            rows.push(self.table.as_tensor().get(Self::rule(ques))?);
            let mut ids = Self::encode(equ);
            ids.resize(SOURCE_STEPS, 0);
            targets.extend(ids);
        }
        let n = targets.len();
        Ok((Tensor::cat(&rows, 0)?, Tensor::from_vec(targets, n, &Device::Cpu)?))
    }

    fn generate(&self, ques_source: &[String]) -> candle_core::Result<Vec<String>> {
        ques_source
            .iter()
            .map(|ques| {
                let ids = self
                    .table
                    .as_tensor()
                    .get(Self::rule(ques))?
                    .argmax(D::Minus1)?
                    .to_vec1::<u32>()?;
                Ok(ids
                    .iter()
                    .take_while(|&&i| i != 0)
                    .map(|&i| SOURCE_WORDS[i as usize])
                    .collect::<Vec<_>>()
                    .join(" "))
            })
            .collect()
    }

    fn pad_token_id(&self) -> u32 {
        0
    }
}

/// [`examples`] with question and equation text filled in.
pub fn source_examples(n: usize, seed: u64) -> Vec<Example> {
    examples(n, seed)
        .into_iter()
        .map(|mut ex| {
            ex.ques_source = ex
                .question
                .iter()
                .map(|&i| IN_WORDS[i as usize])
                .collect::<Vec<_>>()
                .join(" ");
            let op = if ex.question[0] == 1 { "+" } else { "-" };
            ex.equ_source = format!("NUM_0 {op} NUM_1");
            ex
        })
        .collect()
}

pub fn source_loader(train: usize, valid: usize, test: usize, batch_size: usize) -> JsonlDataLoader {
    JsonlDataLoader::from_examples(
        meta(),
        source_examples(train, 1),
        source_examples(valid, 2),
        source_examples(test, 3),
        batch_size,
        false,
    )
    .unwrap()
}

pub fn source() -> SourceVariant<RuleSource> {
    let meta = meta();
    SourceVariant::new(RuleSource::new(), Box::new(PrefixEvaluator::new(&meta)))
}
