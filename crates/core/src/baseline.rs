//! Bag-of-words baseline: mean-pooled question embedding → per-position
//! output distribution.
//!
//! Small enough to train on a CPU in seconds, which makes it the model behind
//! the CLI and the trainer tests. Parameters are initialised from a seeded
//! RNG so two models built with the same config are bit-identical.

use candle_core::{DType, Device, Result, Tensor, Var, D};
use candle_nn::{ops, Embedding, Linear, Module, VarMap};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::model::{Seq2SeqModel, Trainable, TransformerModel};

/// Baseline hyper-parameters. Stored next to the weights so `test` can
/// rebuild the same shapes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BaselineConfig {
    pub in_vocab_size: usize,
    pub out_vocab_size: usize,
    pub hidden_size: usize,
    /// Longest equation the decoder can emit.
    pub max_equation_len: usize,
    /// Input `<PAD>` id, excluded from pooling.
    pub in_pad: u32,
    /// Output id that ends a decoded equation.
    pub out_eos: Option<u32>,
    pub seed: u64,
}

/// Mean-pooled embedding encoder with a position-wise linear decoder.
pub struct BowSeq2Seq {
    varmap: VarMap,
    embedder: Embedding,
    decoder: Linear,
    config: BaselineConfig,
    device: Device,
}

impl BowSeq2Seq {
    pub fn new(config: BaselineConfig, device: &Device) -> Result<Self> {
        let varmap = VarMap::new();
        let mut rng = StdRng::seed_from_u64(config.seed);
        let h = config.hidden_size;
        let out = config.max_equation_len * config.out_vocab_size;

        let emb = seeded_var(&varmap, "embedder.weight", (config.in_vocab_size, h), 1.0, &mut rng, device)?;
        let bound = 1.0 / (h as f32).sqrt();
        let w = seeded_var(&varmap, "decoder.weight", (out, h), bound, &mut rng, device)?;
        let b = seeded_var(&varmap, "decoder.bias", (out,), bound, &mut rng, device)?;
        tracing::debug!(
            params = config.in_vocab_size * h + out * (h + 1),
            seed = config.seed,
            "Built bag-of-words baseline"
        );

        Ok(Self {
            embedder: Embedding::new(emb, h),
            decoder: Linear::new(w, Some(b)),
            varmap,
            config,
            device: device.clone(),
        })
    }

    pub fn config(&self) -> &BaselineConfig {
        &self.config
    }

    /// `(batch, max_equation_len, out_vocab)` logits.
    fn position_logits(&self, question: &Tensor) -> Result<Tensor> {
        let (b, l) = question.dims2()?;
        let rows = question.to_vec2::<u32>()?;
        let mut mask = Vec::with_capacity(b * l);
        let mut counts = Vec::with_capacity(b);
        for row in &rows {
            let kept = row.iter().filter(|&&t| t != self.config.in_pad).count();
            mask.extend(row.iter().map(|&t| if t == self.config.in_pad { 0f32 } else { 1f32 }));
            counts.push(kept.max(1) as f32);
        }
        let mask = Tensor::from_vec(mask, (b, l, 1), &self.device)?;
        let counts = Tensor::from_vec(counts, (b, 1), &self.device)?;

        let emb = self.embedder.forward(question)?;
        let pooled = emb.broadcast_mul(&mask)?.sum(1)?.broadcast_div(&counts)?;
        self.decoder
            .forward(&pooled)?
            .reshape((b, self.config.max_equation_len, self.config.out_vocab_size))
    }

    /// Logits for the first `equ_len` positions, flattened to rows.
    fn target_logits(&self, question: &Tensor, target: &Tensor) -> Result<Tensor> {
        let (b, t) = target.dims2()?;
        if t > self.config.max_equation_len {
            candle_core::bail!(
                "equation length {t} exceeds decoder capacity {}",
                self.config.max_equation_len
            );
        }
        self.position_logits(question)?
            .narrow(1, 0, t)?
            .reshape((b * t, self.config.out_vocab_size))
    }

    fn greedy(&self, question: &Tensor) -> Result<Vec<Vec<u32>>> {
        let ids = self.position_logits(question)?.argmax(D::Minus1)?.to_vec2::<u32>()?;
        Ok(ids
            .into_iter()
            .map(|mut row| {
                if let Some(eos) = self.config.out_eos {
                    if let Some(end) = row.iter().position(|&t| t == eos) {
                        row.truncate(end);
                    }
                }
                row
            })
            .collect())
    }
}

fn seeded_var(
    varmap: &VarMap,
    name: &str,
    shape: impl Into<candle_core::Shape>,
    bound: f32,
    rng: &mut StdRng,
    device: &Device,
) -> Result<Tensor> {
    let shape = shape.into();
    let values: Vec<f32> = (0..shape.elem_count()).map(|_| rng.gen_range(-bound..bound)).collect();
    let var = Var::from_tensor(&Tensor::from_vec(values, shape, device)?.to_dtype(DType::F32)?)?;
    let tensor = var.as_tensor().clone();
    varmap
        .data()
        .lock()
        .map_err(|_| candle_core::Error::Msg("var map lock poisoned".into()))?
        .insert(name.to_string(), var);
    Ok(tensor)
}

impl Trainable for BowSeq2Seq {
    fn varmap(&self) -> &VarMap {
        &self.varmap
    }

    /// No dropout: train and eval modes compute the same thing.
    fn set_training(&mut self, _training: bool) {}
}

impl Seq2SeqModel for BowSeq2Seq {
    fn forward_train(&self, question: &Tensor, _ques_len: &[usize], target: &Tensor) -> Result<Tensor> {
        ops::log_softmax(&self.target_logits(question, target)?, D::Minus1)
    }

    fn decode(&self, question: &Tensor, _ques_len: &[usize]) -> Result<Vec<Vec<u32>>> {
        self.greedy(question)
    }
}

impl TransformerModel for BowSeq2Seq {
    fn forward_logits(&self, question: &Tensor, target: &Tensor) -> Result<Tensor> {
        self.target_logits(question, target)
    }

    fn generate(&self, question: &Tensor) -> Result<Vec<Vec<u32>>> {
        self.greedy(question)
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> BaselineConfig {
        BaselineConfig {
            in_vocab_size: 6,
            out_vocab_size: 5,
            hidden_size: 4,
            max_equation_len: 3,
            in_pad: 0,
            out_eos: Some(1),
            seed: 7,
        }
    }

    #[test]
    fn forward_shapes() {
        let model = BowSeq2Seq::new(config(), &Device::Cpu).unwrap();
        let q = Tensor::new(&[[1u32, 2, 0], [3, 4, 5]], &Device::Cpu).unwrap();
        let t = Tensor::new(&[[1u32, 2], [3, 0]], &Device::Cpu).unwrap();
        let lp = model.forward_train(&q, &[2, 3], &t).unwrap();
        assert_eq!(lp.dims(), &[4, 5]);
        // Rows are log-probabilities.
        let sums = lp.exp().unwrap().sum(1).unwrap().to_vec1::<f32>().unwrap();
        for s in sums {
            assert!((s - 1.0).abs() < 1e-5);
        }
    }

    #[test]
    fn same_seed_same_weights() {
        let a = BowSeq2Seq::new(config(), &Device::Cpu).unwrap();
        let b = BowSeq2Seq::new(config(), &Device::Cpu).unwrap();
        let q = Tensor::new(&[[1u32, 2, 3]], &Device::Cpu).unwrap();
        let la = a.position_logits(&q).unwrap().flatten_all().unwrap().to_vec1::<f32>().unwrap();
        let lb = b.position_logits(&q).unwrap().flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert_eq!(la, lb);
    }

    #[test]
    fn parameters_are_prefixed() {
        let model = BowSeq2Seq::new(config(), &Device::Cpu).unwrap();
        let data = model.varmap().data().lock().unwrap();
        let mut names: Vec<_> = data.keys().cloned().collect();
        names.sort();
        assert_eq!(names, vec!["decoder.bias", "decoder.weight", "embedder.weight"]);
    }

    #[test]
    fn target_longer_than_capacity_fails() {
        let model = BowSeq2Seq::new(config(), &Device::Cpu).unwrap();
        let q = Tensor::new(&[[1u32]], &Device::Cpu).unwrap();
        let t = Tensor::new(&[[1u32, 2, 3, 4]], &Device::Cpu).unwrap();
        assert!(model.forward_logits(&q, &t).is_err());
    }

    #[test]
    fn decode_stops_at_eos() {
        let model = BowSeq2Seq::new(config(), &Device::Cpu).unwrap();
        let q = Tensor::new(&[[1u32, 2], [3, 0]], &Device::Cpu).unwrap();
        for row in model.decode(&q, &[2, 1]).unwrap() {
            assert!(row.len() <= 3);
            assert!(!row.contains(&1));
        }
    }
}
