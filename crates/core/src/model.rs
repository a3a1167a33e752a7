//! Model capability traits, one per training paradigm.
//!
//! Architectures are opaque to the trainers: they only see these traits.
//! Parameters live in a [`VarMap`] and are named with submodule prefixes
//! (`embedder.*`, `generator.*`, ...) so optimiser groups can partition them.

use candle_core::{Result, Tensor};
use candle_nn::VarMap;

use mwp_common::Batch;

/// Submodule prefixes of a tree-decoder model, in optimiser order.
pub const TREE_SUBMODULES: [&str; 5] = ["embedder", "encoder", "decoder", "node_generator", "merge"];

/// Prefix of generator parameters in an adversarial model.
pub const GENERATOR_PREFIX: &str = "generator";
/// Prefix of discriminator parameters in an adversarial model.
pub const DISCRIMINATOR_PREFIX: &str = "discriminator";

// ── Base ────────────────────────────────────────────────────────────────────

/// Anything with parameters and a train/eval switch.
pub trait Trainable {
    fn varmap(&self) -> &VarMap;
    /// Switch dropout-like behaviour on or off for every submodule.
    fn set_training(&mut self, training: bool);
}

// ── Seq2seq ─────────────────────────────────────────────────────────────────

/// Teacher-forced encoder/decoder over fixed output vocabularies.
pub trait Seq2SeqModel: Trainable {
    /// `(batch * equ_len, out_vocab)` log-probabilities for `target`.
    fn forward_train(&self, question: &Tensor, ques_len: &[usize], target: &Tensor) -> Result<Tensor>;

    /// Greedy decode, one output-vocabulary row per example.
    fn decode(&self, question: &Tensor, ques_len: &[usize]) -> Result<Vec<Vec<u32>>>;
}

// ── Transformer ─────────────────────────────────────────────────────────────

/// Encoder/decoder that returns raw logits and needs no length side-input.
pub trait TransformerModel: Trainable {
    /// `(batch * equ_len, out_vocab)` unnormalised logits.
    fn forward_logits(&self, question: &Tensor, target: &Tensor) -> Result<Tensor>;

    fn generate(&self, question: &Tensor) -> Result<Vec<Vec<u32>>>;
}

// ── Tree decoder ────────────────────────────────────────────────────────────

/// Vocabulary facts the tree decoder needs on every call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeContext {
    /// First output index of a number placeholder.
    pub num_start: usize,
    /// Output indices of constants the decoder may generate.
    pub generate_nums: Vec<u32>,
    /// Output index of `<UNK>`.
    pub unk: u32,
}

/// Goal-driven tree decoder built from the five [`TREE_SUBMODULES`].
///
/// Tree construction is per example, so every call receives a batch of one.
pub trait TreeModel: Trainable {
    /// `(1, equ_len, out_vocab)` logits under teacher forcing.
    fn forward_train(&self, batch: &Batch, ctx: &TreeContext) -> Result<Tensor>;

    /// Prefix-order output indices for the single example.
    fn decode(&self, batch: &Batch, ctx: &TreeContext) -> Result<Vec<u32>>;
}

// ── Adversarial ─────────────────────────────────────────────────────────────

/// One generator sample with Monte-Carlo continuations.
#[derive(Debug, Clone)]
pub struct GeneratorRollout {
    /// `(batch, steps)` sampled output ids.
    pub tokens: Tensor,
    /// Per step: `(batch * rollouts, steps)` completed sequences whose prefix
    /// up to that step equals `tokens`. Rows are grouped by example: rows
    /// `i * rollouts .. (i + 1) * rollouts` continue example `i`.
    pub rollouts: Vec<Tensor>,
    /// Per step: `(batch,)` log-probability of the sampled token.
    pub token_log_probs: Vec<Tensor>,
}

/// Generator + discriminator pair (SeqGAN).
pub trait GanModel: Trainable {
    fn set_generator_training(&mut self, training: bool);
    fn set_discriminator_training(&mut self, training: bool);

    /// `(batch * equ_len, out_vocab)` generator log-probabilities for `target`.
    fn generator_forward(&self, question: &Tensor, ques_len: &[usize], target: &Tensor) -> Result<Tensor>;

    /// `(batch, steps)` greedy generator output.
    fn generate(&self, question: &Tensor, ques_len: &[usize]) -> Result<Tensor>;

    /// Sample a sequence and roll out every prefix.
    fn sample_with_rollouts(&self, question: &Tensor, ques_len: &[usize]) -> Result<GeneratorRollout>;

    /// Probability, per row of `sequences`, that the row is real.
    fn discriminate(&self, sequences: &Tensor) -> Result<Tensor>;

    /// `‖W_O‖ + ‖b_O‖` of the discriminator output layer, as a scalar tensor.
    fn discriminator_output_norm(&self) -> Result<Tensor>;
}

// ── Source-augmented ────────────────────────────────────────────────────────

/// Language-model style model working on source text.
///
/// The model tokenises internally, so it returns targets aligned with its own
/// segmentation.
pub trait SourceModel: Trainable {
    /// `(tokens, vocab)` logits and the `(tokens,)` aligned u32 targets.
    fn forward_aligned(&self, ques_source: &[String], equ_source: &[String]) -> Result<(Tensor, Tensor)>;

    /// Predicted equation text per question.
    fn generate(&self, ques_source: &[String]) -> Result<Vec<String>>;

    /// Target id that carries no loss.
    fn pad_token_id(&self) -> u32;
}
