//! # mwp-core — Models and Judges
//!
//! Everything a trainer talks to besides data and optimisers:
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`model`] | capability traits per paradigm (`Seq2SeqModel`, `TreeModel`, `GanModel`, ...) |
//! | [`baseline`] | `BowSeq2Seq`, a seeded bag-of-words seq2seq model |
//! | [`evaluator`] | `EquationEvaluator` contract, `PrefixEvaluator`, `Verdict` |
//!
//! ## Design principles
//!
//! 1. **Architectures are opaque.** Trainers only see the traits in [`model`];
//!    parameters are reached through the model's `VarMap` and its name prefixes.
//! 2. **Deterministic.** Same config + same seed = same weights = same output.

pub mod baseline;
pub mod evaluator;
pub mod model;

// ── Public re-exports ───────────────────────────────────────────────────────

pub use baseline::{BaselineConfig, BowSeq2Seq};
pub use evaluator::{EquationEvaluator, PrefixEvaluator, Verdict};
pub use model::{
    GanModel, GeneratorRollout, Seq2SeqModel, SourceModel, Trainable, TransformerModel, TreeContext,
    TreeModel, DISCRIMINATOR_PREFIX, GENERATOR_PREFIX, TREE_SUBMODULES,
};
