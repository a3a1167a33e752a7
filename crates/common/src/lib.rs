//! # mwp-common — Shared Primitives
//!
//! Types and utilities shared across every crate in the workspace:
//!
//! * **[`TrainingConfig`]** — run options (serialised as JSON).
//! * **[`Batch`]** / **[`DataLoader`]** / **[`JsonlDataLoader`]** — padded
//!   batches and split iterators.
//! * **[`DatasetMeta`]** / **[`VocabBridge`]** — vocabularies and the
//!   precomputed shared-vocabulary re-indexing table.

pub mod config;
pub mod data;
pub mod vocab;

pub use config::TrainingConfig;
pub use data::{rows_to_tensor, Batch, DataLoader, DataSplit, Example, JsonlDataLoader};
pub use vocab::{
    DatasetMeta, VocabBridge, VocabError, BRIDGE_TOKEN, EOS_TOKEN, PAD_TOKEN, UNK_TOKEN,
};
