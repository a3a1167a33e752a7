//! Vocabulary metadata and input→output re-indexing.
//!
//! When input and output vocabularies are shared, target equations arrive as
//! input-vocabulary indices. [`VocabBridge`] precomputes the
//! `in index → word → out index` table once so the per-batch translation is a
//! single slice lookup.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Padding symbol present in both vocabularies.
pub const PAD_TOKEN: &str = "<PAD>";
/// Unknown-symbol marker of the output vocabulary.
pub const UNK_TOKEN: &str = "<UNK>";
/// End-of-equation marker.
pub const EOS_TOKEN: &str = "<EOS>";
/// Separator between equations of a multi-equation target.
pub const BRIDGE_TOKEN: &str = "<BRG>";

/// Errors raised while translating between vocabularies.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum VocabError {
    /// The word behind an input index has no entry in the output vocabulary.
    #[error("unknown token `{word}` (input index {index}) in output vocabulary")]
    UnknownToken { index: u32, word: String },
    /// The index is outside the input vocabulary.
    #[error("input index {index} out of range for vocabulary of {size}")]
    IndexOutOfRange { index: u32, size: usize },
    /// A required special symbol is missing.
    #[error("symbol `{0}` missing from output vocabulary")]
    MissingSymbol(String),
}

// ── Dataset metadata ────────────────────────────────────────────────────────

/// Static vocabulary maps exposed by a data loader.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DatasetMeta {
    /// Input vocabulary, position = index.
    pub in_idx2word: Vec<String>,
    /// Output vocabulary, position = index.
    pub out_idx2symbol: Vec<String>,
    /// First output index that denotes a number placeholder.
    #[serde(default)]
    pub num_start: usize,
    /// Constants the tree decoder may generate without copying from the text.
    #[serde(default)]
    pub generate_list: Vec<String>,
    #[serde(skip)]
    out_symbol2idx: HashMap<String, u32>,
}

impl DatasetMeta {
    pub fn new(
        in_idx2word: Vec<String>,
        out_idx2symbol: Vec<String>,
        num_start: usize,
        generate_list: Vec<String>,
    ) -> Self {
        let mut meta = Self {
            in_idx2word,
            out_idx2symbol,
            num_start,
            generate_list,
            out_symbol2idx: HashMap::new(),
        };
        meta.rebuild_index();
        meta
    }

    /// Rebuild the symbol → index map (needed after deserialisation).
    pub fn rebuild_index(&mut self) {
        self.out_symbol2idx = self
            .out_idx2symbol
            .iter()
            .enumerate()
            .map(|(i, s)| (s.clone(), i as u32))
            .collect();
    }

    pub fn out_symbol2idx(&self) -> &HashMap<String, u32> {
        &self.out_symbol2idx
    }

    pub fn out_index(&self, symbol: &str) -> Option<u32> {
        self.out_symbol2idx.get(symbol).copied()
    }

    /// Output index of `<UNK>`.
    pub fn out_unk_token(&self) -> Result<u32, VocabError> {
        self.required(UNK_TOKEN)
    }

    /// Output index of `<PAD>`.
    pub fn out_pad_token(&self) -> Result<u32, VocabError> {
        self.required(PAD_TOKEN)
    }

    /// Input index of `<PAD>`, defaulting to 0.
    pub fn in_pad_token(&self) -> u32 {
        self.in_idx2word
            .iter()
            .position(|w| w == PAD_TOKEN)
            .map_or(0, |i| i as u32)
    }

    /// Output indices of the generable constants, in `generate_list` order.
    pub fn generate_nums(&self) -> Result<Vec<u32>, VocabError> {
        self.generate_list.iter().map(|s| self.required(s)).collect()
    }

    fn required(&self, symbol: &str) -> Result<u32, VocabError> {
        self.out_index(symbol)
            .ok_or_else(|| VocabError::MissingSymbol(symbol.to_string()))
    }
}

// ── VocabBridge ─────────────────────────────────────────────────────────────

/// Precomputed input-index → output-index table.
///
/// Words without an output counterpart are stored as `None`; they only fail
/// when a target actually contains them, since question-only words are
/// legitimately absent from the output vocabulary.
#[derive(Debug, Clone)]
pub struct VocabBridge {
    table: Vec<Option<u32>>,
    in_words: Vec<String>,
}

impl VocabBridge {
    pub fn new(meta: &DatasetMeta) -> Self {
        let table = meta
            .in_idx2word
            .iter()
            .map(|word| meta.out_index(word))
            .collect();
        Self {
            table,
            in_words: meta.in_idx2word.clone(),
        }
    }

    pub fn translate(&self, index: u32) -> Result<u32, VocabError> {
        match self.table.get(index as usize) {
            Some(Some(out)) => Ok(*out),
            Some(None) => Err(VocabError::UnknownToken {
                index,
                word: self.in_words[index as usize].clone(),
            }),
            None => Err(VocabError::IndexOutOfRange {
                index,
                size: self.table.len(),
            }),
        }
    }

    /// Translate one equation.
    pub fn reindex(&self, tokens: &[u32]) -> Result<Vec<u32>, VocabError> {
        tokens.iter().map(|&t| self.translate(t)).collect()
    }

    /// Translate a batch of equations.
    pub fn reindex_batch(&self, rows: &[Vec<u32>]) -> Result<Vec<Vec<u32>>, VocabError> {
        rows.iter().map(|row| self.reindex(row)).collect()
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
