//! Data pipeline: pre-tokenised examples, padded batches, split loaders.
//!
//! Examples arrive already tokenised (one JSON object per line). Batches keep
//! token ids on the host as padded rows; trainers turn them into tensors with
//! [`Batch::question_tensor`] / [`Batch::equation_tensor`] on their own device.
//!
//! * **[`Batch`]** — the fixed-key record every trainer variant consumes.
//! * **[`DataLoader`]** — split iterators + vocabulary metadata.
//! * **[`JsonlDataLoader`]** — in-memory loader over `train/valid/test.jsonl`.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use anyhow::{Context, Result as AnyhowResult};
use candle_core::{Device, Result, Tensor};
use serde::{Deserialize, Serialize};

use crate::vocab::DatasetMeta;

// ── Splits ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataSplit {
    Train,
    Valid,
    Test,
}

impl DataSplit {
    pub fn name(self) -> &'static str {
        match self {
            Self::Train => "train",
            Self::Valid => "valid",
            Self::Test => "test",
        }
    }
}

impl std::fmt::Display for DataSplit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

// ── Example ─────────────────────────────────────────────────────────────────

/// One pre-tokenised problem as stored on disk.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Example {
    /// Question token ids (input vocabulary).
    pub question: Vec<u32>,
    /// Target equation ids (output vocabulary, or input vocabulary when shared).
    pub equation: Vec<u32>,
    /// Surface form of every number in the question, in order.
    #[serde(default)]
    pub num_list: Vec<String>,
    /// Question positions of the numbers.
    #[serde(default)]
    pub num_pos: Vec<usize>,
    /// For each unresolved target number, the candidate `num_list` positions.
    #[serde(default)]
    pub num_stack: Vec<Vec<usize>>,
    #[serde(default)]
    pub ques_source: String,
    #[serde(default)]
    pub equ_source: String,
}

// ── Batch ───────────────────────────────────────────────────────────────────

/// A padded batch. Row `i` of every field belongs to example `i`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Batch {
    pub question: Vec<Vec<u32>>,
    pub ques_len: Vec<usize>,
    pub equation: Vec<Vec<u32>>,
    pub equ_len: Vec<usize>,
    pub num_list: Vec<Vec<String>>,
    pub num_pos: Vec<Vec<usize>>,
    pub num_stack: Vec<Vec<Vec<usize>>>,
    pub num_size: Vec<usize>,
    pub ques_source: Vec<String>,
    pub equ_source: Vec<String>,
}

impl Batch {
    /// Pad `examples` into one batch.
    pub fn from_examples(examples: &[Example], question_pad: u32, equation_pad: u32) -> Self {
        let ques_max = examples.iter().map(|e| e.question.len()).max().unwrap_or(0);
        let equ_max = examples.iter().map(|e| e.equation.len()).max().unwrap_or(0);
        let mut batch = Self::default();
        for ex in examples {
            batch.question.push(pad_row(&ex.question, ques_max, question_pad));
            batch.ques_len.push(ex.question.len());
            batch.equation.push(pad_row(&ex.equation, equ_max, equation_pad));
            batch.equ_len.push(ex.equation.len());
            batch.num_list.push(ex.num_list.clone());
            batch.num_pos.push(ex.num_pos.clone());
            batch.num_stack.push(ex.num_stack.clone());
            batch.num_size.push(ex.num_list.len());
            batch.ques_source.push(ex.ques_source.clone());
            batch.equ_source.push(ex.equ_source.clone());
        }
        batch
    }

    pub fn len(&self) -> usize {
        self.question.len()
    }

    pub fn is_empty(&self) -> bool {
        self.question.is_empty()
    }

    /// Example `i` as a batch of one, with padding trimmed to its lengths.
    pub fn row(&self, i: usize) -> Option<Self> {
        if i >= self.len() {
            return None;
        }
        Some(Self {
            question: vec![self.question[i][..self.ques_len[i]].to_vec()],
            ques_len: vec![self.ques_len[i]],
            equation: vec![self.equation[i][..self.equ_len[i]].to_vec()],
            equ_len: vec![self.equ_len[i]],
            num_list: vec![self.num_list[i].clone()],
            num_pos: vec![self.num_pos[i].clone()],
            num_stack: vec![self.num_stack[i].clone()],
            num_size: vec![self.num_size[i]],
            ques_source: vec![self.ques_source[i].clone()],
            equ_source: vec![self.equ_source[i].clone()],
        })
    }

    /// Questions as a `(batch, max_ques_len)` u32 tensor.
    pub fn question_tensor(&self, device: &Device) -> Result<Tensor> {
        rows_to_tensor(&self.question, device)
    }

    /// Equations as a `(batch, max_equ_len)` u32 tensor.
    pub fn equation_tensor(&self, device: &Device) -> Result<Tensor> {
        rows_to_tensor(&self.equation, device)
    }

    /// `(batch, max_equ_len)` f32 mask: 1 inside each equation, 0 on padding.
    pub fn equation_mask(&self, device: &Device) -> Result<Tensor> {
        let width = self.equation.first().map_or(0, Vec::len);
        let mut mask = Vec::with_capacity(self.len() * width);
        for &len in &self.equ_len {
            mask.extend((0..width).map(|t| if t < len { 1f32 } else { 0f32 }));
        }
        Tensor::from_vec(mask, (self.len(), width), device)
    }
}

fn pad_row(row: &[u32], width: usize, pad: u32) -> Vec<u32> {
    let mut out = row.to_vec();
    out.resize(width, pad);
    out
}

/// Rectangular u32 rows → `(rows, cols)` tensor.
pub fn rows_to_tensor(rows: &[Vec<u32>], device: &Device) -> Result<Tensor> {
    let width = rows.first().map_or(0, Vec::len);
    if let Some(bad) = rows.iter().find(|r| r.len() != width) {
        return Err(candle_core::Error::Msg(format!(
            "ragged batch: row of length {} in batch of width {width}",
            bad.len()
        )));
    }
    let flat: Vec<u32> = rows.iter().flatten().copied().collect();
    Tensor::from_vec(flat, (rows.len(), width), device)
}

// ── DataLoader ──────────────────────────────────────────────────────────────

/// Read-only source of batches and vocabulary metadata.
pub trait DataLoader {
    /// Batches of one split, in a fixed order.
    fn load_data(&self, split: DataSplit) -> Box<dyn Iterator<Item = Batch> + '_>;
    /// Number of training examples.
    fn trainset_nums(&self) -> usize;
    fn meta(&self) -> &DatasetMeta;
}

/// In-memory loader over pre-tokenised JSONL splits.
///
/// Directory layout: `meta.json`, `train.jsonl`, `valid.jsonl`, `test.jsonl`.
/// A missing split file is treated as an empty split.
pub struct JsonlDataLoader {
    meta: DatasetMeta,
    train: Vec<Batch>,
    valid: Vec<Batch>,
    test: Vec<Batch>,
    trainset_nums: usize,
}

impl JsonlDataLoader {
    pub fn open(dir: &Path, batch_size: usize, share_vocab: bool) -> AnyhowResult<Self> {
        let meta_path = dir.join("meta.json");
        let json = std::fs::read_to_string(&meta_path)
            .with_context(|| format!("read {}", meta_path.display()))?;
        let mut meta: DatasetMeta = serde_json::from_str(&json).context("parse meta.json")?;
        meta.rebuild_index();

        let train = read_examples(&dir.join("train.jsonl"))?;
        let valid = read_examples(&dir.join("valid.jsonl"))?;
        let test = read_examples(&dir.join("test.jsonl"))?;
        tracing::info!(
            train = train.len(),
            valid = valid.len(),
            test = test.len(),
            dir = %dir.display(),
            "Loaded dataset"
        );
        Self::from_examples(meta, train, valid, test, batch_size, share_vocab)
    }

    /// Batch already-parsed examples. Targets are padded with the input
    /// `<PAD>` id when vocabularies are shared.
    pub fn from_examples(
        meta: DatasetMeta,
        train: Vec<Example>,
        valid: Vec<Example>,
        test: Vec<Example>,
        batch_size: usize,
        share_vocab: bool,
    ) -> AnyhowResult<Self> {
        anyhow::ensure!(batch_size > 0, "batch_size must be positive");
        let question_pad = meta.in_pad_token();
        let equation_pad = if share_vocab {
            question_pad
        } else {
            meta.out_pad_token()?
        };
        let batch = |examples: &[Example]| -> Vec<Batch> {
            examples
                .chunks(batch_size)
                .map(|chunk| Batch::from_examples(chunk, question_pad, equation_pad))
                .collect()
        };
        Ok(Self {
            trainset_nums: train.len(),
            train: batch(&train),
            valid: batch(&valid),
            test: batch(&test),
            meta,
        })
    }

    fn split(&self, split: DataSplit) -> &[Batch] {
        match split {
            DataSplit::Train => &self.train,
            DataSplit::Valid => &self.valid,
            DataSplit::Test => &self.test,
        }
    }
}

impl DataLoader for JsonlDataLoader {
    fn load_data(&self, split: DataSplit) -> Box<dyn Iterator<Item = Batch> + '_> {
        Box::new(self.split(split).iter().cloned())
    }

    fn trainset_nums(&self) -> usize {
        self.trainset_nums
    }

    fn meta(&self) -> &DatasetMeta {
        &self.meta
    }
}

fn read_examples(path: &Path) -> AnyhowResult<Vec<Example>> {
    if !path.exists() {
        tracing::warn!(path = %path.display(), "split file missing, treating as empty");
        return Ok(Vec::new());
    }
    let reader = BufReader::new(File::open(path).context("open split file")?);
    let mut examples = Vec::new();
    for (lineno, line) in reader.lines().enumerate() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let example: Example = serde_json::from_str(line)
            .with_context(|| format!("{}:{}", path.display(), lineno + 1))?;
        examples.push(example);
    }
    Ok(examples)
}

// ── Tests ───────────────────────────────────────────────────────────────────
