//! Per-evaluation CSV log.
//!
//! One row per evaluated epoch. The file is appended to, so a resumed run
//! continues the log of the run it resumed.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;

use crate::error::Result;
use crate::runner::{EpochReport, EvalReport};

const HEADER: &str = "epoch,avg_loss,valid_equ_acc,valid_value_acc,test_equ_acc,test_value_acc";

pub struct MetricsLog {
    out: BufWriter<File>,
}

impl MetricsLog {
    /// Open `path` for appending, writing the header if the file is new.
    pub fn create(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let fresh = std::fs::metadata(path).map_or(true, |m| m.len() == 0);
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let mut out = BufWriter::new(file);
        if fresh {
            writeln!(out, "{HEADER}")?;
            out.flush()?;
        }
        Ok(Self { out })
    }

    pub fn record(&mut self, epoch: usize, train: &EpochReport, valid: &EvalReport, test: &EvalReport) -> Result<()> {
        writeln!(
            self.out,
            "{epoch},{:.6},{:.4},{:.4},{:.4},{:.4}",
            train.avg_loss(),
            valid.equation_accuracy,
            valid.value_accuracy,
            test.equation_accuracy,
            test.value_accuracy
        )?;
        self.out.flush()?;
        Ok(())
    }
}
