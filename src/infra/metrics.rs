// ============================================================
// Layer 6 - Metrics Logger
// ============================================================
// Records fine-tuning metrics to a CSV file after each epoch.
//
// Metrics recorded per epoch:
//   - epoch:      the epoch number (1, 2, 3, ...)
//   - step:       optimizer steps taken so far
//   - train_loss: mean next-token loss over the epoch's batches
//   - eval_loss:  token-weighted next-token loss on the test split
//   - lr:         learning rate the schedule gives for the next step
//
// Output file: {output_dir}/metrics.csv
//
// Example CSV output:
//   epoch,step,train_loss,eval_loss,lr
//   1,250,1.912300,1.701200,0.000150
//   2,500,1.204100,1.388900,0.000000
//
// Reference: Rust Book §12 (I/O and File Handling)

use anyhow::{Context, Result};
use std::{
    fs::{self, OpenOptions},
    io::Write,
    path::{Path, PathBuf},
};
use serde::{Deserialize, Serialize};

pub const METRICS_FILE: &str = "metrics.csv";
const HEADER: &str = "epoch,step,train_loss,eval_loss,lr";

/// One row of metrics data for a single epoch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpochMetrics {
    /// The epoch number (starts at 1)
    pub epoch: usize,

    /// Optimizer steps completed at the end of this epoch
    pub step: usize,

    /// Average loss over the epoch's training batches
    pub train_loss: f64,

    /// Loss on the held-out split; NaN when the split is empty
    pub eval_loss: f64,

    pub lr: f64,
}

impl EpochMetrics {
    pub fn new(epoch: usize, step: usize, train_loss: f64, eval_loss: f64, lr: f64) -> Self {
        Self { epoch, step, train_loss, eval_loss, lr }
    }
}

/// Appends epoch metrics to a CSV file.
pub struct MetricsLogger {
    csv_path: PathBuf,
}

impl MetricsLogger {
    /// Writes the CSV header if the file doesn't exist yet, so repeated
    /// runs into the same directory keep appending.
    pub fn new(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)
            .with_context(|| format!("Cannot create '{}'", dir.display()))?;

        let csv_path = dir.join(METRICS_FILE);
        if !csv_path.exists() {
            let mut f = fs::File::create(&csv_path)
                .with_context(|| format!("Cannot create '{}'", csv_path.display()))?;
            writeln!(f, "{HEADER}")?;
            tracing::debug!("Created metrics CSV: '{}'", csv_path.display());
        }

        Ok(Self { csv_path })
    }

    pub fn log(&self, m: &EpochMetrics) -> Result<()> {
        let mut f = OpenOptions::new()
            .append(true)
            .open(&self.csv_path)
            .with_context(|| format!("Cannot open '{}'", self.csv_path.display()))?;

        writeln!(
            f,
            "{},{},{:.6},{:.6},{:.6e}",
            m.epoch, m.step, m.train_loss, m.eval_loss, m.lr,
        )?;

        tracing::debug!(
            "Logged epoch {} metrics: train_loss={:.4}, eval_loss={:.4}",
            m.epoch, m.train_loss, m.eval_loss,
        );
        Ok(())
    }

    pub fn csv_path(&self) -> &Path {
        &self.csv_path
    }
}
