//! Failed-batch spool
//!
//! Append-only JSON-lines file holding batches that exceeded their retry
//! budget. Spooled batches are replayed on the next start; because replay
//! may duplicate points that were actually written before a crash, the raw
//! bucket's duplicate tolerance covers the window.
//!
//! Spool corruption is fatal: the process exits non-zero and a supervisor
//! restart is expected.

use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use tracing::{info, warn};

use haflow_common::error::{Error, Result};
use haflow_common::Point;

/// One spooled batch
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SpooledBatch {
    pub measurement: String,
    pub batch_id: String,
    pub points: Vec<Point>,
}

/// Per-bucket spool file
pub struct Spool {
    path: PathBuf,
}

impl Spool {
    /// Open (creating the directory if needed) the spool for one bucket
    pub fn open(dir: &str, bucket: &str) -> Result<Self> {
        fs::create_dir_all(dir)?;
        Ok(Self {
            path: PathBuf::from(dir).join(format!("{bucket}.spool.jsonl")),
        })
    }

    /// Append one batch
    pub fn append(&self, batch: &SpooledBatch) -> Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        let line = serde_json::to_string(batch)?;
        writeln!(file, "{line}")?;
        file.sync_data()?;
        Ok(())
    }

    /// Load every spooled batch, leaving the file in place until
    /// [`Spool::rewrite`] confirms what is still outstanding.
    ///
    /// An unparseable line means the spool is corrupt; that error is fatal
    /// to the process.
    pub fn load_all(&self) -> Result<Vec<SpooledBatch>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }

        let reader = BufReader::new(File::open(&self.path)?);
        let mut batches = Vec::new();
        for (number, line) in reader.lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let batch: SpooledBatch = serde_json::from_str(&line).map_err(|e| {
                Error::SpoolCorrupt(format!(
                    "{} line {}: {e}",
                    self.path.display(),
                    number + 1
                ))
            })?;
            batches.push(batch);
        }

        if !batches.is_empty() {
            info!(
                batches = batches.len(),
                path = %self.path.display(),
                "replaying spooled batches"
            );
        }
        Ok(batches)
    }

    /// Atomically replace the spool contents with the given batches
    /// (typically the ones that failed again during replay)
    pub fn rewrite(&self, remaining: &[SpooledBatch]) -> Result<()> {
        let tmp = self.path.with_extension("tmp");
        {
            let mut file = File::create(&tmp)?;
            for batch in remaining {
                let line = serde_json::to_string(batch)?;
                writeln!(file, "{line}")?;
            }
            file.sync_data()?;
        }
        fs::rename(&tmp, &self.path)?;

        if !remaining.is_empty() {
            warn!(
                batches = remaining.len(),
                "spool rewritten with unresolved batches"
            );
        }
        Ok(())
    }
}
