//! Append-only log of per-attempt outcomes.
//!
//! Every component that records an outcome does so through this object;
//! there is no module-level shared list. The whole file is rewritten after
//! each append; no partial-append protocol.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::models::ResultRecord;

pub struct ResultLog {
    path: PathBuf,
    records: Vec<ResultRecord>,
}

impl ResultLog {
    /// Open (or start) the log at `path`. An existing file is loaded so a
    /// rerun on the same day extends the same log.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let records = match std::fs::read_to_string(&path) {
            Ok(content) => serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse result log: {}", path.display()))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("Failed to read result log: {}", path.display()))
            }
        };
        Ok(Self { path, records })
    }

    pub fn append(&mut self, record: ResultRecord) -> Result<()> {
        self.records.push(record);
        self.flush()
    }

    pub fn records(&self) -> &[ResultRecord] {
        &self.records
    }

    fn flush(&self) -> Result<()> {
        let content =
            serde_json::to_string_pretty(&self.records).context("Failed to serialize result log")?;
        std::fs::write(&self.path, content)
            .with_context(|| format!("Failed to write result log: {}", self.path.display()))?;
        Ok(())
    }
}
