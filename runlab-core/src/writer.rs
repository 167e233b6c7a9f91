//! Metric writers — the artifact sink for per-step aggregates.
//!
//! Every `write` hands a [`StepRecord`] to each registered writer before the
//! step buffers are cleared. Unlike the console summary, the record includes
//! unprinted indicators and the full histogram distributions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

/// Aggregates of one `write` call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    pub step: u64,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub scalars: BTreeMap<String, f64>,
    #[serde(default)]
    pub histograms: BTreeMap<String, Vec<f64>>,
}

impl StepRecord {
    pub fn new(step: u64) -> Self {
        Self {
            step,
            timestamp: Utc::now(),
            scalars: BTreeMap::new(),
            histograms: BTreeMap::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.scalars.is_empty() && self.histograms.is_empty()
    }
}

/// Receiver of step records.
pub trait MetricWriter: Send {
    fn write_step(&mut self, record: &StepRecord) -> io::Result<()>;

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }

    /// Discard everything written so far, for a run that starts over.
    fn clear(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Appends one JSON object per step to a file.
pub struct JsonlMetricWriter {
    path: PathBuf,
    out: BufWriter<File>,
}

impl JsonlMetricWriter {
    /// Open `path` for appending, creating parent directories as needed.
    pub fn open(path: &Path) -> io::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = File::options().create(true).append(true).open(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            out: BufWriter::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl MetricWriter for JsonlMetricWriter {
    fn write_step(&mut self, record: &StepRecord) -> io::Result<()> {
        if record.is_empty() {
            return Ok(());
        }
        serde_json::to_writer(&mut self.out, record).map_err(io::Error::other)?;
        self.out.write_all(b"\n")?;
        self.out.flush()
    }

    fn flush(&mut self) -> io::Result<()> {
        self.out.flush()
    }

    fn clear(&mut self) -> io::Result<()> {
        self.out.flush()?;
        // Appends land at the new end of file.
        self.out.get_ref().set_len(0)
    }
}

/// Read back every record of a JSON-lines metric file.
pub fn read_jsonl(path: &Path) -> io::Result<Vec<StepRecord>> {
    let content = std::fs::read_to_string(path)?;
    content
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| {
            serde_json::from_str(line).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
        })
        .collect()
}
