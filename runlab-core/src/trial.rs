//! Trial metadata — one advisory record per run start.
//!
//! The engine never reads trials back; they exist so that a human can tell
//! which code and which comment produced a checkpoint.

use crate::error::TrialError;
use crate::persistence::atomic_write_yaml;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// One run of an experiment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trial {
    pub started_at: DateTime<Utc>,
    pub comment: String,
    /// What was run, e.g. the binary and subcommand.
    pub entry_point: String,
    /// Commit checked out when the run started.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit: Option<String>,
    /// Whether the working tree had uncommitted changes.
    pub is_dirty: bool,
    /// Global step the run started from.
    pub start_step: u64,
    /// Latest printed summary values.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub progress: BTreeMap<String, f64>,
}

impl Trial {
    pub fn new(comment: impl Into<String>, entry_point: impl Into<String>, is_dirty: bool) -> Self {
        Self {
            started_at: Utc::now(),
            comment: comment.into(),
            entry_point: entry_point.into(),
            commit: None,
            is_dirty,
            start_step: 0,
            progress: BTreeMap::new(),
        }
    }

    pub fn with_commit(mut self, commit: impl Into<String>) -> Self {
        self.commit = Some(commit.into());
        self
    }

    pub fn with_start_step(mut self, step: u64) -> Self {
        self.start_step = step;
        self
    }
}

/// Destination of trial records.
pub trait TrialRecorder: Send {
    /// Record the start of a run.
    fn record(&mut self, trial: &Trial) -> Result<(), TrialError>;

    /// Replace the progress table of the run recorded last.
    fn save_progress(&mut self, progress: BTreeMap<String, f64>) -> Result<(), TrialError>;
}

/// Trials appended to a YAML list on disk.
#[derive(Debug, Clone)]
pub struct YamlTrialLog {
    path: PathBuf,
    started: bool,
}

impl YamlTrialLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            started: false,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// All recorded trials, oldest first.
    pub fn trials(&self) -> Result<Vec<Trial>, TrialError> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        if content.trim().is_empty() {
            return Ok(Vec::new());
        }
        serde_yaml::from_str(&content).map_err(|e| TrialError::Malformed {
            path: self.path.clone(),
            message: e.to_string(),
        })
    }

    fn store(&self, trials: &[Trial]) -> Result<(), TrialError> {
        atomic_write_yaml(&self.path, &trials)?;
        Ok(())
    }
}

impl TrialRecorder for YamlTrialLog {
    fn record(&mut self, trial: &Trial) -> Result<(), TrialError> {
        let mut trials = self.trials()?;
        trials.push(trial.clone());
        self.store(&trials)?;
        self.started = true;
        tracing::debug!(path = %self.path.display(), trials = trials.len(), "Trial recorded");
        Ok(())
    }

    fn save_progress(&mut self, progress: BTreeMap<String, f64>) -> Result<(), TrialError> {
        if !self.started {
            return Err(TrialError::NotStarted);
        }
        let mut trials = self.trials()?;
        let last = trials.last_mut().ok_or(TrialError::NotStarted)?;
        last.progress = progress;
        self.store(&trials)
    }
}
