//! Experiment — a named run directory tying checkpoints, trials and metrics
//! to a tracker.
//!
//! ```text
//! <root>/<name>/checkpoints/   CheckpointStore
//! <root>/<name>/trials.yaml    one Trial per start_train
//! <root>/<name>/metrics.jsonl  one StepRecord per write
//! ```

use crate::checkpoint::{CheckpointStore, RestorePolicy, ValueSink, ValueSource};
use crate::error::{ConfigError, Result, TrialError};
use crate::section::SectionOptions;
use crate::tracker::Tracker;
use crate::trial::{Trial, TrialRecorder, YamlTrialLog};
use crate::writer::JsonlMetricWriter;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

pub const CHECKPOINT_DIR: &str = "checkpoints";
pub const TRIALS_FILE: &str = "trials.yaml";
pub const METRICS_FILE: &str = "metrics.jsonl";

pub struct Experiment {
    name: String,
    dir: PathBuf,
    tracker: Tracker,
    checkpoints: CheckpointStore,
    recorder: Box<dyn TrialRecorder>,
    trial: Trial,
    check_repo_dirty: bool,
}

impl std::fmt::Debug for Experiment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Experiment")
            .field("name", &self.name)
            .field("dir", &self.dir)
            .field("trial", &self.trial)
            .finish_non_exhaustive()
    }
}

impl Experiment {
    /// Open (creating if needed) the experiment `name` under `root` and attach
    /// its metric file to `tracker`.
    pub fn open(root: &Path, name: &str, tracker: Tracker) -> Result<Self> {
        validate_name(name)?;
        let dir = root.join(name);
        std::fs::create_dir_all(&dir)?;
        tracker.add_writer(Box::new(JsonlMetricWriter::open(&dir.join(METRICS_FILE))?));
        tracing::debug!(experiment = name, path = %dir.display(), "Experiment opened");

        Ok(Self {
            name: name.to_string(),
            checkpoints: CheckpointStore::new(dir.join(CHECKPOINT_DIR)),
            recorder: Box::new(YamlTrialLog::new(dir.join(TRIALS_FILE))),
            trial: Trial::new("", name, false),
            check_repo_dirty: false,
            dir,
            tracker,
        })
    }

    pub fn with_restore_policy(mut self, policy: RestorePolicy) -> Self {
        self.checkpoints = self.checkpoints.with_policy(policy);
        self
    }

    /// Describe the run that `start_train` will record.
    pub fn with_trial(mut self, trial: Trial) -> Self {
        self.trial = trial;
        self
    }

    /// Refuse to start training when the trial's working tree is dirty.
    pub fn with_check_repo_dirty(mut self, check: bool) -> Self {
        self.check_repo_dirty = check;
        self
    }

    pub fn with_recorder(mut self, recorder: Box<dyn TrialRecorder>) -> Self {
        self.recorder = recorder;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn tracker(&self) -> &Tracker {
        &self.tracker
    }

    pub fn checkpoints(&self) -> &CheckpointStore {
        &self.checkpoints
    }

    pub fn trial(&self) -> &Trial {
        &self.trial
    }

    /// Prepare a run and record its trial. Returns the starting global step.
    ///
    /// Unless `is_init`, the latest checkpoint is restored into `sink` and its
    /// step becomes the global step. A run that restored nothing starts at
    /// step 0 and clears old metric output and old checkpoints.
    pub fn start_train(&mut self, is_init: bool, sink: &mut dyn ValueSink) -> Result<u64> {
        if self.check_repo_dirty && self.trial.is_dirty {
            return Err(TrialError::DirtyRepository.into());
        }

        let restored = if is_init { None } else { self.load_checkpoint(sink) };

        let start_step = match restored {
            Some(step) => step,
            None => {
                self.tracker.set_global_step(0);
                let tracker = &self.tracker;
                tracker.section_scope("Clearing summaries", SectionOptions::new(), || {
                    tracker.clear_writers()
                })?;
                let checkpoints = &self.checkpoints;
                tracker.section_scope("Clearing checkpoints", SectionOptions::new(), || {
                    checkpoints.clear()
                })?;
                0
            }
        };

        self.trial.start_step = start_step;
        self.recorder.record(&self.trial)?;
        tracing::info!(experiment = %self.name, start_step, "Training started");
        Ok(start_step)
    }

    /// Restore the latest checkpoint to look at a finished run. Nothing is
    /// cleared and no trial is recorded.
    pub fn start_replay(&mut self, sink: &mut dyn ValueSink) -> Option<u64> {
        let restored = self.load_checkpoint(sink);
        tracing::info!(experiment = %self.name, step = ?restored, "Replay started");
        restored
    }

    /// Load inside a "Loading checkpoint" section that mirrors the result.
    /// On success the restored step becomes the global step.
    fn load_checkpoint(&mut self, sink: &mut dyn ValueSink) -> Option<u64> {
        let section = self
            .tracker
            .section("Loading checkpoint", SectionOptions::new());
        let loaded = self.checkpoints.load(sink);
        section.set_successful(loaded);
        drop(section);

        let step = self.checkpoints.restored_step().filter(|_| loaded)?;
        self.tracker.set_global_step(step);
        Some(step)
    }

    /// Save `source` as the checkpoint of the tracker's current global step.
    pub fn save_checkpoint(&self, source: &dyn ValueSource) -> Result<PathBuf> {
        let step = self.tracker.global_step();
        let path = self.tracker.section_scope(
            "Saving checkpoint",
            SectionOptions::new(),
            || self.checkpoints.save_source(step, source),
        )?;
        Ok(path)
    }

    /// Store the last printed summary as the current trial's progress.
    pub fn save_progress(&mut self) -> Result<()> {
        let progress: BTreeMap<String, f64> = self
            .tracker
            .last_summary()
            .into_iter()
            .map(|s| (s.name, s.value))
            .collect();
        self.recorder.save_progress(progress)?;
        Ok(())
    }
}

fn validate_name(name: &str) -> std::result::Result<(), ConfigError> {
    let valid = !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains(['/', '\\'])
        && !name.chars().any(char::is_control);
    if valid {
        Ok(())
    } else {
        Err(ConfigError::Invalid {
            message: format!("invalid experiment name '{name}'"),
        })
    }
}
