//! # Runlab Core
//!
//! Run-tracking engine for long iterative computations such as training
//! loops: nested timed sections with progress, per-step metric aggregation
//! with periodic summaries, interrupt-safe step loops, and step-indexed
//! checkpoints that keep only the newest snapshot.

pub mod checkpoint;
pub mod config;
pub mod console;
pub mod error;
pub mod experiment;
pub mod indicator;
pub mod indicator_set;
pub mod interrupt;
pub mod persistence;
pub mod section;
pub mod step;
pub mod style;
pub mod tracker;
pub mod trial;
pub mod writer;

// Re-export commonly used types at the crate root.
pub use checkpoint::{
    CheckpointIndex, CheckpointStore, RestorePolicy, RestoreRegistry, ValueSink, ValueSource,
};
pub use config::{RunlabConfig, load_config};
pub use console::{ConsoleEvent, ConsoleSink, NullSink, RecordingSink};
pub use error::{
    CheckpointError, ConfigError, IndicatorError, Result, RunlabError, SectionError, TrialError,
};
pub use experiment::Experiment;
pub use indicator::{IndicatorKind, IndicatorSpec, IndicatorSummary, Sample};
pub use indicator_set::IndicatorSet;
pub use interrupt::{Delivery, InterruptGuard, InterruptHub};
pub use section::{SectionId, SectionOptions, SectionOutcome, SectionRecord, SectionStack};
pub use step::GlobalStepCounter;
pub use style::{Fragment, Style};
pub use tracker::{Iterate, SectionGuard, StepLoop, Tracker, TrackerSettings};
pub use trial::{Trial, TrialRecorder, YamlTrialLog};
pub use writer::{JsonlMetricWriter, MetricWriter, StepRecord};
