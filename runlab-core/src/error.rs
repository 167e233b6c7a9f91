//! Error types for the Runlab core library.
//!
//! Uses `thiserror` for public API error types with structured error variants
//! covering indicators, sections, checkpoints, configuration, and trial logs.

use std::path::PathBuf;

/// Top-level error type for the Runlab core library.
#[derive(Debug, thiserror::Error)]
pub enum RunlabError {
    #[error("Indicator error: {0}")]
    Indicator(#[from] IndicatorError),

    #[error("Section error: {0}")]
    Section(#[from] SectionError),

    #[error("Checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Trial error: {0}")]
    Trial(#[from] TrialError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors from indicator registration and storage.
#[derive(Debug, thiserror::Error)]
pub enum IndicatorError {
    /// A bad aggregation policy; a programming error, not a runtime condition.
    #[error("Invalid policy for indicator '{name}': {reason}")]
    Config { name: String, reason: String },

    #[error("Unknown indicator: {name}")]
    Unknown { name: String },
}

/// Errors from the section stack.
#[derive(Debug, thiserror::Error)]
pub enum SectionError {
    #[error("Cannot pop a section: the section stack is empty")]
    EmptyStack,
}

/// Errors from checkpoint persistence.
#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    #[error("Checkpoint for step {step} already exists at {path}")]
    AlreadyExists { step: u64, path: PathBuf },

    #[error("Corrupt checkpoint index {path}: {message}")]
    CorruptIndex { path: PathBuf, message: String },

    #[error("No restore handler for checkpointed value '{name}'")]
    RestoreMismatch { name: String },

    #[error("Failed to restore value '{name}': {message}")]
    Restore { name: String, message: String },

    #[error("Checkpoint IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors from the configuration system.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {message}")]
    Invalid { message: String },

    #[error("Configuration parse error: {message}")]
    ParseError { message: String },
}

/// Errors from the trial log.
#[derive(Debug, thiserror::Error)]
pub enum TrialError {
    #[error("Trial log {path} is malformed: {message}")]
    Malformed { path: PathBuf, message: String },

    #[error("No trial has been started")]
    NotStarted,

    #[error("Refusing to start: the repository has uncommitted changes")]
    DirtyRepository,

    #[error("Trial log IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A type alias for results using the top-level `RunlabError`.
pub type Result<T> = std::result::Result<T, RunlabError>;
