//! Configuration system for Runlab.
//!
//! Uses `figment` for layered configuration: defaults -> config file -> environment -> CLI args.
//! Configuration is loaded from `~/.config/runlab/config.toml` and/or `.runlab/config.toml`
//! in the workspace directory.

use crate::checkpoint::RestorePolicy;
use crate::error::ConfigError;
use crate::tracker::TrackerSettings;
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunlabConfig {
    #[serde(default)]
    pub console: ConsoleConfig,
    #[serde(default)]
    pub indicators: IndicatorConfig,
    #[serde(default)]
    pub checkpoint: CheckpointConfig,
    #[serde(default)]
    pub experiment: ExperimentConfig,
}

/// Console rendering.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsoleConfig {
    /// Minimum milliseconds between progress redraws.
    pub redraw_interval_ms: u64,
    /// End loop lines with the iteration time and elapsed/estimated clock.
    pub print_iteration_time: bool,
    /// Spaces per nesting level.
    pub indent: usize,
}

impl Default for ConsoleConfig {
    fn default() -> Self {
        Self {
            redraw_interval_ms: 100,
            print_iteration_time: true,
            indent: 2,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IndicatorConfig {
    /// Store to an unknown name registers a printed scalar instead of failing.
    pub auto_register_scalar: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointConfig {
    /// Fail a restore when the checkpoint holds a value nobody restores.
    pub strict_restore: bool,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            strict_restore: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentConfig {
    /// Directory holding one folder per experiment.
    pub root: PathBuf,
    /// Refuse to start training with uncommitted changes in the workspace.
    #[serde(default)]
    pub check_repo_dirty: bool,
}

impl Default for ExperimentConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("logs"),
            check_repo_dirty: false,
        }
    }
}

impl RunlabConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.experiment.root.as_os_str().is_empty() {
            return Err(ConfigError::Invalid {
                message: "experiment.root must not be empty".into(),
            });
        }
        if self.console.indent > 16 {
            return Err(ConfigError::Invalid {
                message: format!("console.indent {} is larger than 16", self.console.indent),
            });
        }
        Ok(())
    }

    pub fn tracker_settings(&self) -> TrackerSettings {
        TrackerSettings {
            redraw_interval: Duration::from_millis(self.console.redraw_interval_ms),
            print_iteration_time: self.console.print_iteration_time,
            indent: self.console.indent,
            auto_register: self.indicators.auto_register_scalar,
        }
    }

    pub fn restore_policy(&self) -> RestorePolicy {
        if self.checkpoint.strict_restore {
            RestorePolicy::Strict
        } else {
            RestorePolicy::SkipUnknown
        }
    }

    /// Experiment root, resolved against `workspace` when relative.
    pub fn experiment_root(&self, workspace: Option<&Path>) -> PathBuf {
        match workspace {
            Some(ws) if self.experiment.root.is_relative() => ws.join(&self.experiment.root),
            _ => self.experiment.root.clone(),
        }
    }
}

/// Load configuration from all layers.
///
/// Layers, later ones winning: built-in defaults, the user config file, the
/// workspace `.runlab/config.toml`, `RUNLAB_`-prefixed environment variables
/// (`__` separates nested keys), then `overrides`.
pub fn load_config(
    workspace: Option<&Path>,
    overrides: Option<&RunlabConfig>,
) -> Result<RunlabConfig, Box<figment::Error>> {
    let mut figment = Figment::from(Serialized::defaults(RunlabConfig::default()));

    // User-level config
    if let Some(config_dir) = directories::ProjectDirs::from("dev", "runlab", "runlab") {
        let user_config = config_dir.config_dir().join("config.toml");
        if user_config.exists() {
            figment = figment.merge(Toml::file(&user_config));
        }
    }

    // Workspace-level config
    if let Some(ws) = workspace {
        let ws_config = ws.join(".runlab").join("config.toml");
        if ws_config.exists() {
            figment = figment.merge(Toml::file(&ws_config));
        }
    }

    // Environment variables (RUNLAB_CONSOLE__INDENT, RUNLAB_EXPERIMENT__ROOT, etc.)
    figment = figment.merge(Env::prefixed("RUNLAB_").split("__"));

    if let Some(overrides) = overrides {
        figment = figment.merge(Serialized::defaults(overrides));
    }

    figment.extract().map_err(Box::new)
}

/// Path of the user-level config file, if a home directory is known.
pub fn user_config_path() -> Option<PathBuf> {
    directories::ProjectDirs::from("dev", "runlab", "runlab")
        .map(|dirs| dirs.config_dir().join("config.toml"))
}
