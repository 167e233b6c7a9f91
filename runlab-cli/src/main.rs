//! Runlab CLI — run a tracked demo training loop and inspect experiments.

mod commands;
mod demo;
mod terminal;

use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Runlab: progress, metrics and checkpoints for long training loops
#[derive(Parser, Debug)]
#[command(name = "runlab", version, about, long_about = None)]
struct Cli {
    /// Workspace directory
    #[arg(short, long, default_value = ".")]
    workspace: PathBuf,

    /// Verbose output (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode (errors only)
    #[arg(short, long)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Fit a toy linear model with a tracked, checkpointed training loop
    Demo(demo::DemoOptions),
    /// Inspect experiment checkpoints
    Checkpoint {
        #[command(subcommand)]
        action: CheckpointAction,
    },
    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(clap::Subcommand, Debug)]
enum CheckpointAction {
    /// Show the step and contents of the latest checkpoint
    Show {
        /// Experiment name
        #[arg(long, default_value = "demo")]
        name: String,
    },
}

#[derive(clap::Subcommand, Debug)]
enum ConfigAction {
    /// Create a default workspace configuration file
    Init,
    /// Show the effective configuration
    Show,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present (silently ignore if missing)
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    let filter = match (cli.verbose, cli.quiet) {
        (_, true) => "error",
        (0, false) => "warn",
        (1, false) => "info",
        (2, false) => "debug",
        _ => "trace",
    };

    // Progress lines own stdout; diagnostics go to stderr.
    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_filter(EnvFilter::new(filter));

    // JSON file layer: daily-rotated log files in the platform data dir
    let log_dir = directories::ProjectDirs::from("dev", "runlab", "runlab")
        .map(|dirs| dirs.data_dir().join("logs"))
        .unwrap_or_else(|| PathBuf::from(".runlab/logs"));
    let _guard = match std::fs::create_dir_all(&log_dir) {
        Ok(()) => {
            let file_appender = tracing_appender::rolling::daily(&log_dir, "runlab.log");
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
            let file_layer = tracing_subscriber::fmt::layer()
                .json()
                .with_writer(non_blocking)
                .with_filter(EnvFilter::new("debug"));
            tracing_subscriber::registry()
                .with(stderr_layer)
                .with(file_layer)
                .init();
            Some(guard)
        }
        Err(_) => {
            tracing_subscriber::registry().with(stderr_layer).init();
            None
        }
    };

    let workspace = std::fs::canonicalize(&cli.workspace).unwrap_or(cli.workspace);
    tracing::debug!(workspace = %workspace.display(), "Starting runlab");

    commands::handle_command(cli.command, &workspace).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses_demo_flags() {
        let cli = Cli::try_parse_from([
            "runlab", "-vv", "demo", "--epochs", "3", "--resume", "--name", "exp1",
        ])
        .unwrap();
        assert_eq!(cli.verbose, 2);
        match cli.command {
            Commands::Demo(args) => {
                assert_eq!(args.epochs, 3);
                assert_eq!(args.batches, 50);
                assert!(args.resume);
                assert_eq!(args.name, "exp1");
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_cli_parses_checkpoint_show() {
        let cli = Cli::try_parse_from(["runlab", "-w", "/tmp", "checkpoint", "show"]).unwrap();
        assert_eq!(cli.workspace, PathBuf::from("/tmp"));
        assert!(matches!(
            cli.command,
            Commands::Checkpoint {
                action: CheckpointAction::Show { ref name }
            } if name == "demo"
        ));
    }

    #[test]
    fn test_cli_requires_subcommand() {
        assert!(Cli::try_parse_from(["runlab"]).is_err());
    }
}
