//! CLI subcommand handlers.

use crate::CheckpointAction;
use crate::Commands;
use crate::ConfigAction;
use crate::demo::{self, DemoOptions};
use crate::terminal::TerminalSink;
use runlab_core::config::user_config_path;
use runlab_core::experiment::CHECKPOINT_DIR;
use runlab_core::{CheckpointStore, Experiment, InterruptHub, RunlabConfig, Tracker, Trial};
use std::path::Path;

/// Handle a CLI subcommand.
pub async fn handle_command(command: Commands, workspace: &Path) -> anyhow::Result<()> {
    match command {
        Commands::Demo(options) => handle_demo(options, workspace).await,
        Commands::Checkpoint { action } => handle_checkpoint(action, workspace),
        Commands::Config { action } => handle_config(action, workspace),
    }
}

fn load_config(workspace: &Path) -> anyhow::Result<RunlabConfig> {
    let config = runlab_core::config::load_config(Some(workspace), None)
        .map_err(|e| anyhow::anyhow!("Failed to load config: {}", e))?;
    config.validate()?;
    Ok(config)
}

async fn handle_demo(options: DemoOptions, workspace: &Path) -> anyhow::Result<()> {
    let config = load_config(workspace)?;
    let hub = InterruptHub::global();
    let listener = hub.spawn_ctrl_c_listener();

    let root = config.experiment_root(Some(workspace));
    let mut trial = Trial::new(
        options.comment.clone(),
        "runlab demo",
        git_is_dirty(workspace),
    );
    if let Some(commit) = git_commit(workspace) {
        trial = trial.with_commit(commit);
    }
    let check_repo_dirty = config.experiment.check_repo_dirty;

    // The training loop blocks; Ctrl-C is still received on the runtime.
    let report = tokio::task::spawn_blocking(move || {
        let tracker = Tracker::with_settings(TerminalSink::stdout(), config.tracker_settings());
        let mut experiment = Experiment::open(&root, &options.name, tracker)?
            .with_restore_policy(config.restore_policy())
            .with_check_repo_dirty(check_repo_dirty)
            .with_trial(trial);
        demo::run(&mut experiment, &hub, &options)
    })
    .await??;

    listener.abort();
    if report.interrupted {
        println!(
            "Stopped after step {}. Continue with `runlab demo --resume`.",
            report.final_step
        );
    }
    Ok(())
}

fn handle_checkpoint(action: CheckpointAction, workspace: &Path) -> anyhow::Result<()> {
    match action {
        CheckpointAction::Show { name } => {
            let config = load_config(workspace)?;
            let dir = config
                .experiment_root(Some(workspace))
                .join(&name)
                .join(CHECKPOINT_DIR);
            let store = CheckpointStore::new(&dir);
            match store.latest()? {
                Some(index) => {
                    println!("Experiment: {}", name);
                    println!("Step:       {}", index.step);
                    println!("Created:    {}", index.created_at.to_rfc3339());
                    println!("Directory:  {}", store.step_dir(index.step).display());
                    println!("Values ({}):", index.files.len());
                    for (value, file) in &index.files {
                        println!("  {} -> {}", value, file);
                    }
                }
                None => println!("No checkpoint found in {}", dir.display()),
            }
            Ok(())
        }
    }
}

fn handle_config(action: ConfigAction, workspace: &Path) -> anyhow::Result<()> {
    match action {
        ConfigAction::Init => {
            let config_dir = workspace.join(".runlab");
            std::fs::create_dir_all(&config_dir)?;
            let config_path = config_dir.join("config.toml");

            if config_path.exists() {
                println!(
                    "Configuration file already exists at: {}",
                    config_path.display()
                );
                return Ok(());
            }

            let toml_str = toml::to_string_pretty(&RunlabConfig::default())?;
            std::fs::write(&config_path, &toml_str)?;
            println!(
                "Created default configuration at: {}",
                config_path.display()
            );
            Ok(())
        }
        ConfigAction::Show => {
            let config = load_config(workspace)?;
            if let Some(path) = user_config_path().filter(|p| p.exists()) {
                println!("# user config: {}", path.display());
            }
            let toml_str = toml::to_string_pretty(&config)?;
            println!("{}", toml_str);
            Ok(())
        }
    }
}

/// Stdout of `git <args>` run in `workspace`, or `None` when git cannot
/// answer (no git, not a repository, no commits yet).
fn git_output(workspace: &Path, args: &[&str]) -> Option<String> {
    match std::process::Command::new("git")
        .args(args)
        .current_dir(workspace)
        .output()
    {
        Ok(output) if output.status.success() => {
            Some(String::from_utf8_lossy(&output.stdout).into_owned())
        }
        Ok(output) => {
            tracing::debug!(?args, status = %output.status, "git command failed");
            None
        }
        Err(e) => {
            tracing::debug!(error = %e, "git not available");
            None
        }
    }
}

/// Whether `workspace` is a git checkout with uncommitted changes. Anything
/// that prevents asking git counts as clean.
fn git_is_dirty(workspace: &Path) -> bool {
    git_output(workspace, &["status", "--porcelain"]).is_some_and(|out| !out.trim().is_empty())
}

/// Commit checked out in `workspace`.
fn git_commit(workspace: &Path) -> Option<String> {
    git_output(workspace, &["rev-parse", "HEAD"])
        .map(|out| out.trim().to_string())
        .filter(|commit| !commit.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use runlab_core::checkpoint::CheckpointIndex;
    use tempfile::TempDir;

    #[test]
    fn test_git_is_dirty_outside_repository() {
        let dir = TempDir::new().unwrap();
        assert!(!git_is_dirty(dir.path()));
    }

    #[test]
    fn test_git_commit_outside_repository_is_none() {
        let dir = TempDir::new().unwrap();
        assert_eq!(git_commit(dir.path()), None);
    }

    fn git(dir: &Path, args: &[&str]) -> bool {
        std::process::Command::new("git")
            .args(args)
            .current_dir(dir)
            .output()
            .is_ok_and(|o| o.status.success())
    }

    #[test]
    fn test_git_commit_and_dirty_flag_in_repository() {
        let dir = TempDir::new().unwrap();
        let ws = dir.path();
        let committed = git(ws, &["init", "-q"])
            && std::fs::write(ws.join("a.txt"), "a").is_ok()
            && git(ws, &["add", "a.txt"])
            && git(
                ws,
                &[
                    "-c", "user.name=runlab", "-c", "user.email=runlab@localhost",
                    "commit", "-q", "-m", "init",
                ],
            );
        if !committed {
            // No usable git on this machine.
            return;
        }

        let commit = git_commit(ws).unwrap();
        assert_eq!(commit.len(), 40);
        assert!(commit.chars().all(|c| c.is_ascii_hexdigit()));
        assert!(!git_is_dirty(ws));

        std::fs::write(ws.join("a.txt"), "changed").unwrap();
        assert!(git_is_dirty(ws));
    }

    #[test]
    fn test_config_init_writes_defaults_once() {
        let dir = TempDir::new().unwrap();
        handle_config(ConfigAction::Init, dir.path()).unwrap();
        let path = dir.path().join(".runlab").join("config.toml");
        let written: RunlabConfig = toml::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(written, RunlabConfig::default());

        std::fs::write(&path, "[console]\nredraw_interval_ms = 1\nprint_iteration_time = true\nindent = 2\n").unwrap();
        handle_config(ConfigAction::Init, dir.path()).unwrap();
        assert!(std::fs::read_to_string(&path).unwrap().contains("redraw_interval_ms = 1"));
    }

    #[test]
    fn test_checkpoint_show_reads_workspace_experiment() {
        let dir = TempDir::new().unwrap();
        let store = CheckpointStore::new(dir.path().join("logs").join("demo").join(CHECKPOINT_DIR));
        store.save(5, [("model", vec![1u8, 2, 3])]).unwrap();
        let index: CheckpointIndex = store.latest().unwrap().unwrap();
        assert_eq!(index.step, 5);

        handle_checkpoint(
            CheckpointAction::Show {
                name: "demo".into(),
            },
            dir.path(),
        )
        .unwrap();
    }
}
