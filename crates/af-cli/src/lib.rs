// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! `af` command-line front end
//!
//! Runs single agent turns against the local machine and inspects what the
//! event store recorded for a task.

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use af_core::{LocalSandbox, PipelineConfig, TurnRunner};
use af_domain_types::{Provider, TurnRequest};
use af_event_store::{EventLog, ProjectStateStore, SqliteStore};
use af_logging::CliLoggingArgs;
use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use tracing::info;

pub const LOCAL_SANDBOX_ID: &str = "local";

#[derive(Parser, Debug)]
#[command(
    name = "af",
    about = "App Forge agent turn pipeline",
    version,
    propagate_version = true
)]
pub struct Cli {
    /// Pipeline configuration file (TOML)
    #[arg(long, env = "AF_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// SQLite event store; defaults to the platform data directory
    #[arg(long, env = "AF_DB", global = true)]
    pub db: Option<PathBuf>,

    #[command(flatten)]
    pub logging: CliLoggingArgs,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Execute one agent turn and print its report
    Turn(TurnArgs),
    /// Stop the agent process currently running for a task
    Stop(TaskArgs),
    /// Print the persisted events of a task as JSON lines
    Events(TaskArgs),
    /// Print the session and running process recorded for a task
    State(TaskArgs),
}

#[derive(Args, Debug)]
pub struct TurnArgs {
    #[arg(long)]
    pub task: String,

    #[arg(long, default_value = "local")]
    pub owner: String,

    #[arg(long, value_enum, default_value_t = Provider::Claude)]
    pub provider: Provider,

    /// App source tree the agent works in
    #[arg(long, default_value = ".")]
    pub workdir: PathBuf,

    #[arg(long, short)]
    pub message: String,

    /// File holding the system instructions for a fresh session
    #[arg(long)]
    pub system_file: Option<PathBuf>,
}

#[derive(Args, Debug)]
pub struct TaskArgs {
    #[arg(long)]
    pub task: String,
}

impl Cli {
    pub async fn run(self, out: &mut dyn Write) -> anyhow::Result<()> {
        let store = Arc::new(open_store(self.db.as_ref())?);

        match self.command {
            Commands::Turn(args) => {
                let config = PipelineConfig::load(self.config.as_deref())?;
                run_turn(store, config, args, out).await
            }
            Commands::Stop(args) => {
                let config = PipelineConfig::load(self.config.as_deref())?;
                let sandbox = LocalSandbox::new(LOCAL_SANDBOX_ID);
                let runner = TurnRunner::new(store, config)?;
                let signalled = runner.stop(&sandbox, &args.task).await?;
                writeln!(
                    out,
                    "{}",
                    serde_json::json!({ "task_id": args.task, "signalled": signalled })
                )?;
                Ok(())
            }
            Commands::Events(args) => {
                for event in store.list_for_task(&args.task).await? {
                    writeln!(out, "{}", serde_json::to_string(&event)?)?;
                }
                Ok(())
            }
            Commands::State(args) => {
                let state = store.load(&args.task).await?;
                writeln!(out, "{}", serde_json::to_string_pretty(&state)?)?;
                Ok(())
            }
        }
    }
}

fn open_store(path: Option<&PathBuf>) -> anyhow::Result<SqliteStore> {
    let path = path.cloned().unwrap_or_else(af_event_store::sqlite::default_path);
    SqliteStore::open(&path).with_context(|| format!("opening event store {}", path.display()))
}

async fn run_turn(
    store: Arc<SqliteStore>,
    config: PipelineConfig,
    args: TurnArgs,
    out: &mut dyn Write,
) -> anyhow::Result<()> {
    let instructions = match &args.system_file {
        Some(path) => std::fs::read_to_string(path)
            .with_context(|| format!("reading system instructions {}", path.display()))?,
        None => String::new(),
    };
    let workdir = std::path::absolute(&args.workdir).unwrap_or(args.workdir.clone());

    // Resume whatever session the previous turn for this task left behind.
    let state = store.load(&args.task).await?;
    let request = TurnRequest::new(&args.task, &args.owner, args.provider, &args.message)
        .working_dir(workdir)
        .session_token(state.session_token)
        .system_instructions(instructions)
        .sandbox_id(LOCAL_SANDBOX_ID);

    let sandbox =
        Arc::new(LocalSandbox::new(LOCAL_SANDBOX_ID).poll_interval(config.poll_interval()));
    let runner = TurnRunner::new(store, config)?;
    let report = runner.run_turn(sandbox, request).await?;
    info!(
        task_id = %report.task_id,
        turn_id = %report.turn_id,
        status = %report.outcome.status,
        "Turn finished"
    );

    writeln!(out, "{}", serde_json::to_string_pretty(&report)?)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use af_domain_types::{CanonicalEvent, NormalizedEvent, SessionToken};

    #[test]
    fn test_turn_args_parse() {
        let cli = Cli::try_parse_from([
            "af",
            "turn",
            "--task",
            "task-1",
            "--provider",
            "codex",
            "-m",
            "make the button blue",
        ])
        .unwrap();
        match cli.command {
            Commands::Turn(args) => {
                assert_eq!(args.task, "task-1");
                assert_eq!(args.owner, "local");
                assert_eq!(args.provider, Provider::Codex);
                assert_eq!(args.workdir, PathBuf::from("."));
                assert!(args.system_file.is_none());
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_turn_requires_message() {
        assert!(Cli::try_parse_from(["af", "turn", "--task", "task-1"]).is_err());
    }

    #[test]
    fn test_global_db_flag_after_subcommand() {
        let cli =
            Cli::try_parse_from(["af", "events", "--task", "t", "--db", "/tmp/af.db"]).unwrap();
        assert_eq!(cli.db, Some(PathBuf::from("/tmp/af.db")));
    }

    #[tokio::test]
    async fn test_events_prints_json_lines() {
        let dir = tempfile::TempDir::new().unwrap();
        let db = dir.path().join("af.db");
        let store = SqliteStore::open(&db).unwrap();
        for event in [
            NormalizedEvent::user_text("hi"),
            NormalizedEvent::assistant_text("hello", Some("end_turn")),
        ] {
            let canonical = CanonicalEvent::from_normalized(
                "task-1",
                "turn-1",
                Some(SessionToken::new("sess-1")),
                event,
            );
            store.append(&canonical).await.unwrap();
        }

        let cli = Cli::try_parse_from([
            "af",
            "--db",
            db.to_str().unwrap(),
            "events",
            "--task",
            "task-1",
        ])
        .unwrap();
        let mut out = Vec::new();
        cli.run(&mut out).await.unwrap();

        let lines: Vec<serde_json::Value> = String::from_utf8(out)
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["kind"], "user");
        assert_eq!(lines[1]["kind"], "assistant");
    }

    #[tokio::test]
    async fn test_state_of_unknown_task_is_empty() {
        let dir = tempfile::TempDir::new().unwrap();
        let db = dir.path().join("af.db");
        let cli = Cli::try_parse_from([
            "af",
            "--db",
            db.to_str().unwrap(),
            "state",
            "--task",
            "nobody",
        ])
        .unwrap();
        let mut out = Vec::new();
        cli.run(&mut out).await.unwrap();

        let state: serde_json::Value = serde_json::from_slice(&out).unwrap();
        assert_eq!(state["task_id"], "nobody");
        assert!(state["session_token"].is_null());
        assert!(state["running_pid"].is_null());
    }
}
