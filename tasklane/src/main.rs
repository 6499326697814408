//! `tasklane`: offline inspection of exported list and registry logs.
//!
//! A dump is a JSON array of `{"key": ..., "value": ...}` objects, the
//! shape a log's `list_all` returns.
//!
//! ```bash
//! # Reduced task list, delegations evaluated now
//! tasklane reduce --entries groceries.json
//!
//! # What bob may write on one task at a given instant
//! tasklane access --entries groceries.json --task task_1714564800000_ab12cd34 \
//!     --identity bob --at 2024-05-02T09:00:00Z
//!
//! # Breadcrumb of a list
//! tasklane path --registry alice_registry.json groceries
//! ```

use std::path::Path;
use std::process::ExitCode;

use chrono::{DateTime, Utc};
use clap::{CommandFactory, Parser};
use serde::Serialize;
use tracing_appender::non_blocking::WorkerGuard;

use tasklane::config::{CliArgs, ClientConfig, Command};
use tasklane::registry::hierarchy::{build_hierarchy_path, format_path};
use tasklane::tasks::{WriteAccess, reduce_detailed, write_access};
use tasklane_proto::entry::{LogEntry, RegistryRecord, decode_registry_entry};

/// Errors that end an inspection command.
#[derive(Debug, thiserror::Error)]
enum InspectError {
    /// The dump file could not be read.
    #[error("failed to read {path}: {source}")]
    Read {
        /// Path that was attempted.
        path: String,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// The dump is not a JSON array of entries.
    #[error("failed to parse {path}: {source}")]
    Parse {
        /// Path that was attempted.
        path: String,
        /// Underlying JSON error.
        source: serde_json::Error,
    },

    /// No task with this key survives reduction.
    #[error("no task with key {0}")]
    TaskNotFound(String),

    /// `access` needs an identity.
    #[error("no identity given (use --identity, TASKLANE_IDENTITY, or [identity] id)")]
    NoIdentity,

    /// Output could not be rendered.
    #[error("failed to render output: {0}")]
    Render(#[from] serde_json::Error),
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct AccessReport<'a> {
    task_key: &'a str,
    identity: &'a str,
    at: DateTime<Utc>,
    access: WriteAccess,
}

fn main() -> ExitCode {
    let cli = CliArgs::parse();

    // Logs go to a file so stdout carries only command output.
    let _log_guard = init_logging(&cli.log_level, cli.log_file.as_deref());

    let config = match ClientConfig::load(&cli) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Warning: failed to load config file: {e}");
            ClientConfig::default()
        }
    };

    let Some(command) = &cli.command else {
        eprintln!("{}", CliArgs::command().render_help());
        return ExitCode::from(2);
    };

    match run(command, &config) {
        Ok(output) => {
            println!("{output}");
            ExitCode::SUCCESS
        }
        Err(e) => {
            tracing::error!(error = %e, "command failed");
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

/// Sends tracing output to a file so stdout carries only command output.
///
/// Logs are flushed when the returned guard drops. `None` means the path
/// had no usable file name and logging stays off.
fn init_logging(level: &str, file_path: Option<&Path>) -> Option<WorkerGuard> {
    let default_path = std::env::temp_dir().join("tasklane.log");
    let log_path = file_path.unwrap_or(&default_path);

    let log_dir = log_path.parent()?;
    let file_name = log_path.file_name()?.to_str()?;

    let file_appender = tracing_appender::rolling::never(log_dir, file_name);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let env_filter = tracing_subscriber::EnvFilter::try_from_env("TASKLANE_LOG")
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    tracing_subscriber::fmt()
        .with_writer(non_blocking)
        .with_env_filter(env_filter)
        .with_ansi(false)
        .init();

    Some(guard)
}

fn run(command: &Command, config: &ClientConfig) -> Result<String, InspectError> {
    match command {
        Command::Reduce { entries, at } => {
            let entries = read_dump(entries)?;
            let now = at.unwrap_or_else(Utc::now);
            let reduction = reduce_detailed(&entries, now);
            tracing::info!(
                entries = entries.len(),
                tasks = reduction.tasks.len(),
                skipped = reduction.skipped.len(),
                discarded = reduction.discarded.len(),
                applied = reduction.applied,
                "reduced list dump"
            );
            Ok(serde_json::to_string_pretty(&reduction.tasks)?)
        }
        Command::Access { entries, task, at } => {
            let identity = config
                .identity_id
                .as_deref()
                .ok_or(InspectError::NoIdentity)?;
            let entries = read_dump(entries)?;
            let now = at.unwrap_or_else(Utc::now);
            let tasks = reduce_detailed(&entries, now).tasks;
            let found = tasks
                .iter()
                .find(|t| t.key == *task)
                .ok_or_else(|| InspectError::TaskNotFound(task.clone()))?;
            let report = AccessReport {
                task_key: &found.key,
                identity,
                at: now,
                access: write_access(found, identity, now),
            };
            Ok(serde_json::to_string_pretty(&report)?)
        }
        Command::Path { registry, name } => {
            let records = registry_records(&read_dump(registry)?);
            Ok(format_path(&build_hierarchy_path(&records, name)))
        }
    }
}

fn read_dump(path: &Path) -> Result<Vec<LogEntry>, InspectError> {
    let display = path.display().to_string();
    let contents = std::fs::read_to_string(path).map_err(|source| InspectError::Read {
        path: display.clone(),
        source,
    })?;
    serde_json::from_str(&contents).map_err(|source| InspectError::Parse {
        path: display,
        source,
    })
}

fn registry_records(entries: &[LogEntry]) -> Vec<RegistryRecord> {
    entries
        .iter()
        .filter_map(|entry| match decode_registry_entry(entry) {
            Ok(record) => Some(record),
            Err(skipped) => {
                tracing::warn!(key = %skipped.key, reason = %skipped.reason, "skipping registry entry");
                None
            }
        })
        .collect()
}
