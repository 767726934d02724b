//! Command surface for roster uploads and member queries.
//!
//! Hosts can embed the same behavior through:
//! - [`run_cli`] for full parsed CLI execution.
//! - [`run_member_with_db`] for direct [`MemberCommand`] execution against a DB path.
//! - [`run_member`] for execution against an existing [`SqliteRosterStore`].

use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use roster_core::{reconcile, MemberId, ReconciliationResult, RosterQuery};
use roster_store_sqlite::SqliteRosterStore;
use serde::Serialize;
use tracing::{info, warn};

pub mod csv;

use crate::csv::{rows_from_csv, ParsedRows, RowParseError};

pub const UPLOAD_REPORT_CONTRACT: &str = "upload_report.v1";

#[derive(Debug, Parser)]
#[command(name = "roster")]
#[command(about = "Member roster reconciliation CLI")]
pub struct Cli {
    #[arg(long, env = "ROSTER_DB", default_value = "./roster.sqlite3")]
    db: PathBuf,

    /// Tracing filter directive, e.g. `info` or `roster_core=debug`.
    #[arg(long, env = "ROSTER_LOG")]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

impl Cli {
    #[must_use]
    pub fn log_level(&self) -> Option<&str> {
        self.log_level.as_deref()
    }
}

#[derive(Debug, Subcommand)]
pub enum Command {
    Member {
        #[command(subcommand)]
        command: Box<MemberCommand>,
    },
}

#[derive(Debug, Subcommand)]
pub enum MemberCommand {
    /// Reconcile a CSV roster snapshot into the store.
    Upload(UploadArgs),
    Show(MemberIdArgs),
    History(MemberIdArgs),
    List,
}

#[derive(Debug, Args)]
pub struct UploadArgs {
    #[arg(long)]
    file: PathBuf,
    /// Reconcile valid rows even when some rows fail validation.
    #[arg(long)]
    skip_malformed: bool,
}

#[derive(Debug, Args)]
pub struct MemberIdArgs {
    #[arg(long)]
    id: i64,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct UploadReport {
    pub contract_version: String,
    pub source: String,
    pub result: ReconciliationResult,
    pub skipped_rows: Vec<RowParseError>,
}

/// Executes the parsed top-level CLI command graph.
///
/// # Errors
/// Returns an error when store open/migrate fails or the command fails.
pub fn run_cli(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Member { command } => run_member_with_db(&cli.db, *command),
    }
}

/// Executes a parsed member command using the provided `SQLite` DB path.
///
/// # Errors
/// Returns an error when store open/migrate fails or the requested command fails.
pub fn run_member_with_db(db_path: &Path, command: MemberCommand) -> Result<()> {
    let mut store = SqliteRosterStore::open(db_path)?;
    store.migrate()?;
    run_member(command, &mut store)
}

/// Executes a parsed member command against an existing store handle.
///
/// # Errors
/// Returns an error when input parsing, reconciliation, or retrieval fails.
pub fn run_member(command: MemberCommand, store: &mut SqliteRosterStore) -> Result<()> {
    match command {
        MemberCommand::Upload(args) => run_upload(&args, store),
        MemberCommand::Show(args) => {
            let Some(view) = store.get_member(MemberId(args.id))? else {
                return Err(anyhow!("member not found: {}", args.id));
            };
            println!("{}", serde_json::to_string_pretty(&view)?);
            Ok(())
        }
        MemberCommand::History(args) => {
            let history = store.get_history(MemberId(args.id))?;
            println!("{}", serde_json::to_string_pretty(&history)?);
            Ok(())
        }
        MemberCommand::List => {
            let members = store.list_members()?;
            println!("{}", serde_json::to_string_pretty(&members)?);
            Ok(())
        }
    }
}

fn run_upload(args: &UploadArgs, store: &mut SqliteRosterStore) -> Result<()> {
    let text = std::fs::read_to_string(&args.file)
        .with_context(|| format!("failed to read roster file {}", args.file.display()))?;
    let parsed = rows_from_csv(&text)
        .with_context(|| format!("failed to parse roster file {}", args.file.display()))?;

    if !parsed.rejected.is_empty() {
        if !args.skip_malformed {
            let details = parsed
                .rejected
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(" | ");
            return Err(anyhow!(
                "{} malformed row(s), nothing applied: {details}",
                parsed.rejected.len()
            ));
        }
        for rejected in &parsed.rejected {
            warn!(
                row_index = rejected.row_index,
                line = rejected.line,
                reason = %rejected.reason,
                "skipping malformed row"
            );
        }
    }

    info!(
        file = %args.file.display(),
        rows = parsed.rows.len(),
        skipped = parsed.rejected.len(),
        "reconciling roster upload"
    );

    let source = args.file.display().to_string();
    match reconcile(store, &parsed.roster_rows()) {
        Ok(mut result) => {
            restore_record_indices(&mut result, &parsed);
            let report = build_upload_report(source, result, parsed.rejected);
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        Err(mut err) => {
            restore_record_indices(&mut err.applied, &parsed);
            let line = match parsed.rows.get(err.row_index) {
                Some(failed) => {
                    err.row_index = failed.row_index;
                    failed.line
                }
                None => 0,
            };
            let context = format!("upload stopped at {source} line {line}");
            let report = build_upload_report(source, err.applied.clone(), parsed.rejected);
            println!("{}", serde_json::to_string_pretty(&report)?);
            Err(anyhow::Error::new(err).context(context))
        }
    }
}

/// The engine counts positions among the rows it was given. Reports count
/// every data record in the file so skipped and applied rows share one index.
fn restore_record_indices(result: &mut ReconciliationResult, parsed: &ParsedRows) {
    for outcome in &mut result.outcomes {
        if let Some(parsed_row) = parsed.rows.get(outcome.row_index) {
            outcome.row_index = parsed_row.row_index;
        }
    }
}

fn build_upload_report(
    source: String,
    result: ReconciliationResult,
    skipped_rows: Vec<RowParseError>,
) -> UploadReport {
    UploadReport {
        contract_version: UPLOAD_REPORT_CONTRACT.to_string(),
        source,
        result,
        skipped_rows,
    }
}
