//! Purge a retired table's rows with pt-archiver.

use std::time::Instant;

use serde::Serialize;

use crate::commands::{elapsed_ms, CommandContext};
use crate::db::validate_identifier;
use crate::error::{AlterguardError, Result};
use crate::notify::TaskEvent;
use crate::ptosc::retired_table_name;

/// Report returned after a purge.
#[derive(Debug, Serialize)]
pub struct PurgeReport {
    pub table: String,
    /// Table the rows were deleted from (`<table>_old`).
    pub source_table: String,
    /// The tool ran with `--dry-run`.
    pub dry_run: bool,
    /// Password-free command line.
    pub command: String,
    /// Tool run time in milliseconds.
    pub duration_ms: u64,
    /// Tool output.
    pub transcript: String,
}

/// Execute the purge command against `<table>_old`.
pub async fn execute(ctx: &CommandContext<'_>, table: &str) -> Result<PurgeReport> {
    validate_identifier(table)?;

    if !ctx.archiver.enabled() {
        return Err(AlterguardError::ConfigError(
            "pt-archiver is disabled; set [pt_archiver] enabled = true to purge tables".to_string(),
        ));
    }

    let source = retired_table_name(table);
    let command = ctx.archiver.describe_command(&source, ctx.dry_run);
    let event = TaskEvent::new(ctx.task("pt-archiver"), &source).with_statement(&command);

    match ctx.db.table_exists(&source).await {
        Ok(true) => {}
        Ok(false) => {
            let err = AlterguardError::TableMissing { table: source };
            return ctx.fail(&event, err).await;
        }
        Err(e) => return ctx.fail(&event, e).await,
    }

    log::info!("Purging retired table; table={}, command={}", source, command);
    ctx.notifications.start(&event).await;
    let started = Instant::now();

    match ctx.archiver.purge(&source, ctx.dry_run).await {
        Ok(run) => {
            let event = event
                .with_duration(started.elapsed())
                .with_transcript(run.transcript.clone());
            ctx.notifications.success(&event).await;
            Ok(PurgeReport {
                table: table.to_string(),
                source_table: source,
                dry_run: ctx.dry_run,
                command,
                duration_ms: elapsed_ms(started),
                transcript: run.transcript,
            })
        }
        Err(e) => {
            log::error!("Purge failed; table={}, error={}", source, e);
            let event = event
                .with_duration(started.elapsed())
                .with_transcript(ctx.archiver.last_run_summary());
            ctx.fail(&event, e).await
        }
    }
}
