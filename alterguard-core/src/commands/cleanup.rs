//! Remove what an online change leaves behind.

use serde::Serialize;

use crate::commands::{purge, CommandContext};
use crate::db::{quote_ident, validate_identifier};
use crate::error::{AlterguardError, Result};
use crate::notify::TaskEvent;
use crate::preflight::{self, PreflightCheck};
use crate::ptosc::{retired_table_name, trigger_names, working_table_name};

/// Which artifacts to remove. At least one must be selected.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupOptions {
    /// Drop `<table>_old`.
    pub drop_table: bool,
    /// Drop `_<table>_new`.
    pub drop_new_table: bool,
    /// Drop the tool's insert/update/delete triggers.
    pub drop_triggers: bool,
}

impl CleanupOptions {
    pub fn is_empty(&self) -> bool {
        !(self.drop_table || self.drop_new_table || self.drop_triggers)
    }
}

/// One dropped (or, in dry-run mode, skipped) object.
#[derive(Debug, Clone, Serialize)]
pub struct CleanupAction {
    pub object: String,
    pub statement: String,
    pub applied: bool,
}

/// Report returned after a cleanup.
#[derive(Debug, Serialize)]
pub struct CleanupReport {
    pub table: String,
    pub dry_run: bool,
    pub actions: Vec<CleanupAction>,
    pub checks: Vec<PreflightCheck>,
    /// Purge that ran ahead of dropping the retired table.
    pub purge: Option<purge::PurgeReport>,
}

/// Execute the cleanup command.
pub async fn execute(
    ctx: &CommandContext<'_>,
    table: &str,
    options: CleanupOptions,
) -> Result<CleanupReport> {
    if options.is_empty() {
        return Err(AlterguardError::ConfigError(
            "Nothing to clean up; pass --drop-table, --drop-new-table or --drop-triggers".to_string(),
        ));
    }
    validate_identifier(table)?;

    let mut report = CleanupReport {
        table: table.to_string(),
        dry_run: ctx.dry_run,
        actions: Vec::new(),
        checks: Vec::new(),
        purge: None,
    };

    if options.drop_table {
        drop_retired_table(ctx, table, &mut report).await?;
    }

    if options.drop_new_table {
        let working = working_table_name(table);
        let sql = format!("DROP TABLE IF EXISTS {}", quote_ident(&working));
        report
            .actions
            .push(drop_object(ctx, "new-table-cleanup", table, &working, &sql).await?);
    }

    if options.drop_triggers {
        drop_triggers(ctx, table, &mut report).await?;
    }

    Ok(report)
}

async fn drop_retired_table(
    ctx: &CommandContext<'_>,
    table: &str,
    report: &mut CleanupReport,
) -> Result<()> {
    let retired = retired_table_name(table);

    if ctx.archiver.enabled() {
        report.purge = Some(purge::execute(ctx, table).await?);
    }

    let residency = preflight::check_cache_residency(
        ctx.db,
        &retired,
        ctx.config.buffer_pool_size_threshold_mb,
    )
    .await;
    report
        .checks
        .push(ctx.gate("cleanup", &retired, residency).await?);

    let sql = format!("DROP TABLE IF EXISTS {}", quote_ident(&retired));
    report
        .actions
        .push(drop_object(ctx, "cleanup", table, &retired, &sql).await?);
    Ok(())
}

async fn drop_object(
    ctx: &CommandContext<'_>,
    task: &str,
    table: &str,
    object: &str,
    sql: &str,
) -> Result<CleanupAction> {
    let event = TaskEvent::new(ctx.task(task), table).with_statement(sql);
    let mut action = CleanupAction {
        object: object.to_string(),
        statement: sql.to_string(),
        applied: false,
    };

    if ctx.dry_run {
        log::info!("Dry run, would execute; table={}, sql={}", table, sql);
        ctx.notifications.success(&event).await;
        return Ok(action);
    }

    ctx.notifications.start(&event).await;
    match ctx.db.execute(sql).await {
        Ok(()) => {
            log::info!("Dropped; object={}", object);
            ctx.notifications.success(&event).await;
            action.applied = true;
            Ok(action)
        }
        Err(e) => {
            log::error!("Drop failed; object={}, error={}", object, e);
            ctx.fail(&event, e).await
        }
    }
}

/// Drop all three triggers, continuing past individual failures.
async fn drop_triggers(
    ctx: &CommandContext<'_>,
    table: &str,
    report: &mut CleanupReport,
) -> Result<()> {
    let triggers = trigger_names(ctx.database, table, ctx.config.pt_osc.trigger_naming);
    let event = TaskEvent::new(ctx.task("trigger-cleanup"), table)
        .with_statement(triggers.join(", "));
    let mut failed = Vec::new();

    if !ctx.dry_run {
        ctx.notifications.start(&event).await;
    }

    for trigger in &triggers {
        let sql = format!("DROP TRIGGER IF EXISTS {}", quote_ident(trigger));
        let mut action = CleanupAction {
            object: trigger.clone(),
            statement: sql.clone(),
            applied: false,
        };

        if ctx.dry_run {
            log::info!("Dry run, would execute; table={}, sql={}", table, sql);
        } else {
            match ctx.db.execute(&sql).await {
                Ok(()) => {
                    log::info!("Dropped trigger; trigger={}", trigger);
                    action.applied = true;
                }
                Err(e) => {
                    log::warn!("Failed to drop trigger; trigger={}, error={}", trigger, e);
                    failed.push(trigger.clone());
                }
            }
        }
        report.actions.push(action);
    }

    if !failed.is_empty() {
        let err = AlterguardError::TriggerCleanupFailed {
            table: table.to_string(),
            triggers: failed,
        };
        return ctx.fail(&event, err).await;
    }

    ctx.notifications.success(&event).await;
    Ok(())
}
