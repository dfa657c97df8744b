//! Swap a table with the working table built by an online change.

use std::time::{Duration, Instant};

use serde::Serialize;

use crate::commands::{elapsed_ms, CommandContext};
use crate::db::{quote_ident, validate_identifier};
use crate::error::{AlterguardError, Result};
use crate::monitor::monitored;
use crate::notify::TaskEvent;
use crate::preflight::{self, PreflightCheck};
use crate::ptosc::{retired_table_name, working_table_name};

/// Report returned after a swap.
#[derive(Debug, Serialize)]
pub struct SwapReport {
    pub table: String,
    /// Name the original table now has.
    pub retired_table: String,
    /// Working table that took the original's name.
    pub replacement_table: String,
    /// Exact row count of the original before the rename.
    pub row_count: i64,
    /// Exact row count of the replacement before the rename.
    pub replacement_row_count: i64,
    /// Whether `ANALYZE TABLE` ran on the replacement.
    pub analyzed: bool,
    /// The rename outlived the alert threshold.
    pub slow_warning: bool,
    /// Nothing was renamed.
    pub dry_run: bool,
    /// The rename statement.
    pub statement: String,
    /// Rename time in milliseconds.
    pub duration_ms: u64,
    /// Guard checks that let the swap through.
    pub checks: Vec<PreflightCheck>,
}

/// The atomic two-way rename.
pub fn rename_statement(table: &str) -> String {
    format!(
        "RENAME TABLE {} TO {}, {} TO {}",
        quote_ident(table),
        quote_ident(&retired_table_name(table)),
        quote_ident(&working_table_name(table)),
        quote_ident(table)
    )
}

/// Execute the swap command.
pub async fn execute(ctx: &CommandContext<'_>, table: &str) -> Result<SwapReport> {
    validate_identifier(table)?;

    let replacement = working_table_name(table);
    let statement = rename_statement(table);
    let swap_event = TaskEvent::new(ctx.task("swap"), table).with_statement(&statement);
    let mut checks = Vec::new();

    let connections = preflight::check_active_connections(
        ctx.db,
        ctx.config.connection_check.enabled,
        table,
    )
    .await;
    checks.push(ctx.gate("connection-check", table, connections).await?);

    for name in [table, replacement.as_str()] {
        match ctx.db.table_exists(name).await {
            Ok(true) => {}
            Ok(false) => {
                let err = AlterguardError::TableMissing {
                    table: name.to_string(),
                };
                return ctx.fail(&swap_event, err).await;
            }
            Err(e) => return ctx.fail(&swap_event, e).await,
        }
    }

    let parity = preflight::check_row_count_parity(ctx.db, table, &replacement).await;
    let (parity, row_count, replacement_row_count) = match parity {
        Ok(v) => v,
        Err(e) => {
            let event = TaskEvent::new(ctx.task("swap-row-count-check"), table);
            return ctx.fail(&event, e).await;
        }
    };
    checks.push(parity);

    let event = swap_event
        .with_row_count(row_count)
        .with_row_count_after(replacement_row_count);

    let mut report = SwapReport {
        table: table.to_string(),
        retired_table: retired_table_name(table),
        replacement_table: replacement.clone(),
        row_count,
        replacement_row_count,
        analyzed: false,
        slow_warning: false,
        dry_run: ctx.dry_run,
        statement: statement.clone(),
        duration_ms: 0,
        checks,
    };

    if ctx.dry_run {
        log::info!("Dry run, would execute; table={}, sql={}", table, statement);
        ctx.notifications.success(&event).await;
        return Ok(report);
    }

    if ctx.config.disable_analyze_table {
        log::info!("ANALYZE TABLE disabled; table={}", replacement);
    } else {
        match ctx.db.analyze_table(&replacement).await {
            Ok(()) => report.analyzed = true,
            Err(e) => log::warn!(
                "ANALYZE TABLE failed, continuing; table={}, error={}",
                replacement,
                e
            ),
        }
    }

    if let Err(e) = apply_session_timeouts(ctx).await {
        return ctx.fail(&event, e).await;
    }

    ctx.notifications.start(&event).await;

    let threshold = Duration::from_secs(ctx.config.alert.execution_time_threshold_secs);
    let warn_notifications = ctx.notifications.clone();
    let warn_event = event.clone();
    let on_slow = move |limit: Duration| async move {
        let message = format!(
            "RENAME TABLE is still running after {}s; it may be waiting for a metadata lock",
            limit.as_secs()
        );
        warn_notifications.warning(&warn_event, &message).await;
    };

    let started = Instant::now();
    let (result, slow) = monitored(threshold, on_slow, ctx.db.execute(&statement)).await;
    report.duration_ms = elapsed_ms(started);
    report.slow_warning = slow;
    let event = event.with_duration(started.elapsed());

    match result {
        Ok(()) => {
            log::info!(
                "Swapped tables; table={}, retired={}, time_ms={}",
                table,
                report.retired_table,
                report.duration_ms
            );
            ctx.notifications.success(&event).await;
            Ok(report)
        }
        Err(e) => {
            log::error!("Swap failed; table={}, error={}", table, e);
            ctx.fail(&event, e).await
        }
    }
}

async fn apply_session_timeouts(ctx: &CommandContext<'_>) -> Result<()> {
    let session = &ctx.config.session;
    for (name, value) in [
        ("lock_wait_timeout", session.lock_wait_timeout),
        ("innodb_lock_wait_timeout", session.innodb_lock_wait_timeout),
    ] {
        if value > 0 {
            ctx.db.set_session_variable(name, value).await?;
            log::debug!("Set session variable; name={}, value={}", name, value);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rename_statement() {
        assert_eq!(
            rename_statement("users"),
            "RENAME TABLE `users` TO `users_old`, `_users_new` TO `users`"
        );
    }
}
