//! Apply a batch of DDL statements, table by table.

use std::time::Instant;

use serde::Serialize;

use crate::commands::{elapsed_ms, CommandContext};
use crate::error::{is_duplicate_error, AlterguardError, Result};
use crate::notify::TaskEvent;
use crate::preflight::{self, PreflightCheck};
use crate::ptosc::working_table_name;
use crate::row_count::{resolve_row_count, row_count_for_swap};
use crate::statement::{
    choose_strategy, group_by_table, parse_statements, Strategy, TableWorkGroup,
};

/// Report returned after a run.
#[derive(Debug, Serialize)]
pub struct RunReport {
    /// Whether statements and tools ran in dry-run mode.
    pub dry_run: bool,
    /// Number of statements submitted.
    pub statements: usize,
    /// One entry per executed statement or tool run, in execution order.
    pub outcomes: Vec<ExecutionOutcome>,
    /// Guard checks that let the run through.
    pub checks: Vec<PreflightCheck>,
    /// Total wall-clock time in milliseconds.
    pub total_time_ms: u64,
}

/// Result of one direct statement or one online change.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionOutcome {
    /// Notification task name.
    pub task: String,
    /// Target table; `None` for table-less statements.
    pub table: Option<String>,
    /// Statement executed, or the tool's clause list.
    pub statement: String,
    /// How an ALTER was applied; `None` for CREATE/DROP.
    pub strategy: Option<Strategy>,
    /// False when the statement was skipped as already applied.
    pub succeeded: bool,
    /// Nothing was sent to the server.
    pub dry_run: bool,
    /// Row count that drove the strategy choice.
    pub row_count_before: Option<i64>,
    /// Exact count of the working table after an online change.
    pub row_count_after: Option<i64>,
    /// Execution time in milliseconds.
    pub duration_ms: u64,
    /// Warning for a statement that was already applied.
    pub error_detail: Option<String>,
    /// Tool transcript for online changes.
    pub tool_output_summary: Option<String>,
}

struct DirectStatement<'s> {
    task: &'s str,
    table: Option<&'s str>,
    sql: &'s str,
    strategy: Option<Strategy>,
    row_count: Option<i64>,
}

/// Execute the run command.
///
/// Every statement is classified before anything executes. The first
/// fatal error stops the run; completed steps are not rolled back.
pub async fn execute(ctx: &CommandContext<'_>, queries: &[String]) -> Result<RunReport> {
    let started = Instant::now();

    if queries.is_empty() {
        return Err(AlterguardError::ConfigError("No queries to run".to_string()));
    }

    let statements = parse_statements(queries)?;
    if let Some(stmt) = statements
        .iter()
        .find(|s| s.schema.as_deref().is_some_and(|db| db != ctx.database))
    {
        return Err(AlterguardError::ConfigError(format!(
            "Statement targets schema '{}' but the connection uses '{}': {}",
            stmt.schema.as_deref().unwrap_or_default(),
            ctx.database,
            stmt.sql
        )));
    }
    let grouped = group_by_table(&statements);

    log::info!(
        "Starting run; statements={}, tables={}, unscoped={}, dry_run={}",
        statements.len(),
        grouped.groups.len(),
        grouped.unscoped.len(),
        ctx.dry_run
    );

    let mut report = RunReport {
        dry_run: ctx.dry_run,
        statements: statements.len(),
        outcomes: Vec::new(),
        checks: Vec::new(),
        total_time_ms: 0,
    };

    for group in &grouped.groups {
        run_table_group(ctx, group, &mut report).await?;
    }

    for stmt in &grouped.unscoped {
        let outcome = execute_direct(
            ctx,
            DirectStatement {
                task: "non-table-query",
                table: None,
                sql: &stmt.sql,
                strategy: None,
                row_count: None,
            },
        )
        .await?;
        report.outcomes.push(outcome);
    }

    report.total_time_ms = elapsed_ms(started);
    log::info!(
        "Run finished; outcomes={}, total_time_ms={}",
        report.outcomes.len(),
        report.total_time_ms
    );
    Ok(report)
}

async fn run_table_group(
    ctx: &CommandContext<'_>,
    group: &TableWorkGroup,
    report: &mut RunReport,
) -> Result<()> {
    let table = group.table.as_str();

    for stmt in &group.other_statements {
        let outcome = execute_direct(
            ctx,
            DirectStatement {
                task: "small-query",
                table: Some(table),
                sql: &stmt.sql,
                strategy: None,
                row_count: None,
            },
        )
        .await?;
        report.outcomes.push(outcome);
    }

    let Some(alter) = group.compound_alter() else {
        return Ok(());
    };

    let row_count = match resolve_row_count(ctx.db, table).await {
        Ok(rows) => Some(rows),
        Err(e) => {
            log::warn!(
                "Could not resolve row count, treating table as small; table={}, error={}",
                table,
                e
            );
            None
        }
    };

    let strategy = match row_count {
        Some(rows) => choose_strategy(rows, ctx.config.pt_osc_threshold),
        None => Strategy::Direct,
    };

    log::info!(
        "Selected strategy; table={}, rows={}, threshold={}, strategy={}",
        table,
        row_count.map_or_else(|| "unknown".to_string(), |r| r.to_string()),
        ctx.config.pt_osc_threshold,
        strategy
    );

    let connections = preflight::check_active_connections(
        ctx.db,
        ctx.config.connection_check.enabled,
        table,
    )
    .await;
    report
        .checks
        .push(ctx.gate("connection-check", table, connections).await?);

    let outcome = match strategy {
        Strategy::Direct => {
            execute_direct(
                ctx,
                DirectStatement {
                    task: "alter-table",
                    table: Some(table),
                    sql: &alter,
                    strategy: Some(Strategy::Direct),
                    row_count,
                },
            )
            .await?
        }
        Strategy::OnlineSchemaChange => {
            let stale = preflight::check_stale_artifact(ctx.db, table).await;
            report.checks.push(ctx.gate("pt-osc", table, stale).await?);
            run_online_change(ctx, group, row_count).await?
        }
    };
    report.outcomes.push(outcome);

    Ok(())
}

/// Execute one statement on the connection.
///
/// Duplicate-entry, duplicate-key and table-exists errors are reported as
/// warnings and the run continues.
async fn execute_direct(
    ctx: &CommandContext<'_>,
    stmt: DirectStatement<'_>,
) -> Result<ExecutionOutcome> {
    let task = ctx.task(stmt.task);
    let mut event = TaskEvent::new(&task, stmt.table.unwrap_or_default()).with_statement(stmt.sql);
    if let Some(rows) = stmt.row_count {
        event = event.with_row_count(rows);
    }

    let mut outcome = ExecutionOutcome {
        task: task.clone(),
        table: stmt.table.map(str::to_string),
        statement: stmt.sql.to_string(),
        strategy: stmt.strategy,
        succeeded: true,
        dry_run: ctx.dry_run,
        row_count_before: stmt.row_count,
        row_count_after: None,
        duration_ms: 0,
        error_detail: None,
        tool_output_summary: None,
    };

    ctx.notifications.start(&event).await;

    if ctx.dry_run {
        log::info!(
            "Dry run, would execute; task={}, sql={}",
            stmt.task,
            stmt.sql
        );
        ctx.notifications.success(&event).await;
        return Ok(outcome);
    }

    let started = Instant::now();
    let result = ctx.db.execute(stmt.sql).await;
    outcome.duration_ms = elapsed_ms(started);
    let event = event.with_duration(started.elapsed());

    match result {
        Ok(()) => {
            log::info!(
                "Statement executed; task={}, time_ms={}",
                stmt.task,
                outcome.duration_ms
            );
            ctx.notifications.success(&event).await;
        }
        Err(e) if is_duplicate_error(&e) => {
            let message = format!("Already applied, continuing: {}", e);
            log::warn!(
                "Statement already applied, continuing; task={}, error={}",
                stmt.task,
                e
            );
            ctx.notifications.warning(&event, &message).await;
            outcome.succeeded = false;
            outcome.error_detail = Some(message);
        }
        Err(e) => {
            log::error!("Statement failed; task={}, error={}", stmt.task, e);
            return ctx.fail(&event, e).await;
        }
    }

    Ok(outcome)
}

/// Run pt-online-schema-change for a table's combined clause list.
async fn run_online_change(
    ctx: &CommandContext<'_>,
    group: &TableWorkGroup,
    row_count: Option<i64>,
) -> Result<ExecutionOutcome> {
    let table = group.table.as_str();
    let fragments = group.combined_fragments();
    let dry_run = ctx.dry_run || ctx.config.pt_osc.dry_run;
    let task = ctx.task("pt-osc");

    let command = ctx.osc.describe_command(table, &fragments, dry_run);
    let mut event = TaskEvent::new(&task, table).with_statement(&command);
    if let Some(rows) = row_count {
        event = event.with_row_count(rows);
    }

    let mut outcome = ExecutionOutcome {
        task: task.clone(),
        table: Some(table.to_string()),
        statement: fragments.clone(),
        strategy: Some(Strategy::OnlineSchemaChange),
        succeeded: true,
        dry_run,
        row_count_before: row_count,
        row_count_after: None,
        duration_ms: 0,
        error_detail: None,
        tool_output_summary: None,
    };

    log::info!("Starting online schema change; table={}, command={}", table, command);
    ctx.notifications.start(&event).await;
    let started = Instant::now();

    if dry_run {
        return match ctx.osc.execute_dry_run(table, &fragments).await {
            Ok(result) => {
                outcome.duration_ms = elapsed_ms(started);
                let event = event.with_duration(started.elapsed());
                ctx.notifications.dry_run_result(&event, &result).await;
                outcome.tool_output_summary = Some(result.summary);
                Ok(outcome)
            }
            Err(e) => {
                let event = event
                    .with_duration(started.elapsed())
                    .with_transcript(ctx.osc.last_run_summary());
                ctx.fail(&event, e).await
            }
        };
    }

    match ctx.osc.execute_alter(table, &fragments, false).await {
        Ok(run) => {
            outcome.duration_ms = elapsed_ms(started);
            outcome.row_count_after = working_table_rows(ctx, table).await;
            let mut event = event
                .with_duration(started.elapsed())
                .with_transcript(run.transcript.clone());
            if let Some(rows) = outcome.row_count_after {
                event = event.with_row_count_after(rows);
            }
            ctx.notifications.success(&event).await;
            outcome.tool_output_summary = Some(run.transcript);
            Ok(outcome)
        }
        Err(e) => {
            let event = event
                .with_duration(started.elapsed())
                .with_transcript(ctx.osc.last_run_summary());
            ctx.fail(&event, e).await
        }
    }
}

/// Exact row count of the working table, when the tool left it in place.
async fn working_table_rows(ctx: &CommandContext<'_>, table: &str) -> Option<i64> {
    let working = working_table_name(table);
    match ctx.db.table_exists(&working).await {
        Ok(true) => match row_count_for_swap(ctx.db, &working).await {
            Ok(rows) => Some(rows),
            Err(e) => {
                log::warn!("Could not count working table; table={}, error={}", working, e);
                None
            }
        },
        Ok(false) => None,
        Err(e) => {
            log::warn!("Could not look up working table; table={}, error={}", working, e);
            None
        }
    }
}
