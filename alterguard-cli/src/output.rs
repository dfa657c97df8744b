//! Terminal output formatting for all alterguard commands.
//! Uses comfy-table for tabular output and colored for
//! status-aware terminal styling.

use colored::Colorize;
use comfy_table::modifiers::UTF8_ROUND_CORNERS;
use comfy_table::presets::UTF8_FULL;
use comfy_table::{Cell, ContentArrangement, Table};

use alterguard_core::commands::run::ExecutionOutcome;
use alterguard_core::preflight::{CheckStatus, PreflightCheck};
use alterguard_core::{CleanupReport, PurgeReport, RunReport, SwapReport};

/// Last `lines` lines of a tool transcript.
pub fn transcript_tail(transcript: &str, lines: usize) -> String {
    let all: Vec<&str> = transcript.lines().collect();
    let start = all.len().saturating_sub(lines);
    all[start..].join("\n")
}

fn format_rows(rows: Option<i64>) -> String {
    rows.map(|r| r.to_string()).unwrap_or_else(|| "-".to_string())
}

/// Return a colored status for one executed step.
fn format_outcome(outcome: &ExecutionOutcome) -> String {
    if outcome.dry_run {
        "Dry Run".cyan().to_string()
    } else if outcome.succeeded {
        "Applied".green().to_string()
    } else {
        "Already Applied".yellow().to_string()
    }
}

fn print_checks(checks: &[PreflightCheck]) {
    for check in checks {
        let icon = match check.status {
            CheckStatus::Pass => "✓".green(),
            CheckStatus::Warn => "!".yellow(),
            CheckStatus::Skipped => "-".dimmed(),
        };
        println!("  {} {}: {}", icon, check.name, check.detail);
    }
}

/// Print the steps of a run as a colored table.
pub fn print_run_report(report: &RunReport) {
    if report.outcomes.is_empty() {
        println!("{}", "Nothing was executed.".yellow());
        return;
    }

    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .apply_modifier(UTF8_ROUND_CORNERS)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Task"),
            Cell::new("Table"),
            Cell::new("Strategy"),
            Cell::new("Rows"),
            Cell::new("Statement"),
            Cell::new("Status"),
            Cell::new("Time"),
        ]);

    for outcome in &report.outcomes {
        let strategy = outcome
            .strategy
            .map(|s| s.to_string())
            .unwrap_or_default();
        let rows = match outcome.row_count_after {
            Some(after) => format!("{} → {}", format_rows(outcome.row_count_before), after),
            None => format_rows(outcome.row_count_before),
        };

        table.add_row(vec![
            Cell::new(&outcome.task),
            Cell::new(outcome.table.as_deref().unwrap_or("")),
            Cell::new(&strategy),
            Cell::new(&rows),
            Cell::new(&outcome.statement),
            Cell::new(format_outcome(outcome)),
            Cell::new(format!("{}ms", outcome.duration_ms)),
        ]);
    }

    println!("{table}");

    for outcome in &report.outcomes {
        if let Some(ref detail) = outcome.error_detail {
            println!("{} {}", "WARNING:".yellow().bold(), detail);
        }
    }

    if !report.checks.is_empty() {
        println!();
        print_checks(&report.checks);
    }

    println!();
    println!(
        "{}",
        format!(
            "Processed {} statement(s) in {} step(s) (execution time {}ms)",
            report.statements,
            report.outcomes.len(),
            report.total_time_ms
        )
        .green()
        .bold()
    );
}

/// Print a swap report.
pub fn print_swap_report(report: &SwapReport) {
    print_checks(&report.checks);
    println!();

    if report.dry_run {
        println!("{} {}", "Would execute:".cyan().bold(), report.statement);
        return;
    }

    println!(
        "{}",
        format!(
            "Swapped {} with {} ({} → {} rows, {}ms)",
            report.table,
            report.replacement_table,
            report.row_count,
            report.replacement_row_count,
            report.duration_ms
        )
        .green()
        .bold()
    );
    println!("  {} original kept as {}", "→".green(), report.retired_table);
    if !report.analyzed {
        println!("  {} ANALYZE TABLE was skipped or failed", "!".yellow());
    }
    if report.slow_warning {
        println!(
            "  {} RENAME exceeded the execution time threshold",
            "!".yellow()
        );
    }
}

/// Print a cleanup report.
pub fn print_cleanup_report(report: &CleanupReport) {
    if let Some(ref purge) = report.purge {
        print_purge_report(purge);
        println!();
    }

    print_checks(&report.checks);

    let verb = if report.dry_run { "Would drop" } else { "Dropped" };
    println!(
        "{}",
        format!("Cleanup of {} complete:", report.table).green().bold()
    );
    for action in &report.actions {
        let icon = if action.applied { "✗".red() } else { "-".dimmed() };
        println!("  {} {} {}", icon, verb, action.object);
    }
}

/// Print a purge report.
pub fn print_purge_report(report: &PurgeReport) {
    let title = if report.dry_run {
        format!("pt-archiver dry run for {} finished", report.source_table)
    } else {
        format!(
            "Purged {} ({}ms)",
            report.source_table, report.duration_ms
        )
    };
    println!("{}", title.green().bold());
    println!("  {} {}", "→".dimmed(), report.command.dimmed());
    if !report.transcript.is_empty() {
        println!("{}", transcript_tail(&report.transcript, 10).dimmed());
    }
}
