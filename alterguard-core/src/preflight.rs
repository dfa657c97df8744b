//! Guard checks run before destructive steps.
//!
//! Each check either passes (returning a [`PreflightCheck`] for the
//! report) or fails with [`AlterguardError::PreconditionFailed`], which
//! aborts the step that asked for it.

use serde::Serialize;

use crate::db::SchemaDatabase;
use crate::error::{AlterguardError, Result};
use crate::ptosc::working_table_name;
use crate::row_count::row_count_for_swap;

/// Largest accepted row-count difference between a table and its replacement, in percent.
pub const ROW_COUNT_TOLERANCE_PERCENT: f64 = 5.0;

/// Result of a single passed or skipped check.
#[derive(Debug, Clone, Serialize)]
pub struct PreflightCheck {
    /// Human-readable name of the check (e.g. "Active Connections").
    pub name: String,
    /// Whether the check passed, warned, or was skipped.
    pub status: CheckStatus,
    /// Descriptive detail about the check result.
    pub detail: String,
}

/// Status of a check that did not veto its step.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub enum CheckStatus {
    /// The check passed.
    Pass,
    /// The check could not be evaluated and was let through.
    Warn,
    /// The check is disabled by configuration.
    Skipped,
}

impl std::fmt::Display for CheckStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CheckStatus::Pass => write!(f, "PASS"),
            CheckStatus::Warn => write!(f, "WARN"),
            CheckStatus::Skipped => write!(f, "SKIP"),
        }
    }
}

fn check(name: &str, status: CheckStatus, detail: String) -> PreflightCheck {
    PreflightCheck {
        name: name.to_string(),
        status,
        detail,
    }
}

fn failed(name: &str, table: &str, detail: String, hint: Option<String>) -> AlterguardError {
    AlterguardError::PreconditionFailed {
        check: name.to_string(),
        table: table.to_string(),
        detail,
        hint,
    }
}

/// Refuse to proceed while other sessions of the same user are connected.
pub async fn check_active_connections(
    db: &dyn SchemaDatabase,
    enabled: bool,
    table: &str,
) -> Result<PreflightCheck> {
    const NAME: &str = "Active Connections";

    if !enabled {
        log::debug!("Connection check disabled; table={}", table);
        return Ok(check(
            NAME,
            CheckStatus::Skipped,
            "disabled by [connection_check] enabled = false".to_string(),
        ));
    }

    let user = db.current_user().await?;
    let own_id = db.connection_id().await?;
    let others = db.count_user_connections(&user, own_id).await?;

    if others > 0 {
        log::warn!(
            "Other sessions are connected with the same user; user={}, connections={}, table={}",
            user,
            others,
            table
        );
        return Err(failed(
            NAME,
            table,
            format!("{} other connection(s) open for user '{}'", others, user),
            Some(
                "Wait for the other sessions of this user to finish, \
                 or set [connection_check] enabled = false"
                    .to_string(),
            ),
        ));
    }

    Ok(check(
        NAME,
        CheckStatus::Pass,
        format!("no other connections for user '{}'", user),
    ))
}

/// Refuse to start an online change while a working table from an earlier run exists.
pub async fn check_stale_artifact(db: &dyn SchemaDatabase, table: &str) -> Result<PreflightCheck> {
    const NAME: &str = "Stale Working Table";

    let working = working_table_name(table);
    if db.table_exists(&working).await? {
        return Err(failed(
            NAME,
            table,
            format!("working table {} already exists from a previous run", working),
            Some(format!(
                "Inspect and remove it with: alterguard cleanup {} --drop-new-table --drop-triggers",
                table
            )),
        ));
    }

    Ok(check(NAME, CheckStatus::Pass, format!("{} does not exist", working)))
}

/// Percentage difference between two counts, relative to the larger one.
///
/// Two empty tables differ by 0%.
pub fn row_count_difference_percent(a: i64, b: i64) -> f64 {
    let larger = a.max(b);
    if larger <= 0 {
        return 0.0;
    }
    ((a - b).abs() as f64 / larger as f64) * 100.0
}

/// Compare exact counts of `table` and `replacement` before a swap.
///
/// Passes when the difference is at most [`ROW_COUNT_TOLERANCE_PERCENT`].
pub async fn check_row_count_parity(
    db: &dyn SchemaDatabase,
    table: &str,
    replacement: &str,
) -> Result<(PreflightCheck, i64, i64)> {
    const NAME: &str = "Row Count Parity";

    let original = row_count_for_swap(db, table).await?;
    let new = row_count_for_swap(db, replacement).await?;
    let diff = row_count_difference_percent(original, new);

    log::info!(
        "Row count comparison; table={}, rows={}, replacement={}, rows_new={}, diff_percent={:.2}",
        table,
        original,
        replacement,
        new,
        diff
    );

    if diff > ROW_COUNT_TOLERANCE_PERCENT {
        return Err(failed(
            NAME,
            table,
            format!(
                "{} has {} rows, {} has {} rows ({:.2}% difference, limit {}%)",
                table, original, replacement, new, diff, ROW_COUNT_TOLERANCE_PERCENT
            ),
            Some(format!(
                "Check whether the online change for {} finished copying before swapping",
                table
            )),
        ));
    }

    Ok((
        check(
            NAME,
            CheckStatus::Pass,
            format!("{} vs {} rows ({:.2}% difference)", original, new, diff),
        ),
        original,
        new,
    ))
}

/// Refuse to drop a table whose buffer-pool footprint exceeds `threshold_mb`.
///
/// A non-positive threshold disables the check. A failed lookup is logged
/// and let through.
pub async fn check_cache_residency(
    db: &dyn SchemaDatabase,
    table: &str,
    threshold_mb: f64,
) -> Result<PreflightCheck> {
    const NAME: &str = "Buffer Pool Residency";

    if threshold_mb <= 0.0 {
        return Ok(check(
            NAME,
            CheckStatus::Skipped,
            "buffer_pool_size_threshold_mb is not set".to_string(),
        ));
    }

    let size_mb = match db.buffer_pool_size_mb(table).await {
        Ok(mb) => mb,
        Err(e) => {
            log::warn!(
                "Could not estimate buffer pool usage, continuing; table={}, error={}",
                table,
                e
            );
            return Ok(check(NAME, CheckStatus::Warn, format!("estimate failed: {}", e)));
        }
    };

    log::info!(
        "Buffer pool usage; table={}, size_mb={:.2}, threshold_mb={:.2}",
        table,
        size_mb,
        threshold_mb
    );

    if size_mb > threshold_mb {
        return Err(failed(
            NAME,
            table,
            format!(
                "{:.2} MB of {} is cached in the buffer pool (limit {:.2} MB)",
                size_mb, table, threshold_mb
            ),
            Some("Retry when the table has aged out of the buffer pool, or raise buffer_pool_size_threshold_mb".to_string()),
        ));
    }

    Ok(check(
        NAME,
        CheckStatus::Pass,
        format!("{:.2} MB cached", size_mb),
    ))
}
