//! Row-count resolution with an ordered fallback chain.
//!
//! Approximate statistics are tried first (three sources), then an exact
//! `COUNT(*)`. A zero from any approximate source is never trusted: it is
//! re-checked with `COUNT(*)` because statistics are frequently stale right
//! after a table is created or truncated.

use crate::db::{SchemaDatabase, StatsSource};
use crate::error::{AlterguardError, Result};

/// Resolve an approximate row count for `table`.
///
/// Each statistics source is only consulted if the previous one errored.
/// Falls back to an exact count when every approximate source fails.
pub async fn resolve_row_count(db: &dyn SchemaDatabase, table: &str) -> Result<i64> {
    for source in StatsSource::ALL {
        match db.stats_row_count(source, table).await {
            Ok(0) => {
                log::info!(
                    "Statistics report zero rows, verifying with COUNT(*); table={}, source={}",
                    table,
                    source.label()
                );
                return exact_or_unavailable(db, table).await;
            }
            Ok(rows) => {
                log::debug!(
                    "Resolved approximate row count; table={}, source={}, rows={}",
                    table,
                    source.label(),
                    rows
                );
                return Ok(rows);
            }
            Err(e) => {
                log::debug!(
                    "Row count source failed, trying next; table={}, source={}, error={}",
                    table,
                    source.label(),
                    e
                );
            }
        }
    }

    log::info!(
        "All approximate row count sources failed, using COUNT(*); table={}",
        table
    );
    exact_or_unavailable(db, table).await
}

/// Exact row count, used where the swap parity check needs precision.
pub async fn row_count_for_swap(db: &dyn SchemaDatabase, table: &str) -> Result<i64> {
    exact_or_unavailable(db, table).await
}

async fn exact_or_unavailable(db: &dyn SchemaDatabase, table: &str) -> Result<i64> {
    db.exact_row_count(table)
        .await
        .map_err(|e| AlterguardError::RowCountUnavailable {
            table: table.to_string(),
            reason: e.to_string(),
        })
}
