//! Orchestration tests against in-memory fakes of the database, the
//! online schema-change tool, pt-archiver and the notification sink.
//!
//! Run with: cargo test --test orchestrator_test

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use alterguard_core::config::{AlterguardConfig, TriggerNaming};
use alterguard_core::db::{SchemaDatabase, StatsSource};
use alterguard_core::error::{AlterguardError, Result};
use alterguard_core::notify::{Notifications, Notifier, TaskEvent};
use alterguard_core::process::{DryRunResult, ToolRunReport};
use alterguard_core::ptarchiver::RowPurge;
use alterguard_core::ptosc::OnlineSchemaChange;
use alterguard_core::statement::Strategy;
use alterguard_core::{Alterguard, CleanupOptions};

// ── fakes ──

#[derive(Default)]
struct FakeDb {
    counts: Mutex<HashMap<String, i64>>,
    tables: Mutex<HashSet<String>>,
    failures: Vec<(String, u16)>,
    executed: Mutex<Vec<String>>,
    session: Mutex<Vec<(String, i64)>>,
    other_connections: i64,
    buffer_mb: f64,
    analyze_fails: bool,
    lookup_fails: bool,
    rename_delay: Option<Duration>,
}

impl FakeDb {
    fn with_table(self, table: &str, rows: i64) -> Self {
        self.add_table(table, rows);
        self
    }

    fn failing_on(mut self, fragment: &str, code: u16) -> Self {
        self.failures.push((fragment.to_string(), code));
        self
    }

    fn add_table(&self, table: &str, rows: i64) {
        self.tables.lock().unwrap().insert(table.to_string());
        self.counts.lock().unwrap().insert(table.to_string(), rows);
    }

    fn executed(&self) -> Vec<String> {
        self.executed.lock().unwrap().clone()
    }
}

#[async_trait]
impl SchemaDatabase for FakeDb {
    async fn stats_row_count(&self, source: StatsSource, table: &str) -> Result<i64> {
        match source {
            StatsSource::InnodbTableStats => self
                .counts
                .lock()
                .unwrap()
                .get(table)
                .copied()
                .ok_or_else(|| AlterguardError::RowCountUnavailable {
                    table: table.to_string(),
                    reason: "no stats".to_string(),
                }),
            _ => Err(AlterguardError::RowCountUnavailable {
                table: table.to_string(),
                reason: "unsupported".to_string(),
            }),
        }
    }

    async fn exact_row_count(&self, table: &str) -> Result<i64> {
        self.counts
            .lock()
            .unwrap()
            .get(table)
            .copied()
            .ok_or_else(|| AlterguardError::TableMissing {
                table: table.to_string(),
            })
    }

    async fn execute(&self, sql: &str) -> Result<()> {
        self.executed.lock().unwrap().push(sql.to_string());

        if sql.starts_with("RENAME") {
            if let Some(delay) = self.rename_delay {
                tokio::time::sleep(delay).await;
            }
        }

        match self.failures.iter().find(|(f, _)| sql.contains(f.as_str())) {
            Some((_, code)) => Err(AlterguardError::SqlFailed {
                statement: sql.to_string(),
                code: Some(*code),
                message: format!("server error {}", code),
            }),
            None => Ok(()),
        }
    }

    async fn set_session_variable(&self, name: &str, value: i64) -> Result<()> {
        self.session.lock().unwrap().push((name.to_string(), value));
        Ok(())
    }

    async fn table_exists(&self, table: &str) -> Result<bool> {
        if self.lookup_fails {
            return Err(AlterguardError::SqlFailed {
                statement: "SHOW TABLES".to_string(),
                code: None,
                message: "connection reset".to_string(),
            });
        }
        Ok(self.tables.lock().unwrap().contains(table))
    }

    async fn current_user(&self) -> Result<String> {
        Ok("app".to_string())
    }

    async fn connection_id(&self) -> Result<u64> {
        Ok(42)
    }

    async fn count_user_connections(&self, _user: &str, _exclude_id: u64) -> Result<i64> {
        Ok(self.other_connections)
    }

    async fn buffer_pool_size_mb(&self, _table: &str) -> Result<f64> {
        Ok(self.buffer_mb)
    }

    async fn analyze_table(&self, table: &str) -> Result<()> {
        if self.analyze_fails {
            return Err(AlterguardError::SqlFailed {
                statement: format!("ANALYZE TABLE {}", table),
                code: Some(1142),
                message: "command denied".to_string(),
            });
        }
        Ok(())
    }
}

#[derive(Default)]
struct FakeOsc {
    calls: Mutex<Vec<(String, String, bool)>>,
    failure: Option<String>,
    /// Table created by a successful run, with its row count.
    leaves_working_table: Option<(Arc<FakeDb>, i64)>,
}

impl FakeOsc {
    fn calls(&self) -> Vec<(String, String, bool)> {
        self.calls.lock().unwrap().clone()
    }

    fn transcript(table: &str) -> String {
        format!("[STDOUT] Altering `shop`.`{}`...", table)
    }
}

#[async_trait]
impl OnlineSchemaChange for FakeOsc {
    fn describe_command(&self, table: &str, alter: &str, force_dry_run: bool) -> String {
        let mode = if force_dry_run { "--dry-run" } else { "--execute" };
        format!("pt-online-schema-change --alter={} {} t={}", alter, mode, table)
    }

    async fn execute_alter(
        &self,
        table: &str,
        alter: &str,
        force_dry_run: bool,
    ) -> Result<ToolRunReport> {
        self.calls
            .lock()
            .unwrap()
            .push((table.to_string(), alter.to_string(), force_dry_run));

        if let Some(ref reason) = self.failure {
            return Err(AlterguardError::ToolFailed {
                tool: "pt-online-schema-change".to_string(),
                table: table.to_string(),
                reason: reason.clone(),
                transcript: self.last_run_summary(),
            });
        }

        if let Some((ref db, rows)) = self.leaves_working_table {
            db.add_table(&format!("_{}_new", table), rows);
        }

        Ok(ToolRunReport {
            tool: "pt-online-schema-change".to_string(),
            table: table.to_string(),
            exit_code: Some(0),
            exit_success: true,
            detected_errors: Vec::new(),
            transcript: Self::transcript(table),
            duration_ms: 0,
        })
    }

    async fn execute_dry_run(&self, table: &str, alter: &str) -> Result<DryRunResult> {
        self.calls
            .lock()
            .unwrap()
            .push((table.to_string(), alter.to_string(), true));
        Ok(DryRunResult {
            status: Some("Dry run completed".to_string()),
            warnings: Vec::new(),
            summary: "[STDOUT] Dry run complete.".to_string(),
        })
    }

    fn last_run_summary(&self) -> String {
        match self.failure {
            Some(ref reason) => format!("[STDERR] {}", reason),
            None => String::new(),
        }
    }
}

#[derive(Default)]
struct FakeArchiver {
    enabled: bool,
    purged: Mutex<Vec<(String, bool)>>,
}

#[async_trait]
impl RowPurge for FakeArchiver {
    fn enabled(&self) -> bool {
        self.enabled
    }

    fn describe_command(&self, table: &str, force_dry_run: bool) -> String {
        format!("pt-archiver --source=t={} --purge dry_run={}", table, force_dry_run)
    }

    async fn purge(&self, table: &str, force_dry_run: bool) -> Result<ToolRunReport> {
        self.purged
            .lock()
            .unwrap()
            .push((table.to_string(), force_dry_run));
        Ok(ToolRunReport {
            tool: "pt-archiver".to_string(),
            table: table.to_string(),
            exit_code: Some(0),
            exit_success: true,
            detected_errors: Vec::new(),
            transcript: "[STDOUT] deleted 10 rows".to_string(),
            duration_ms: 0,
        })
    }

    fn last_run_summary(&self) -> String {
        String::new()
    }
}

#[derive(Debug, Clone)]
struct Recorded {
    kind: &'static str,
    task: String,
    table: String,
    detail: Option<String>,
    transcript: Option<String>,
}

#[derive(Default)]
struct RecordingNotifier {
    events: Mutex<Vec<Recorded>>,
    broken: bool,
}

impl RecordingNotifier {
    fn push(&self, kind: &'static str, event: &TaskEvent, detail: Option<String>) -> Result<()> {
        self.events.lock().unwrap().push(Recorded {
            kind,
            task: event.task.clone(),
            table: event.table.clone(),
            detail,
            transcript: event.transcript.clone(),
        });
        if self.broken {
            return Err(AlterguardError::NotificationError("webhook down".to_string()));
        }
        Ok(())
    }

    fn of_kind(&self, kind: &str) -> Vec<Recorded> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.kind == kind)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify_start(&self, event: &TaskEvent) -> Result<()> {
        self.push("start", event, None)
    }
    async fn notify_success(&self, event: &TaskEvent) -> Result<()> {
        self.push("success", event, None)
    }
    async fn notify_failure(&self, event: &TaskEvent, error: &str) -> Result<()> {
        self.push("failure", event, Some(error.to_string()))
    }
    async fn notify_warning(&self, event: &TaskEvent, message: &str) -> Result<()> {
        self.push("warning", event, Some(message.to_string()))
    }
    async fn notify_dry_run_result(&self, event: &TaskEvent, result: &DryRunResult) -> Result<()> {
        self.push("dry_run", event, result.status.clone())
    }
}

struct Harness {
    db: Arc<FakeDb>,
    osc: Arc<FakeOsc>,
    archiver: Arc<FakeArchiver>,
    notifier: Arc<RecordingNotifier>,
}

impl Harness {
    fn new(db: FakeDb) -> Self {
        Self {
            db: Arc::new(db),
            osc: Arc::new(FakeOsc::default()),
            archiver: Arc::new(FakeArchiver::default()),
            notifier: Arc::new(RecordingNotifier::default()),
        }
    }

    fn guard(&self, config: AlterguardConfig, dry_run: bool) -> Alterguard {
        Alterguard::with_parts(
            config,
            "shop",
            self.db.clone(),
            self.osc.clone(),
            self.archiver.clone(),
            Notifications::new(self.notifier.clone()),
            dry_run,
        )
    }
}

fn queries(list: &[&str]) -> Vec<String> {
    list.iter().map(|q| q.to_string()).collect()
}

fn threshold(rows: i64) -> AlterguardConfig {
    AlterguardConfig {
        pt_osc_threshold: rows,
        ..Default::default()
    }
}

// ── run ──

#[tokio::test]
async fn test_alters_merge_into_one_statement() {
    let h = Harness::new(FakeDb::default().with_table("users", 10));
    let report = h
        .guard(AlterguardConfig::default(), false)
        .run(&queries(&[
            "CREATE TABLE t (id INT)",
            "ALTER TABLE users ADD COLUMN x INT",
            "ALTER TABLE users DROP COLUMN y",
        ]))
        .await
        .unwrap();

    assert_eq!(
        h.db.executed(),
        vec![
            "CREATE TABLE t (id INT)",
            "ALTER TABLE `users` ADD COLUMN x INT, DROP COLUMN y"
        ]
    );
    assert_eq!(report.statements, 3);
    assert_eq!(report.outcomes.len(), 2);
    assert_eq!(report.outcomes[1].strategy, Some(Strategy::Direct));
    assert_eq!(report.outcomes[1].row_count_before, Some(10));
    assert!(h.osc.calls().is_empty());
}

#[tokio::test]
async fn test_row_count_equal_to_threshold_is_direct() {
    let h = Harness::new(FakeDb::default().with_table("users", 100));
    h.guard(threshold(100), false)
        .run(&queries(&["ALTER TABLE users ADD COLUMN x INT"]))
        .await
        .unwrap();
    assert_eq!(h.db.executed(), vec!["ALTER TABLE `users` ADD COLUMN x INT"]);
    assert!(h.osc.calls().is_empty());
}

#[tokio::test]
async fn test_row_count_above_threshold_uses_online_tool() {
    let h = Harness::new(FakeDb::default().with_table("users", 101));
    let report = h
        .guard(threshold(100), false)
        .run(&queries(&[
            "ALTER TABLE users ADD COLUMN x INT",
            "ALTER TABLE users ADD INDEX idx_x (x)",
        ]))
        .await
        .unwrap();

    assert!(h.db.executed().is_empty());
    assert_eq!(
        h.osc.calls(),
        vec![(
            "users".to_string(),
            "ADD COLUMN x INT, ADD INDEX idx_x (x)".to_string(),
            false
        )]
    );
    let outcome = &report.outcomes[0];
    assert_eq!(outcome.strategy, Some(Strategy::OnlineSchemaChange));
    assert_eq!(
        outcome.tool_output_summary.as_deref(),
        Some("[STDOUT] Altering `shop`.`users`...")
    );
}

#[tokio::test]
async fn test_schema_qualified_alter_is_routed_by_size() {
    let h = Harness::new(FakeDb::default().with_table("users", 5_000_000));
    let report = h
        .guard(AlterguardConfig::default(), false)
        .run(&queries(&["ALTER TABLE `shop`.`users` ADD COLUMN x INT"]))
        .await
        .unwrap();

    assert!(h.db.executed().is_empty());
    assert_eq!(
        h.osc.calls(),
        vec![("users".to_string(), "ADD COLUMN x INT".to_string(), false)]
    );
    assert_eq!(report.outcomes[0].table.as_deref(), Some("users"));
    assert_eq!(report.outcomes[0].row_count_before, Some(5_000_000));
}

#[tokio::test]
async fn test_foreign_schema_is_rejected_before_execution() {
    let h = Harness::new(FakeDb::default().with_table("users", 10));
    let err = h
        .guard(AlterguardConfig::default(), false)
        .run(&queries(&[
            "CREATE TABLE t (id INT)",
            "ALTER TABLE billing.users ADD COLUMN x INT",
        ]))
        .await
        .unwrap_err();

    assert!(matches!(err, AlterguardError::ConfigError(_)));
    assert!(h.db.executed().is_empty());
    assert!(h.osc.calls().is_empty());
}

#[tokio::test]
async fn test_online_change_reports_working_table_rows() {
    let db = Arc::new(FakeDb::default().with_table("users", 5_000_000));
    let h = Harness {
        db: db.clone(),
        osc: Arc::new(FakeOsc {
            leaves_working_table: Some((db, 4_999_000)),
            ..Default::default()
        }),
        archiver: Arc::new(FakeArchiver::default()),
        notifier: Arc::new(RecordingNotifier::default()),
    };

    let report = h
        .guard(AlterguardConfig::default(), false)
        .run(&queries(&["ALTER TABLE users ENGINE=InnoDB"]))
        .await
        .unwrap();

    assert_eq!(report.outcomes[0].row_count_after, Some(4_999_000));
    let success = h.notifier.of_kind("success");
    assert_eq!(success.len(), 1);
    assert_eq!(success[0].task, "pt-osc");
    assert!(success[0].transcript.is_some());
}

#[tokio::test]
async fn test_duplicate_errors_never_abort_the_run() {
    let h = Harness::new(
        FakeDb::default()
            .with_table("users", 10)
            .failing_on("CREATE TABLE t", 1050)
            .failing_on("ADD INDEX", 1061),
    );
    let guard = h.guard(AlterguardConfig::default(), false);
    let batch = queries(&[
        "CREATE TABLE t (id INT)",
        "ALTER TABLE users ADD INDEX idx_a (a)",
    ]);

    for _ in 0..2 {
        let report = guard.run(&batch).await.unwrap();
        assert_eq!(report.outcomes.len(), 2);
        assert!(report.outcomes.iter().all(|o| !o.succeeded));
        assert!(report.outcomes.iter().all(|o| o.error_detail.is_some()));
    }

    assert_eq!(h.notifier.of_kind("warning").len(), 4);
    assert!(h.notifier.of_kind("failure").is_empty());
}

#[tokio::test]
async fn test_failure_stops_remaining_statements() {
    let h = Harness::new(
        FakeDb::default()
            .with_table("users", 10)
            .failing_on("DROP TABLE legacy", 1051),
    );
    let err = h
        .guard(AlterguardConfig::default(), false)
        .run(&queries(&[
            "DROP TABLE legacy",
            "ALTER TABLE users ADD COLUMN x INT",
        ]))
        .await
        .unwrap_err();

    assert_eq!(err.mysql_code(), Some(1051));
    assert_eq!(h.db.executed(), vec!["DROP TABLE legacy"]);
    let failures = h.notifier.of_kind("failure");
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].table, "legacy");
}

#[tokio::test]
async fn test_unsupported_statement_fails_before_execution() {
    let h = Harness::new(FakeDb::default());
    let err = h
        .guard(AlterguardConfig::default(), false)
        .run(&queries(&["CREATE TABLE a (id INT)", "SELECT 1"]))
        .await
        .unwrap_err();

    assert!(matches!(err, AlterguardError::UnsupportedStatement { .. }));
    assert!(h.db.executed().is_empty());
}

#[tokio::test]
async fn test_stale_working_table_blocks_online_change() {
    let h = Harness::new(
        FakeDb::default()
            .with_table("users", 5_000_000)
            .with_table("_users_new", 0),
    );
    let err = h
        .guard(AlterguardConfig::default(), false)
        .run(&queries(&["ALTER TABLE users ADD COLUMN x INT"]))
        .await
        .unwrap_err();

    match err {
        AlterguardError::PreconditionFailed { hint, .. } => {
            assert!(hint.unwrap().contains("--drop-new-table"));
        }
        other => panic!("unexpected error {:?}", other),
    }
    assert!(h.osc.calls().is_empty());
}

#[tokio::test]
async fn test_active_connections_block_direct_alter() {
    let h = Harness::new(FakeDb {
        other_connections: 1,
        ..FakeDb::default().with_table("users", 10)
    });
    let err = h
        .guard(AlterguardConfig::default(), false)
        .run(&queries(&["ALTER TABLE users ADD COLUMN x INT"]))
        .await
        .unwrap_err();

    assert!(matches!(err, AlterguardError::PreconditionFailed { .. }));
    assert!(h.db.executed().is_empty());
    assert_eq!(h.notifier.of_kind("failure")[0].task, "connection-check");
}

#[tokio::test]
async fn test_disabled_connection_check_lets_alter_through() {
    let h = Harness::new(FakeDb {
        other_connections: 3,
        ..FakeDb::default().with_table("users", 10)
    });
    let mut config = AlterguardConfig::default();
    config.connection_check.enabled = false;
    h.guard(config, false)
        .run(&queries(&["ALTER TABLE users ADD COLUMN x INT"]))
        .await
        .unwrap();
    assert_eq!(h.db.executed().len(), 1);
}

#[tokio::test]
async fn test_unresolvable_row_count_is_treated_as_small() {
    let h = Harness::new(FakeDb::default());
    let report = h
        .guard(AlterguardConfig::default(), false)
        .run(&queries(&["ALTER TABLE ghost ADD COLUMN x INT"]))
        .await
        .unwrap();

    assert_eq!(h.db.executed(), vec!["ALTER TABLE `ghost` ADD COLUMN x INT"]);
    assert_eq!(report.outcomes[0].row_count_before, None);
}

#[tokio::test]
async fn test_dry_run_executes_nothing() {
    let h = Harness::new(
        FakeDb::default()
            .with_table("small", 10)
            .with_table("big", 5_000_000),
    );
    let report = h
        .guard(AlterguardConfig::default(), true)
        .run(&queries(&[
            "ALTER TABLE small ADD COLUMN x INT",
            "ALTER TABLE big ADD COLUMN x INT",
        ]))
        .await
        .unwrap();

    assert!(report.dry_run);
    assert!(h.db.executed().is_empty());
    assert_eq!(
        h.osc.calls(),
        vec![("big".to_string(), "ADD COLUMN x INT".to_string(), true)]
    );
    let dry = h.notifier.of_kind("dry_run");
    assert_eq!(dry.len(), 1);
    assert_eq!(dry[0].task, "pt-osc (DRY RUN)");
    assert_eq!(dry[0].detail.as_deref(), Some("Dry run completed"));
}

#[tokio::test]
async fn test_configured_dry_run_applies_to_tool_only() {
    let h = Harness::new(FakeDb::default().with_table("big", 5_000_000));
    let mut config = AlterguardConfig::default();
    config.pt_osc.dry_run = true;
    h.guard(config, false)
        .run(&queries(&["ALTER TABLE big ADD COLUMN x INT"]))
        .await
        .unwrap();
    assert!(h.osc.calls()[0].2);
    assert_eq!(h.notifier.of_kind("dry_run")[0].task, "pt-osc");
}

#[tokio::test]
async fn test_tool_failure_is_announced_with_transcript() {
    let h = Harness {
        osc: Arc::new(FakeOsc {
            failure: Some("Access denied for user 'app'".to_string()),
            ..Default::default()
        }),
        ..Harness::new(FakeDb::default().with_table("users", 5_000_000))
    };
    let err = h
        .guard(AlterguardConfig::default(), false)
        .run(&queries(&["ALTER TABLE users ADD COLUMN x INT"]))
        .await
        .unwrap_err();

    assert!(matches!(err, AlterguardError::ToolFailed { .. }));
    let failures = h.notifier.of_kind("failure");
    assert_eq!(failures.len(), 1);
    assert_eq!(
        failures[0].transcript.as_deref(),
        Some("[STDERR] Access denied for user 'app'")
    );
}

#[tokio::test]
async fn test_broken_notifier_never_aborts() {
    let h = Harness {
        notifier: Arc::new(RecordingNotifier {
            broken: true,
            ..Default::default()
        }),
        ..Harness::new(FakeDb::default().with_table("users", 10))
    };
    let report = h
        .guard(AlterguardConfig::default(), false)
        .run(&queries(&["ALTER TABLE users ADD COLUMN x INT"]))
        .await
        .unwrap();
    assert_eq!(report.outcomes.len(), 1);
}

#[tokio::test]
async fn test_table_less_statements_run_last() {
    let h = Harness::new(FakeDb::default().with_table("users", 10));
    h.guard(AlterguardConfig::default(), false)
        .run(&queries(&[
            "CREATE INDEX idx_a ON users (a)",
            "ALTER TABLE users ADD COLUMN x INT",
        ]))
        .await
        .unwrap();
    assert_eq!(
        h.db.executed(),
        vec![
            "ALTER TABLE `users` ADD COLUMN x INT",
            "CREATE INDEX idx_a ON users (a)"
        ]
    );
}

// ── swap ──

fn swap_db(original: i64, new: i64) -> FakeDb {
    FakeDb::default()
        .with_table("users", original)
        .with_table("_users_new", new)
}

const RENAME: &str = "RENAME TABLE `users` TO `users_old`, `_users_new` TO `users`";

#[tokio::test]
async fn test_swap_at_five_percent_difference() {
    let h = Harness::new(swap_db(1000, 950));
    let mut config = AlterguardConfig::default();
    config.session.lock_wait_timeout = 5;
    let report = h.guard(config, false).swap("users").await.unwrap();

    assert_eq!(h.db.executed(), vec![RENAME]);
    assert_eq!(
        *h.db.session.lock().unwrap(),
        vec![("lock_wait_timeout".to_string(), 5)]
    );
    assert_eq!((report.row_count, report.replacement_row_count), (1000, 950));
    assert!(report.analyzed);
    assert!(!report.slow_warning);
}

#[tokio::test]
async fn test_swap_refuses_six_percent_difference() {
    let h = Harness::new(swap_db(1000, 940));
    let err = h
        .guard(AlterguardConfig::default(), false)
        .swap("users")
        .await
        .unwrap_err();

    assert!(matches!(err, AlterguardError::PreconditionFailed { .. }));
    assert!(h.db.executed().is_empty());
    assert_eq!(h.notifier.of_kind("failure")[0].task, "swap-row-count-check");
}

#[tokio::test]
async fn test_swap_requires_working_table() {
    let h = Harness::new(FakeDb::default().with_table("users", 10));
    let err = h
        .guard(AlterguardConfig::default(), false)
        .swap("users")
        .await
        .unwrap_err();
    match err {
        AlterguardError::TableMissing { table } => assert_eq!(table, "_users_new"),
        other => panic!("unexpected error {:?}", other),
    }
}

#[tokio::test]
async fn test_swap_lookup_error_is_announced() {
    let h = Harness::new(FakeDb {
        lookup_fails: true,
        ..swap_db(1000, 1000)
    });
    let err = h
        .guard(AlterguardConfig::default(), false)
        .swap("users")
        .await
        .unwrap_err();

    assert!(matches!(err, AlterguardError::SqlFailed { code: None, .. }));
    assert!(h.db.executed().is_empty());
    let failures = h.notifier.of_kind("failure");
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].task, "swap");
    assert!(failures[0].detail.as_ref().unwrap().contains("connection reset"));
}

#[tokio::test]
async fn test_swap_survives_analyze_failure() {
    let h = Harness::new(FakeDb {
        analyze_fails: true,
        ..swap_db(1000, 1000)
    });
    let report = h
        .guard(AlterguardConfig::default(), false)
        .swap("users")
        .await
        .unwrap();
    assert!(!report.analyzed);
    assert_eq!(h.db.executed(), vec![RENAME]);
}

#[tokio::test]
async fn test_swap_dry_run_renames_nothing() {
    let h = Harness::new(swap_db(1000, 1000));
    let report = h
        .guard(AlterguardConfig::default(), true)
        .swap("users")
        .await
        .unwrap();
    assert!(report.dry_run);
    assert_eq!(report.statement, RENAME);
    assert!(h.db.executed().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_slow_rename_warns_once() {
    let h = Harness::new(FakeDb {
        rename_delay: Some(Duration::from_secs(2)),
        ..swap_db(1000, 1000)
    });
    let mut config = AlterguardConfig::default();
    config.alert.execution_time_threshold_secs = 1;
    let report = h.guard(config, false).swap("users").await.unwrap();

    assert!(report.slow_warning);
    let warnings = h.notifier.of_kind("warning");
    assert_eq!(warnings.len(), 1);
    assert!(warnings[0].detail.as_ref().unwrap().contains("metadata lock"));
}

#[tokio::test(start_paused = true)]
async fn test_fast_rename_stays_quiet() {
    let h = Harness::new(FakeDb {
        rename_delay: Some(Duration::from_millis(500)),
        ..swap_db(1000, 1000)
    });
    let mut config = AlterguardConfig::default();
    config.alert.execution_time_threshold_secs = 1;
    let report = h.guard(config, false).swap("users").await.unwrap();

    assert!(!report.slow_warning);
    assert!(h.notifier.of_kind("warning").is_empty());
}

// ── cleanup / purge ──

#[tokio::test]
async fn test_cleanup_needs_an_option() {
    let h = Harness::new(FakeDb::default());
    let err = h
        .guard(AlterguardConfig::default(), false)
        .cleanup("users", CleanupOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, AlterguardError::ConfigError(_)));
}

#[tokio::test]
async fn test_trigger_cleanup_continues_past_failures() {
    let h = Harness::new(FakeDb::default().failing_on("pt_osc_shop_users_ins", 1360));
    let err = h
        .guard(AlterguardConfig::default(), false)
        .cleanup(
            "users",
            CleanupOptions {
                drop_triggers: true,
                ..Default::default()
            },
        )
        .await
        .unwrap_err();

    match err {
        AlterguardError::TriggerCleanupFailed { triggers, .. } => {
            assert_eq!(triggers, vec!["pt_osc_shop_users_ins"]);
        }
        other => panic!("unexpected error {:?}", other),
    }
    assert_eq!(
        h.db.executed(),
        vec![
            "DROP TRIGGER IF EXISTS `pt_osc_shop_users_ins`",
            "DROP TRIGGER IF EXISTS `pt_osc_shop_users_upd`",
            "DROP TRIGGER IF EXISTS `pt_osc_shop_users_del`",
        ]
    );
    assert_eq!(h.notifier.of_kind("failure")[0].task, "trigger-cleanup");
}

#[tokio::test]
async fn test_trigger_cleanup_table_only_naming() {
    let h = Harness::new(FakeDb::default());
    let mut config = AlterguardConfig::default();
    config.pt_osc.trigger_naming = TriggerNaming::TableOnly;
    let report = h
        .guard(config, false)
        .cleanup(
            "users",
            CleanupOptions {
                drop_triggers: true,
                ..Default::default()
            },
        )
        .await
        .unwrap();

    assert_eq!(report.actions.len(), 3);
    assert!(report.actions.iter().all(|a| a.applied));
    assert_eq!(report.actions[2].object, "pt_osc_users_del");
}

#[tokio::test]
async fn test_cleanup_purges_before_dropping_retired_table() {
    let h = Harness {
        archiver: Arc::new(FakeArchiver {
            enabled: true,
            ..Default::default()
        }),
        ..Harness::new(FakeDb::default().with_table("users_old", 10))
    };
    let report = h
        .guard(AlterguardConfig::default(), false)
        .cleanup(
            "users",
            CleanupOptions {
                drop_table: true,
                drop_new_table: true,
                ..Default::default()
            },
        )
        .await
        .unwrap();

    assert_eq!(
        *h.archiver.purged.lock().unwrap(),
        vec![("users_old".to_string(), false)]
    );
    assert!(report.purge.is_some());
    assert_eq!(
        h.db.executed(),
        vec![
            "DROP TABLE IF EXISTS `users_old`",
            "DROP TABLE IF EXISTS `_users_new`",
        ]
    );
}

#[tokio::test]
async fn test_cached_retired_table_is_not_dropped() {
    let h = Harness::new(FakeDb {
        buffer_mb: 500.0,
        ..FakeDb::default().with_table("users_old", 10)
    });
    let mut config = AlterguardConfig::default();
    config.buffer_pool_size_threshold_mb = 100.0;
    let err = h
        .guard(config, false)
        .cleanup(
            "users",
            CleanupOptions {
                drop_table: true,
                ..Default::default()
            },
        )
        .await
        .unwrap_err();

    assert!(matches!(err, AlterguardError::PreconditionFailed { .. }));
    assert!(h.db.executed().is_empty());
}

#[tokio::test]
async fn test_purge_requires_enabled_archiver() {
    let h = Harness::new(FakeDb::default().with_table("users_old", 10));
    let err = h
        .guard(AlterguardConfig::default(), false)
        .purge("users")
        .await
        .unwrap_err();
    assert!(matches!(err, AlterguardError::ConfigError(_)));
}

#[tokio::test]
async fn test_purge_dry_run_is_forwarded() {
    let h = Harness {
        archiver: Arc::new(FakeArchiver {
            enabled: true,
            ..Default::default()
        }),
        ..Harness::new(FakeDb::default().with_table("users_old", 10))
    };
    let report = h
        .guard(AlterguardConfig::default(), true)
        .purge("users")
        .await
        .unwrap();

    assert!(report.dry_run);
    assert_eq!(report.source_table, "users_old");
    assert_eq!(
        *h.archiver.purged.lock().unwrap(),
        vec![("users_old".to_string(), true)]
    );
}

#[tokio::test]
async fn test_purge_lookup_error_is_announced() {
    let h = Harness {
        archiver: Arc::new(FakeArchiver {
            enabled: true,
            ..Default::default()
        }),
        ..Harness::new(FakeDb {
            lookup_fails: true,
            ..FakeDb::default().with_table("users_old", 10)
        })
    };
    let err = h
        .guard(AlterguardConfig::default(), false)
        .purge("users")
        .await
        .unwrap_err();

    assert!(matches!(err, AlterguardError::SqlFailed { code: None, .. }));
    assert!(h.archiver.purged.lock().unwrap().is_empty());
    let failures = h.notifier.of_kind("failure");
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].table, "users_old");
}
