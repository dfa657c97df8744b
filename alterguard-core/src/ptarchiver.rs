//! pt-archiver integration, used to purge a retired table before it is dropped.

use std::sync::Mutex;

use async_trait::async_trait;

use crate::config::PtArchiverConfig;
use crate::dsn::ConnectionInfo;
use crate::error::Result;
use crate::process::{
    run_tool, ErrorPatterns, ToolInvocation, ToolRunReport, PASSWORD_PROMPT_FAILURES,
};

/// Display name used in logs, notifications and error patterns.
pub const TOOL_NAME: &str = "pt-archiver";

/// Filter used when none is configured.
pub const DEFAULT_WHERE: &str = "1=1";

/// Argument list for purging `table`, plus the password to feed on stdin.
pub fn build_args(
    config: &PtArchiverConfig,
    conn: &ConnectionInfo,
    table: &str,
    force_dry_run: bool,
) -> (Vec<String>, Option<String>) {
    let mut args = vec![
        format!("--source={}", conn.tool_dsn(table, false)),
        format!("--user={}", conn.user),
    ];

    if conn.password.is_some() {
        args.push("--ask-pass".to_string());
    }

    let filter = match config.where_clause.as_deref() {
        Some(w) if !w.trim().is_empty() => w,
        _ => DEFAULT_WHERE,
    };
    args.push(format!("--where={}", filter));

    if config.limit > 0 {
        args.push(format!("--limit={}", config.limit));
    }
    if config.commit_each {
        args.push("--commit-each".to_string());
    }
    args.push("--purge".to_string());
    if config.progress > 0 {
        args.push(format!("--progress={}", config.progress));
    }
    if config.max_lag > 0.0 {
        args.push(format!("--max-lag={}", config.max_lag));
    }
    if config.no_check_charset {
        args.push("--no-check-charset".to_string());
    }
    if config.bulk_delete {
        args.push("--bulk-delete".to_string());
    }
    if config.primary_key_only {
        args.push("--primary-key-only".to_string());
    }
    if config.statistics {
        args.push("--statistics".to_string());
    }
    if force_dry_run {
        args.push("--dry-run".to_string());
    }

    (args, conn.password.clone())
}

/// Deletes rows from a table ahead of dropping it.
#[async_trait]
pub trait RowPurge: Send + Sync {
    /// Whether purging is configured at all.
    fn enabled(&self) -> bool;

    /// Password-free command line that a run would use.
    fn describe_command(&self, table: &str, force_dry_run: bool) -> String;

    /// Purge every row of `table` matching the configured filter.
    async fn purge(&self, table: &str, force_dry_run: bool) -> Result<ToolRunReport>;

    /// Transcript of the most recent run, empty before the first.
    fn last_run_summary(&self) -> String;
}

/// [`RowPurge`] backed by the real tool.
pub struct PtArchiverExecutor {
    config: PtArchiverConfig,
    connection: ConnectionInfo,
    last_summary: Mutex<String>,
}

impl PtArchiverExecutor {
    pub fn new(config: PtArchiverConfig, connection: ConnectionInfo) -> Self {
        Self {
            config,
            connection,
            last_summary: Mutex::new(String::new()),
        }
    }

    fn invocation(&self, table: &str, force_dry_run: bool) -> ToolInvocation {
        let (args, password) = build_args(&self.config, &self.connection, table, force_dry_run);
        ToolInvocation {
            tool: TOOL_NAME.to_string(),
            program: self.config.binary.clone(),
            args,
            stdin_password: password,
            table: table.to_string(),
        }
    }
}

#[async_trait]
impl RowPurge for PtArchiverExecutor {
    fn enabled(&self) -> bool {
        self.config.enabled
    }

    fn describe_command(&self, table: &str, force_dry_run: bool) -> String {
        self.invocation(table, force_dry_run).command_line()
    }

    async fn purge(&self, table: &str, force_dry_run: bool) -> Result<ToolRunReport> {
        let invocation = self.invocation(table, force_dry_run);
        let patterns = ErrorPatterns::for_tool(TOOL_NAME, PASSWORD_PROMPT_FAILURES);
        let report = run_tool(&invocation, &patterns).await?;
        if let Ok(mut last) = self.last_summary.lock() {
            *last = report.transcript.clone();
        }
        report.into_result()
    }

    fn last_run_summary(&self) -> String {
        self.last_summary
            .lock()
            .map(|s| s.clone())
            .unwrap_or_default()
    }
}
