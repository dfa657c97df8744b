//! pt-online-schema-change integration.
//!
//! Builds the tool's command line from the connection info and the
//! `[pt_osc]` settings, then runs it through [`crate::process::run_tool`].

use std::sync::Mutex;

use async_trait::async_trait;

use crate::config::{PtOscConfig, TriggerNaming};
use crate::dsn::ConnectionInfo;
use crate::error::Result;
use crate::process::{
    run_tool, DryRunResult, ErrorPatterns, ToolInvocation, ToolRunReport,
    PASSWORD_PROMPT_FAILURES,
};

/// Display name used in logs, notifications and error patterns.
pub const TOOL_NAME: &str = "pt-online-schema-change";

/// Name of the table the tool builds while copying rows.
pub fn working_table_name(table: &str) -> String {
    format!("_{}_new", table)
}

/// Name the original table gets after the swap.
pub fn retired_table_name(table: &str) -> String {
    format!("{}_old", table)
}

/// The tool's three triggers, in insert/update/delete order.
pub fn trigger_names(database: &str, table: &str, naming: TriggerNaming) -> [String; 3] {
    let stem = match naming {
        TriggerNaming::DatabaseQualified => format!("pt_osc_{}_{}", database, table),
        TriggerNaming::TableOnly => format!("pt_osc_{}", table),
    };
    [
        format!("{}_ins", stem),
        format!("{}_upd", stem),
        format!("{}_del", stem),
    ]
}

/// Argument list for one run, plus the password to feed on stdin.
///
/// `--dry-run` wins whenever the caller forces it or the settings ask
/// for it; otherwise `--execute` is passed.
pub fn build_args(
    config: &PtOscConfig,
    conn: &ConnectionInfo,
    table: &str,
    alter: &str,
    force_dry_run: bool,
) -> (Vec<String>, Option<String>) {
    let tool_dsn = conn.tool_dsn(table, true).to_string();
    let mut args = vec![format!("--alter={}", alter)];

    if let Some(ref charset) = config.charset {
        if !charset.is_empty() {
            args.push(format!("--charset={}", charset));
        }
    }

    if let Some(ref method) = config.recursion_method {
        if !method.is_empty() {
            let method = method
                .replace("<db>", &conn.database)
                .replace("<table>", table);
            args.push(format!("--recursion-method={}", method));
            if method == "dsn" {
                args.push(format!("--recursion-dsn={}", tool_dsn));
            }
        }
    }

    if conn.password.is_some() {
        args.push("--ask-pass".to_string());
    }
    if config.no_swap_tables {
        args.push("--no-swap-tables".to_string());
    }
    if config.no_drop_triggers {
        args.push("--no-drop-triggers".to_string());
    }
    if config.no_drop_new_table {
        args.push("--no-drop-new-table".to_string());
    }
    if config.no_drop_old_table {
        args.push("--no-drop-old-table".to_string());
    }
    if config.chunk_size > 0 {
        args.push(format!("--chunk-size={}", config.chunk_size));
    }
    if config.max_lag > 0.0 {
        args.push(format!("--max-lag={}", config.max_lag));
    }
    if config.statistics {
        args.push("--statistics".to_string());
    }

    if force_dry_run || config.dry_run {
        args.push("--dry-run".to_string());
    } else {
        args.push("--execute".to_string());
    }

    args.push(tool_dsn);

    (args, conn.password.clone())
}

/// Runs online schema changes for large tables.
#[async_trait]
pub trait OnlineSchemaChange: Send + Sync {
    /// Password-free command line that a run would use.
    fn describe_command(&self, table: &str, alter: &str, force_dry_run: bool) -> String;

    /// Apply `alter` (a clause list) to `table`.
    async fn execute_alter(
        &self,
        table: &str,
        alter: &str,
        force_dry_run: bool,
    ) -> Result<ToolRunReport>;

    /// Validate `alter` without changing anything.
    async fn execute_dry_run(&self, table: &str, alter: &str) -> Result<DryRunResult>;

    /// Transcript of the most recent run, empty before the first.
    fn last_run_summary(&self) -> String;
}

/// [`OnlineSchemaChange`] backed by the real tool.
pub struct PtOscExecutor {
    config: PtOscConfig,
    connection: ConnectionInfo,
    last_summary: Mutex<String>,
}

impl PtOscExecutor {
    pub fn new(config: PtOscConfig, connection: ConnectionInfo) -> Self {
        Self {
            config,
            connection,
            last_summary: Mutex::new(String::new()),
        }
    }

    fn invocation(&self, table: &str, alter: &str, force_dry_run: bool) -> ToolInvocation {
        let (args, password) =
            build_args(&self.config, &self.connection, table, alter, force_dry_run);
        ToolInvocation {
            tool: TOOL_NAME.to_string(),
            program: self.config.binary.clone(),
            args,
            stdin_password: password,
            table: table.to_string(),
        }
    }

    async fn run(&self, table: &str, alter: &str, force_dry_run: bool) -> Result<ToolRunReport> {
        let invocation = self.invocation(table, alter, force_dry_run);
        let patterns = ErrorPatterns::for_tool(TOOL_NAME, PASSWORD_PROMPT_FAILURES);
        let report = run_tool(&invocation, &patterns).await?;
        if let Ok(mut last) = self.last_summary.lock() {
            *last = report.transcript.clone();
        }
        report.into_result()
    }
}

#[async_trait]
impl OnlineSchemaChange for PtOscExecutor {
    fn describe_command(&self, table: &str, alter: &str, force_dry_run: bool) -> String {
        self.invocation(table, alter, force_dry_run).command_line()
    }

    async fn execute_alter(
        &self,
        table: &str,
        alter: &str,
        force_dry_run: bool,
    ) -> Result<ToolRunReport> {
        log::info!(
            "Running online schema change; table={}, alter={}",
            table,
            alter
        );
        self.run(table, alter, force_dry_run).await
    }

    async fn execute_dry_run(&self, table: &str, alter: &str) -> Result<DryRunResult> {
        log::info!("Running online schema change dry run; table={}", table);
        let report = self.run(table, alter, true).await?;
        Ok(DryRunResult::from_report(&report))
    }

    fn last_run_summary(&self) -> String {
        self.last_summary
            .lock()
            .map(|s| s.clone())
            .unwrap_or_default()
    }
}
