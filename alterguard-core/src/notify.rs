//! Lifecycle notifications.
//!
//! The engine reports through the [`Notifier`] trait. [`Notifications`]
//! wraps any notifier so that a delivery failure is logged and dropped;
//! a notification problem never stops a schema change.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

use crate::config::NotificationConfig;
use crate::error::{AlterguardError, Result};
use crate::process::DryRunResult;

/// Longest transcript tail included in a message.
const MAX_TRANSCRIPT_CHARS: usize = 2500;

/// Append ` (DRY RUN)` to a task name in dry-run mode.
pub fn task_name(base: &str, dry_run: bool) -> String {
    if dry_run {
        format!("{} (DRY RUN)", base)
    } else {
        base.to_string()
    }
}

/// What happened, to which table, and with what numbers.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TaskEvent {
    /// Task name, e.g. `pt-osc (DRY RUN)`.
    pub task: String,
    /// Target table; empty for table-less statements.
    pub table: String,
    /// Statement or command line involved.
    pub statement: Option<String>,
    /// Row count before the operation.
    pub row_count: Option<i64>,
    /// Row count of the working table after an online change.
    pub row_count_after: Option<i64>,
    /// How long the operation took.
    pub duration: Option<Duration>,
    /// Captured tool output.
    pub transcript: Option<String>,
}

impl TaskEvent {
    pub fn new(task: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            task: task.into(),
            table: table.into(),
            ..Default::default()
        }
    }

    pub fn with_statement(mut self, statement: impl Into<String>) -> Self {
        self.statement = Some(statement.into());
        self
    }

    pub fn with_row_count(mut self, rows: i64) -> Self {
        self.row_count = Some(rows);
        self
    }

    pub fn with_row_count_after(mut self, rows: i64) -> Self {
        self.row_count_after = Some(rows);
        self
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = Some(duration);
        self
    }

    /// Attach a transcript; blank transcripts are ignored.
    pub fn with_transcript(mut self, transcript: impl Into<String>) -> Self {
        let transcript = transcript.into();
        if !transcript.trim().is_empty() {
            self.transcript = Some(transcript);
        }
        self
    }
}

/// Sink for lifecycle events.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify_start(&self, event: &TaskEvent) -> Result<()>;
    async fn notify_success(&self, event: &TaskEvent) -> Result<()>;
    async fn notify_failure(&self, event: &TaskEvent, error: &str) -> Result<()>;
    async fn notify_warning(&self, event: &TaskEvent, message: &str) -> Result<()>;
    async fn notify_dry_run_result(&self, event: &TaskEvent, result: &DryRunResult) -> Result<()>;
}

/// Notifier that discards everything.
pub struct NoopNotifier;

#[async_trait]
impl Notifier for NoopNotifier {
    async fn notify_start(&self, _event: &TaskEvent) -> Result<()> {
        Ok(())
    }
    async fn notify_success(&self, _event: &TaskEvent) -> Result<()> {
        Ok(())
    }
    async fn notify_failure(&self, _event: &TaskEvent, _error: &str) -> Result<()> {
        Ok(())
    }
    async fn notify_warning(&self, _event: &TaskEvent, _message: &str) -> Result<()> {
        Ok(())
    }
    async fn notify_dry_run_result(&self, _event: &TaskEvent, _result: &DryRunResult) -> Result<()> {
        Ok(())
    }
}

/// Fire-and-forget front for a [`Notifier`].
#[derive(Clone)]
pub struct Notifications {
    inner: Arc<dyn Notifier>,
}

impl Notifications {
    pub fn new(inner: Arc<dyn Notifier>) -> Self {
        Self { inner }
    }

    /// A front that sends nothing.
    pub fn disabled() -> Self {
        Self::new(Arc::new(NoopNotifier))
    }

    fn log_failure(kind: &str, event: &TaskEvent, result: Result<()>) {
        if let Err(e) = result {
            log::error!(
                "Failed to send {} notification; task={}, table={}, error={}",
                kind,
                event.task,
                event.table,
                e
            );
        }
    }

    pub async fn start(&self, event: &TaskEvent) {
        Self::log_failure("start", event, self.inner.notify_start(event).await);
    }

    pub async fn success(&self, event: &TaskEvent) {
        Self::log_failure("success", event, self.inner.notify_success(event).await);
    }

    pub async fn failure(&self, event: &TaskEvent, error: &AlterguardError) {
        let result = self.inner.notify_failure(event, &error.to_string()).await;
        Self::log_failure("failure", event, result);
    }

    pub async fn warning(&self, event: &TaskEvent, message: &str) {
        Self::log_failure("warning", event, self.inner.notify_warning(event, message).await);
    }

    pub async fn dry_run_result(&self, event: &TaskEvent, result: &DryRunResult) {
        let sent = self.inner.notify_dry_run_result(event, result).await;
        Self::log_failure("dry run result", event, sent);
    }
}

// ── Slack ──

/// Attachment colour.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Good,
    Warning,
    Danger,
}

impl Severity {
    fn color(&self) -> &'static str {
        match self {
            Severity::Good => "good",
            Severity::Warning => "warning",
            Severity::Danger => "danger",
        }
    }
}

/// Posts events to a Slack incoming webhook.
pub struct SlackNotifier {
    webhook_url: Option<String>,
    environment: Option<String>,
}

impl SlackNotifier {
    /// Build from config; without a webhook URL every call is a no-op.
    pub fn new(config: &NotificationConfig) -> Self {
        if config.slack_webhook_url.is_none() {
            log::info!("SLACK_WEBHOOK_URL is not set, Slack notifications are disabled");
        }
        Self {
            webhook_url: config.slack_webhook_url.clone(),
            environment: config.environment.clone(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.webhook_url.is_some()
    }

    fn with_environment(&self, text: String) -> String {
        match self.environment.as_deref() {
            Some(env) if !env.is_empty() => format!("[{}] {}", env, text),
            _ => text,
        }
    }

    async fn send(&self, text: String, severity: Severity) -> Result<()> {
        let Some(ref url) = self.webhook_url else {
            return Ok(());
        };

        let payload = serde_json::json!({
            "username": "alterguard",
            "icon_emoji": ":gear:",
            "attachments": [{
                "color": severity.color(),
                "text": self.with_environment(text),
            }],
        });
        let url = url.clone();

        tokio::task::spawn_blocking(move || {
            ureq::post(url.as_str())
                .send_json(&payload)
                .map(|_| ())
                .map_err(|e| AlterguardError::NotificationError(format!("Slack webhook failed: {e}")))
        })
        .await
        .map_err(|e| AlterguardError::NotificationError(format!("Slack task failed: {e}")))?
    }
}

#[async_trait]
impl Notifier for SlackNotifier {
    async fn notify_start(&self, event: &TaskEvent) -> Result<()> {
        self.send(format_start(event), Severity::Good).await
    }

    async fn notify_success(&self, event: &TaskEvent) -> Result<()> {
        self.send(format_success(event), Severity::Good).await
    }

    async fn notify_failure(&self, event: &TaskEvent, error: &str) -> Result<()> {
        self.send(format_failure(event, error), Severity::Danger).await
    }

    async fn notify_warning(&self, event: &TaskEvent, message: &str) -> Result<()> {
        self.send(format_warning(event, message), Severity::Warning).await
    }

    async fn notify_dry_run_result(&self, event: &TaskEvent, result: &DryRunResult) -> Result<()> {
        let severity = if result.warnings.is_empty() {
            Severity::Good
        } else {
            Severity::Warning
        };
        self.send(format_dry_run(event, result), severity).await
    }
}

// ── message formatting ──

fn header(title: &str, event: &TaskEvent) -> String {
    format!("{}\nTask: {}\nTable: {}", title, event.task, event.table)
}

fn push_row_count(msg: &mut String, event: &TaskEvent) {
    match (event.row_count, event.row_count_after) {
        (Some(before), Some(after)) => {
            msg.push_str(&format!("\nRow count: {} (new table: {})", before, after))
        }
        (Some(before), None) => msg.push_str(&format!("\nRow count: {}", before)),
        (None, Some(after)) => msg.push_str(&format!("\nNew table row count: {}", after)),
        (None, None) => {}
    }
}

fn push_statement(msg: &mut String, event: &TaskEvent) {
    if let Some(ref statement) = event.statement {
        msg.push_str(&format!("\nQuery: `{}`", statement.replace('`', "")));
    }
}

fn push_transcript(msg: &mut String, label: &str, event: &TaskEvent) {
    if let Some(ref transcript) = event.transcript {
        msg.push_str(&format!(
            "\n\n{}:\n```\n{}\n```",
            label,
            tail(transcript, MAX_TRANSCRIPT_CHARS)
        ));
    }
}

fn format_duration(d: Duration) -> String {
    format!("{:.3}s", d.as_secs_f64())
}

/// The last `max` characters of `text`.
pub fn tail(text: &str, max: usize) -> &str {
    let count = text.chars().count();
    if count <= max {
        return text;
    }
    match text.char_indices().nth(count - max) {
        Some((idx, _)) => &text[idx..],
        None => text,
    }
}

pub fn format_start(event: &TaskEvent) -> String {
    let mut msg = header("🚀 Schema change started", event);
    push_row_count(&mut msg, event);
    push_statement(&mut msg, event);
    msg
}

pub fn format_success(event: &TaskEvent) -> String {
    let mut msg = header("✅ Schema change completed successfully", event);
    push_row_count(&mut msg, event);
    if let Some(d) = event.duration {
        msg.push_str(&format!("\nDuration: {}", format_duration(d)));
    }
    push_statement(&mut msg, event);
    push_transcript(&mut msg, "Tool output", event);
    msg
}

pub fn format_failure(event: &TaskEvent, error: &str) -> String {
    let mut msg = header("❌ Schema change failed", event);
    push_row_count(&mut msg, event);
    msg.push_str(&format!("\nError: {}", error));
    push_statement(&mut msg, event);
    push_transcript(&mut msg, "Tool output", event);
    msg
}

pub fn format_warning(event: &TaskEvent, message: &str) -> String {
    let mut msg = header("⚠️ Schema change warning", event);
    msg.push_str(&format!("\nWarning: {}", message));
    msg
}

pub fn format_dry_run(event: &TaskEvent, result: &DryRunResult) -> String {
    let mut msg = header("🧪 Dry run completed", event);
    if let Some(d) = event.duration {
        msg.push_str(&format!("\nDuration: {}", format_duration(d)));
    }
    if let Some(ref status) = result.status {
        msg.push_str(&format!("\nStatus: {}", status));
    }
    for warning in &result.warnings {
        msg.push_str(&format!("\nWarning: {}", warning));
    }
    if !result.summary.is_empty() {
        msg.push_str(&format!(
            "\n\n📋 pt-osc Output:\n```\n{}\n```",
            tail(&result.summary, MAX_TRANSCRIPT_CHARS)
        ));
    }
    msg
}
