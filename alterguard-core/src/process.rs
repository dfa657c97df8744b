//! Supervised execution of the Percona command-line tools.
//!
//! A tool is started with its password (if any) on standard input, both
//! output streams are drained concurrently into one call-scoped
//! [`ProcessRunState`], and the verdict combines the exit status with the
//! error lines spotted in the output. Both signals are needed: the tools
//! exit 0 in some genuine failures, such as an unanswerable password prompt.

use std::process::Stdio;
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::Mutex;

use crate::error::{AlterguardError, Result};

/// Known database-error fragments, matched case-insensitively anywhere in a line.
const DB_ERROR_SUBSTRINGS: &[&str] = &[
    "you have an error in your sql syntax",
    "unknown column",
    "unknown table",
    "doesn't exist",
    "can't create table",
    "access denied",
    "connection refused",
    "lost connection",
    "cannot connect to mysql",
    "operation failed",
    "duplicate entry",
];

/// Output produced when `--ask-pass` cannot read a password.
pub const PASSWORD_PROMPT_FAILURES: &[&str] = &["cannot read response", "term::readkey"];

/// Case-insensitive classifier for tool output lines.
#[derive(Debug, Clone)]
pub struct ErrorPatterns {
    prefixes: Vec<String>,
    substrings: Vec<String>,
}

impl ErrorPatterns {
    /// Generic error prefixes, `<tool>: error` / `<tool>: fatal`, the shared
    /// database-error fragments, and any tool-specific `extra` fragments.
    pub fn for_tool(tool: &str, extra: &[&str]) -> Self {
        let tool = tool.to_lowercase();
        let prefixes = vec![
            "error:".to_string(),
            "fatal:".to_string(),
            format!("{}: error", tool),
            format!("{}: fatal", tool),
        ];
        let substrings = DB_ERROR_SUBSTRINGS
            .iter()
            .chain(extra.iter())
            .map(|s| s.to_lowercase())
            .collect();
        Self {
            prefixes,
            substrings,
        }
    }

    /// Whether `line` reports an error.
    pub fn is_error_line(&self, line: &str) -> bool {
        let lower = line.trim().to_lowercase();
        self.prefixes.iter().any(|p| lower.starts_with(p.as_str()))
            || self.substrings.iter().any(|s| lower.contains(s.as_str()))
    }
}

/// Which stream a line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

impl OutputStream {
    fn tag(&self) -> &'static str {
        match self {
            OutputStream::Stdout => "[STDOUT]",
            OutputStream::Stderr => "[STDERR]",
        }
    }
}

/// State shared by the two drain tasks of one invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessRunState {
    /// At least one line matched an error pattern.
    pub has_error: bool,
    /// Matched lines, in arrival order.
    pub error_messages: Vec<String>,
    /// Every line, tagged with its stream, in arrival order.
    pub output_summary: Vec<String>,
}

impl ProcessRunState {
    /// Record one output line, flagging it if it matches `patterns`.
    pub fn record(&mut self, stream: OutputStream, line: &str, patterns: &ErrorPatterns) {
        self.output_summary.push(format!("{} {}", stream.tag(), line));
        if patterns.is_error_line(line) {
            self.has_error = true;
            self.error_messages.push(line.trim().to_string());
        }
    }
}

/// Everything needed to start one tool process.
#[derive(Clone)]
pub struct ToolInvocation {
    /// Display name (`pt-online-schema-change`, `pt-archiver`).
    pub tool: String,
    /// Executable to spawn.
    pub program: String,
    /// Command-line arguments, never containing a password.
    pub args: Vec<String>,
    /// Password written to standard input, followed by a newline.
    pub stdin_password: Option<String>,
    /// Table the run concerns, for messages.
    pub table: String,
}

impl std::fmt::Debug for ToolInvocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolInvocation")
            .field("tool", &self.tool)
            .field("program", &self.program)
            .field("args", &mask_args(&self.args))
            .field("stdin_password", &self.stdin_password.as_ref().map(|_| "[REDACTED]"))
            .field("table", &self.table)
            .finish()
    }
}

impl ToolInvocation {
    /// Password-free command line for logs and notifications.
    pub fn command_line(&self) -> String {
        if self.args.is_empty() {
            self.tool.clone()
        } else {
            format!("{} {}", self.tool, mask_args(&self.args))
        }
    }
}

/// Outcome of one supervised run.
#[derive(Debug, Clone, Serialize)]
pub struct ToolRunReport {
    /// Display name of the tool.
    pub tool: String,
    /// Table the run concerned.
    pub table: String,
    /// Process exit code; `None` when terminated by a signal.
    pub exit_code: Option<i32>,
    /// Whether the process reported success.
    pub exit_success: bool,
    /// Output lines that matched an error pattern.
    pub detected_errors: Vec<String>,
    /// Interleaved `[STDOUT]`/`[STDERR]` lines.
    pub transcript: String,
    /// Wall-clock run time.
    pub duration_ms: u64,
}

impl ToolRunReport {
    fn from_state(
        invocation: &ToolInvocation,
        exit_code: Option<i32>,
        exit_success: bool,
        state: ProcessRunState,
        duration_ms: u64,
    ) -> Self {
        Self {
            tool: invocation.tool.clone(),
            table: invocation.table.clone(),
            exit_code,
            exit_success,
            detected_errors: state.error_messages,
            transcript: state.output_summary.join("\n"),
            duration_ms,
        }
    }

    /// Zero exit status and no error lines.
    pub fn succeeded(&self) -> bool {
        self.exit_success && self.detected_errors.is_empty()
    }

    /// Why the run failed, combining the exit status and the detected lines.
    pub fn failure_reason(&self) -> Option<String> {
        let exit_failure = (!self.exit_success).then(|| match self.exit_code {
            Some(code) => format!("exit status {}", code),
            None => "terminated by signal".to_string(),
        });
        let detected = (!self.detected_errors.is_empty()).then(|| self.detected_errors.join("; "));

        match (exit_failure, detected) {
            (Some(exit), Some(lines)) => Some(format!("{} (detected errors: {})", exit, lines)),
            (Some(exit), None) => Some(exit),
            (None, Some(lines)) => Some(format!("detected errors: {}", lines)),
            (None, None) => None,
        }
    }

    /// Turn a failed run into [`AlterguardError::ToolFailed`].
    pub fn into_result(self) -> Result<Self> {
        match self.failure_reason() {
            None => Ok(self),
            Some(reason) => Err(AlterguardError::ToolFailed {
                tool: self.tool,
                table: self.table,
                reason,
                transcript: self.transcript,
            }),
        }
    }
}

/// Coarse result of a tool dry run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DryRunResult {
    /// Progress phrase recognised in the output, if any.
    pub status: Option<String>,
    /// Lines mentioning a warning.
    pub warnings: Vec<String>,
    /// Full transcript.
    pub summary: String,
}

impl DryRunResult {
    /// Classify a finished dry run's output.
    pub fn from_report(report: &ToolRunReport) -> Self {
        let lower = report.transcript.to_lowercase();
        let status = if lower.contains("dry run complete") {
            Some("Dry run completed".to_string())
        } else if lower.contains("starting a dry run") || lower.contains("dry run started") {
            Some("Dry run started".to_string())
        } else {
            None
        };

        let warnings = report
            .transcript
            .lines()
            .filter(|line| line.to_lowercase().contains("warning"))
            .map(|line| line.to_string())
            .collect();

        Self {
            status,
            warnings,
            summary: report.transcript.clone(),
        }
    }
}

/// Join arguments for display, masking any password-carrying value.
pub fn mask_args(args: &[String]) -> String {
    args.iter()
        .map(|arg| mask_arg(arg))
        .collect::<Vec<_>>()
        .join(" ")
}

fn mask_arg(arg: &str) -> String {
    if arg.starts_with("--password=") {
        return "--password=***".to_string();
    }
    if !arg.contains(',') && !arg.starts_with("p=") {
        return arg.to_string();
    }
    arg.split(',')
        .map(|part| {
            if part.starts_with("p=") {
                "p=***"
            } else {
                part
            }
        })
        .collect::<Vec<_>>()
        .join(",")
}

async fn drain<R>(
    reader: R,
    stream: OutputStream,
    tool: String,
    patterns: ErrorPatterns,
    state: Arc<Mutex<ProcessRunState>>,
) where
    R: AsyncRead + Unpin + Send + 'static,
{
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                match stream {
                    OutputStream::Stdout => log::info!("[{}] {}", tool, line),
                    OutputStream::Stderr => log::warn!("[{}] {}", tool, line),
                }
                state.lock().await.record(stream, &line, &patterns);
            }
            Ok(None) => break,
            Err(e) => {
                log::warn!("Failed to read tool output; tool={}, error={}", tool, e);
                break;
            }
        }
    }
}

/// Run a tool to completion and report what happened.
///
/// Returns `Err` only when the process could not be started or reaped;
/// a run that starts and fails comes back as a report whose
/// [`ToolRunReport::succeeded`] is false.
pub async fn run_tool(invocation: &ToolInvocation, patterns: &ErrorPatterns) -> Result<ToolRunReport> {
    log::info!(
        "Executing external tool; tool={}, table={}, command={}",
        invocation.tool,
        invocation.table,
        invocation.command_line()
    );

    let start = Instant::now();
    let mut command = Command::new(&invocation.program);
    command
        .args(&invocation.args)
        .stdin(if invocation.stdin_password.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = command.spawn().map_err(|e| AlterguardError::ToolFailed {
        tool: invocation.tool.clone(),
        table: invocation.table.clone(),
        reason: format!("failed to start '{}': {}", invocation.program, e),
        transcript: String::new(),
    })?;

    if let Some(ref password) = invocation.stdin_password {
        if let Some(mut stdin) = child.stdin.take() {
            if let Err(e) = stdin.write_all(format!("{}\n", password).as_bytes()).await {
                log::warn!(
                    "Failed to write password to tool stdin; tool={}, error={}",
                    invocation.tool,
                    e
                );
            }
        }
    }

    let state = Arc::new(Mutex::new(ProcessRunState::default()));
    let mut drains = Vec::with_capacity(2);
    if let Some(stdout) = child.stdout.take() {
        drains.push(tokio::spawn(drain(
            stdout,
            OutputStream::Stdout,
            invocation.tool.clone(),
            patterns.clone(),
            Arc::clone(&state),
        )));
    }
    if let Some(stderr) = child.stderr.take() {
        drains.push(tokio::spawn(drain(
            stderr,
            OutputStream::Stderr,
            invocation.tool.clone(),
            patterns.clone(),
            Arc::clone(&state),
        )));
    }

    for handle in drains {
        if let Err(e) = handle.await {
            log::warn!("Output drain task failed; tool={}, error={}", invocation.tool, e);
        }
    }

    let status = child.wait().await?;
    let state = std::mem::take(&mut *state.lock().await);
    let duration_ms = start.elapsed().as_millis() as u64;

    let report = ToolRunReport::from_state(
        invocation,
        status.code(),
        status.success(),
        state,
        duration_ms,
    );

    match report.failure_reason() {
        None => log::info!(
            "External tool completed; tool={}, table={}, duration_ms={}",
            report.tool,
            report.table,
            duration_ms
        ),
        Some(ref reason) => log::error!(
            "External tool failed; tool={}, table={}, reason={}",
            report.tool,
            report.table,
            reason
        ),
    }

    Ok(report)
}
