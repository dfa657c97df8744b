//! Error types for alterguard operations.

use thiserror::Error;

use crate::dsn::DsnError;

/// MySQL error codes that mean a statement was already applied by an
/// earlier, partially completed run.
pub const ER_DUP_ENTRY: u16 = 1062;
/// Duplicate key name.
pub const ER_DUP_KEYNAME: u16 = 1061;
/// Table already exists.
pub const ER_TABLE_EXISTS: u16 = 1050;

/// Extract the full error message from a `mysql_async::Error`,
/// including the server code and SQLSTATE that Display folds together.
pub fn format_db_error(e: &mysql_async::Error) -> String {
    match e {
        mysql_async::Error::Server(server) => {
            format!(
                "{} (code {}, state {})",
                server.message, server.code, server.state
            )
        }
        mysql_async::Error::Io(io) => {
            format!(
                "{}\n  Note: The database connection failed or was closed. This may indicate a network issue or server restart.",
                io
            )
        }
        other => {
            let mut msg = other.to_string();
            let mut source = std::error::Error::source(other);
            while let Some(s) = source {
                msg.push_str(&format!(": {}", s));
                source = s.source();
            }
            msg
        }
    }
}

/// MySQL server error code carried by a driver error, if any.
pub fn server_error_code(e: &mysql_async::Error) -> Option<u16> {
    match e {
        mysql_async::Error::Server(server) => Some(server.code),
        _ => None,
    }
}

/// All error types that alterguard operations can produce.
#[derive(Error, Debug)]
pub enum AlterguardError {
    /// Invalid or missing configuration (TOML parse errors, missing DSN, empty task list).
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// The connection string could not be decomposed.
    #[error("Invalid connection string: {0}")]
    DsnError(#[from] DsnError),

    /// A connection or driver-level database operation failed.
    #[error("Database error: {}", format_db_error(.0))]
    DatabaseError(#[from] mysql_async::Error),

    /// A single SQL statement was rejected by the server.
    #[error("SQL failed [{statement}]: {message}")]
    SqlFailed {
        statement: String,
        code: Option<u16>,
        message: String,
    },

    /// A submitted statement is not CREATE, ALTER or DROP.
    #[error("Unsupported statement (only CREATE, ALTER and DROP are accepted): {statement}")]
    UnsupportedStatement { statement: String },

    /// A guard check vetoed a destructive operation.
    #[error("Precondition '{check}' failed for {table}: {detail}")]
    PreconditionFailed {
        check: String,
        table: String,
        detail: String,
        hint: Option<String>,
    },

    /// A table the operation depends on does not exist.
    #[error("Table {table} does not exist")]
    TableMissing { table: String },

    /// Neither the approximate statistics nor an exact count could size a table.
    #[error("Row count unavailable for {table}: {reason}")]
    RowCountUnavailable { table: String, reason: String },

    /// An external tool exited non-zero or printed recognised error lines.
    #[error("{tool} failed for table {table}: {reason}")]
    ToolFailed {
        tool: String,
        table: String,
        reason: String,
        transcript: String,
    },

    /// One or more online-tool triggers could not be dropped.
    #[error("Failed to drop trigger(s) for {table}: {}", .triggers.join(", "))]
    TriggerCleanupFailed { table: String, triggers: Vec<String> },

    /// A notification could not be delivered.
    #[error("Notification failed: {0}")]
    NotificationError(String),

    /// A filesystem or process I/O operation failed.
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl AlterguardError {
    /// MySQL error code attached to this error, if it came from the server.
    pub fn mysql_code(&self) -> Option<u16> {
        match self {
            AlterguardError::SqlFailed { code, .. } => *code,
            AlterguardError::DatabaseError(e) => server_error_code(e),
            _ => None,
        }
    }

    /// Captured tool transcript, for failures that have one.
    pub fn transcript(&self) -> Option<&str> {
        match self {
            AlterguardError::ToolFailed { transcript, .. } if !transcript.is_empty() => {
                Some(transcript)
            }
            _ => None,
        }
    }
}

/// Duplicate-row, duplicate-key and table-already-exists errors.
///
/// These are downgraded to warnings by the orchestrator.
pub fn is_duplicate_error(e: &AlterguardError) -> bool {
    matches!(
        e.mysql_code(),
        Some(ER_DUP_ENTRY) | Some(ER_DUP_KEYNAME) | Some(ER_TABLE_EXISTS)
    )
}

/// Convenience type alias for `Result<T, AlterguardError>`.
pub type Result<T> = std::result::Result<T, AlterguardError>;
