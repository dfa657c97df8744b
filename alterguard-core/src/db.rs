//! MySQL access: the `SchemaDatabase` seam and its `mysql_async` implementation.
//!
//! Everything the engine asks of the server goes through [`SchemaDatabase`],
//! so the orchestrator and the guard checks can be driven by in-memory
//! fakes in tests.

use async_trait::async_trait;
use mysql_async::prelude::*;
use mysql_async::{Conn, OptsBuilder};
use tokio::sync::Mutex;

use crate::config::DatabaseConfig;
use crate::dsn::ConnectionInfo;
use crate::error::{format_db_error, server_error_code, AlterguardError, Result};

/// MySQL error code for a rejected login.
const ER_ACCESS_DENIED: u16 = 1045;
/// MySQL error code for an unknown database.
const ER_BAD_DB: u16 = 1049;

/// Approximate row-count sources, tried in this order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatsSource {
    /// `mysql.innodb_table_stats.n_rows`.
    InnodbTableStats,
    /// `information_schema.INNODB_TABLESTATS.NUM_ROWS` (8.0 naming).
    InnodbTablestats,
    /// `information_schema.TABLES.TABLE_ROWS`.
    Catalog,
}

impl StatsSource {
    /// All approximate sources, in fallback order.
    pub const ALL: [StatsSource; 3] = [
        StatsSource::InnodbTableStats,
        StatsSource::InnodbTablestats,
        StatsSource::Catalog,
    ];

    /// Short label used in log lines.
    pub fn label(&self) -> &'static str {
        match self {
            StatsSource::InnodbTableStats => "mysql.innodb_table_stats",
            StatsSource::InnodbTablestats => "information_schema.INNODB_TABLESTATS",
            StatsSource::Catalog => "information_schema.TABLES",
        }
    }
}

/// The SQL operations the engine needs from a MySQL server.
///
/// Implementations must run every call on the same session, since
/// session variables set before a rename have to apply to it.
#[async_trait]
pub trait SchemaDatabase: Send + Sync {
    /// Approximate row count from one statistics source.
    async fn stats_row_count(&self, source: StatsSource, table: &str) -> Result<i64>;

    /// Exact `SELECT COUNT(*)`.
    async fn exact_row_count(&self, table: &str) -> Result<i64>;

    /// Execute one statement, discarding any result set.
    async fn execute(&self, sql: &str) -> Result<()>;

    /// `SET SESSION <name> = <value>`.
    async fn set_session_variable(&self, name: &str, value: i64) -> Result<()>;

    /// Whether `table` exists in the connected schema.
    async fn table_exists(&self, table: &str) -> Result<bool>;

    /// Current login user, without the `@host` part.
    async fn current_user(&self) -> Result<String>;

    /// Id of the session this handle runs on.
    async fn connection_id(&self) -> Result<u64>;

    /// Number of live sessions for `user`, excluding `exclude_id`.
    async fn count_user_connections(&self, user: &str, exclude_id: u64) -> Result<i64>;

    /// Estimated buffer-pool footprint of `table` in megabytes.
    async fn buffer_pool_size_mb(&self, table: &str) -> Result<f64>;

    /// `ANALYZE TABLE` to refresh optimizer statistics.
    async fn analyze_table(&self, table: &str) -> Result<()>;
}

/// Quote a MySQL identifier with backticks, doubling embedded backticks.
pub fn quote_ident(name: &str) -> String {
    format!("`{}`", name.replace('`', "``"))
}

/// Quote a possibly schema-qualified table name (`db.table`).
pub fn quote_table(name: &str) -> Result<String> {
    let parts: Vec<&str> = name.split('.').collect();
    if parts.len() > 2 {
        return Err(AlterguardError::ConfigError(format!(
            "Table name '{}' has too many qualifiers",
            name
        )));
    }
    let mut quoted = Vec::with_capacity(parts.len());
    for part in parts {
        validate_identifier(part)?;
        quoted.push(quote_ident(part));
    }
    Ok(quoted.join("."))
}

/// Validate that a SQL identifier contains only safe characters.
///
/// Returns an error for names with characters outside `[a-zA-Z0-9_$]`.
pub fn validate_identifier(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(AlterguardError::ConfigError(
            "Identifier cannot be empty".to_string(),
        ));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '$')
    {
        return Err(AlterguardError::ConfigError(format!(
            "Identifier '{}' contains invalid characters. Only [a-zA-Z0-9_$] are allowed.",
            name
        )));
    }
    Ok(())
}

/// Strip the `@host` suffix from a `USER()` value.
pub fn user_without_host(user: &str) -> &str {
    match user.find('@') {
        Some(idx) => &user[..idx],
        None => user,
    }
}

/// Convert a page count and page size into megabytes.
pub fn pages_to_mb(pages: u64, page_size: u64) -> f64 {
    (pages as f64 * page_size as f64) / (1024.0 * 1024.0)
}

/// Check if a driver error is a permanent failure that should not be retried.
fn is_permanent_error(e: &mysql_async::Error) -> bool {
    matches!(server_error_code(e), Some(ER_ACCESS_DENIED) | Some(ER_BAD_DB))
}

fn opts_from(info: &ConnectionInfo) -> OptsBuilder {
    OptsBuilder::default()
        .ip_or_hostname(info.host.clone())
        .tcp_port(info.port)
        .user(Some(info.user.clone()))
        .pass(info.password.clone())
        .db_name(Some(info.database.clone()))
        .prefer_socket(false)
}

async fn connect_once(
    info: &ConnectionInfo,
    connect_timeout_secs: u32,
) -> std::result::Result<Conn, mysql_async::Error> {
    let connect_fut = Conn::new(opts_from(info));

    if connect_timeout_secs > 0 {
        match tokio::time::timeout(
            std::time::Duration::from_secs(connect_timeout_secs as u64),
            connect_fut,
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(mysql_async::Error::Io(mysql_async::IoError::Io(
                std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    format!("connect timed out after {}s", connect_timeout_secs),
                ),
            ))),
        }
    } else {
        connect_fut.await
    }
}

/// A single MySQL session.
///
/// One connection is held for the whole run so that session variables and
/// `CONNECTION_ID()` refer to the session that actually issues the DDL.
pub struct MySqlDatabase {
    conn: Mutex<Conn>,
    database: String,
}

impl MySqlDatabase {
    /// Connect, retrying up to `connect_retries` times with exponential backoff + jitter.
    ///
    /// Each retry waits `min(2^attempt, 30) + rand(0..1000ms)` before the next attempt.
    /// Access-denied and unknown-database errors are not retried.
    pub async fn connect(info: &ConnectionInfo, settings: &DatabaseConfig) -> Result<Self> {
        let retries = settings.connect_retries;
        let mut last_err = None;

        for attempt in 0..=retries {
            if attempt > 0 {
                let base_delay = std::cmp::min(1u64 << attempt, 30);
                let jitter_ms = fastrand::u64(0..1000);
                let delay = std::time::Duration::from_secs(base_delay)
                    + std::time::Duration::from_millis(jitter_ms);
                log::info!(
                    "Connection attempt failed, retrying; attempt={}, max_attempts={}, delay_ms={}",
                    attempt + 1,
                    retries + 1,
                    delay.as_millis() as u64
                );
                tokio::time::sleep(delay).await;
            }

            match connect_once(info, settings.connect_timeout_secs).await {
                Ok(conn) => {
                    log::debug!(
                        "Connected to MySQL; host={}, port={}, database={}, user={}",
                        info.host,
                        info.port,
                        info.database,
                        info.user
                    );
                    return Ok(Self {
                        conn: Mutex::new(conn),
                        database: info.database.clone(),
                    });
                }
                Err(e) => {
                    if is_permanent_error(&e) {
                        log::error!("Permanent connection error, not retrying: {}", format_db_error(&e));
                        return Err(AlterguardError::DatabaseError(e));
                    }
                    last_err = Some(e);
                }
            }
        }

        match last_err {
            Some(e) => Err(AlterguardError::DatabaseError(e)),
            None => Err(AlterguardError::ConfigError(
                "No connection attempt was made".to_string(),
            )),
        }
    }

    /// Name of the connected schema.
    pub fn database(&self) -> &str {
        &self.database
    }

    /// Close the session.
    pub async fn close(self) -> Result<()> {
        self.conn.into_inner().disconnect().await?;
        Ok(())
    }

    fn missing_stats(table: &str, source: StatsSource) -> AlterguardError {
        AlterguardError::RowCountUnavailable {
            table: table.to_string(),
            reason: format!("no row in {}", source.label()),
        }
    }
}

#[async_trait]
impl SchemaDatabase for MySqlDatabase {
    async fn stats_row_count(&self, source: StatsSource, table: &str) -> Result<i64> {
        let mut conn = self.conn.lock().await;
        let value: Option<Option<u64>> = match source {
            StatsSource::InnodbTableStats => {
                conn.exec_first(
                    "SELECT n_rows FROM mysql.innodb_table_stats \
                     WHERE database_name = ? AND table_name = ?",
                    (self.database.clone(), table.to_string()),
                )
                .await?
            }
            StatsSource::InnodbTablestats => {
                conn.exec_first(
                    "SELECT NUM_ROWS FROM information_schema.INNODB_TABLESTATS WHERE NAME = ?",
                    (format!("{}/{}", self.database, table),),
                )
                .await?
            }
            StatsSource::Catalog => {
                conn.exec_first(
                    "SELECT TABLE_ROWS FROM information_schema.TABLES \
                     WHERE TABLE_SCHEMA = ? AND TABLE_NAME = ?",
                    (self.database.clone(), table.to_string()),
                )
                .await?
            }
        };

        match value.flatten() {
            Some(rows) => Ok(rows as i64),
            None => Err(Self::missing_stats(table, source)),
        }
    }

    async fn exact_row_count(&self, table: &str) -> Result<i64> {
        let sql = format!("SELECT COUNT(*) FROM {}", quote_table(table)?);
        let mut conn = self.conn.lock().await;
        let count: Option<i64> = conn.query_first(sql).await?;
        Ok(count.unwrap_or(0))
    }

    async fn execute(&self, sql: &str) -> Result<()> {
        let mut conn = self.conn.lock().await;
        conn.query_drop(sql)
            .await
            .map_err(|e| AlterguardError::SqlFailed {
                statement: sql.to_string(),
                code: server_error_code(&e),
                message: format_db_error(&e),
            })
    }

    async fn set_session_variable(&self, name: &str, value: i64) -> Result<()> {
        validate_identifier(name)?;
        let sql = format!("SET SESSION {} = {}", name, value);
        self.execute(&sql).await
    }

    async fn table_exists(&self, table: &str) -> Result<bool> {
        let mut conn = self.conn.lock().await;
        let count: Option<i64> = conn
            .exec_first(
                "SELECT COUNT(*) FROM information_schema.TABLES \
                 WHERE table_schema = DATABASE() AND table_name = ?",
                (table.to_string(),),
            )
            .await?;
        Ok(count.unwrap_or(0) > 0)
    }

    async fn current_user(&self) -> Result<String> {
        let mut conn = self.conn.lock().await;
        let user: Option<String> = conn.query_first("SELECT USER()").await?;
        let user = user.unwrap_or_default();
        Ok(user_without_host(&user).to_string())
    }

    async fn connection_id(&self) -> Result<u64> {
        let mut conn = self.conn.lock().await;
        let id: Option<u64> = conn.query_first("SELECT CONNECTION_ID()").await?;
        Ok(id.unwrap_or(0))
    }

    async fn count_user_connections(&self, user: &str, exclude_id: u64) -> Result<i64> {
        let mut conn = self.conn.lock().await;
        let count: Option<i64> = conn
            .exec_first(
                "SELECT COUNT(*) FROM information_schema.PROCESSLIST WHERE USER = ? AND ID != ?",
                (user.to_string(), exclude_id),
            )
            .await?;
        Ok(count.unwrap_or(0))
    }

    async fn buffer_pool_size_mb(&self, table: &str) -> Result<f64> {
        let qualified = format!("{}.{}", quote_ident(&self.database), quote_ident(table));
        let mut conn = self.conn.lock().await;
        let pages: Option<u64> = conn
            .exec_first(
                "SELECT COUNT(*) FROM information_schema.INNODB_BUFFER_PAGE WHERE TABLE_NAME = ?",
                (qualified,),
            )
            .await?;
        let page_size: Option<u64> = conn.query_first("SELECT @@innodb_page_size").await?;
        Ok(pages_to_mb(pages.unwrap_or(0), page_size.unwrap_or(16384)))
    }

    async fn analyze_table(&self, table: &str) -> Result<()> {
        let sql = format!("ANALYZE TABLE {}", quote_table(table)?);
        self.execute(&sql).await
    }
}
