//! Configuration loading and resolution.
//!
//! Supports a TOML config file, environment variables, and CLI overrides
//! with a defined priority order (CLI > env > TOML > defaults). The task
//! list (the statements to run) is loaded separately, from a TOML tasks
//! file and/or standard input.

use std::fmt;

use serde::Deserialize;

use crate::dsn::ConnectionInfo;
use crate::error::{AlterguardError, Result};
use crate::statement::split_statements;

/// Helper macro to apply an optional owned value directly to a target field.
///
/// Replaces: `if let Some(v) = $opt { $target = v; }`
macro_rules! apply_option {
    ($opt:expr => $target:expr) => {
        if let Some(v) = $opt {
            $target = v;
        }
    };
}

/// Helper macro to apply an optional owned value, wrapping it in `Some()`.
///
/// Replaces: `if let Some(v) = $opt { $target = Some(v); }`
macro_rules! apply_option_some {
    ($opt:expr => $target:expr) => {
        if let Some(v) = $opt {
            $target = Some(v);
        }
    };
}

/// Helper macro to clone a borrowed optional value, wrapping it in `Some()`.
///
/// Replaces: `if let Some(ref v) = $opt { $target = Some(v.clone()); }`
macro_rules! apply_option_some_clone {
    ($opt:expr => $target:expr) => {
        if let Some(ref v) = $opt {
            $target = Some(v.clone());
        }
    };
}

/// Default row-count cutoff between a direct ALTER and pt-osc.
pub const DEFAULT_PT_OSC_THRESHOLD: i64 = 1_000_000;

/// Default config file name.
pub const DEFAULT_CONFIG_FILE: &str = "alterguard.toml";

/// How pt-osc names its triggers in the deployed tool version.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TriggerNaming {
    /// `pt_osc_<db>_<table>_{ins,upd,del}`.
    #[default]
    DatabaseQualified,
    /// `pt_osc_<table>_{ins,upd,del}`.
    TableOnly,
}

impl std::str::FromStr for TriggerNaming {
    type Err = AlterguardError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "database_qualified" | "database" => Ok(TriggerNaming::DatabaseQualified),
            "table_only" | "table" => Ok(TriggerNaming::TableOnly),
            _ => Err(AlterguardError::ConfigError(format!(
                "Invalid trigger_naming '{}'. Use 'database_qualified' or 'table_only'.",
                s
            ))),
        }
    }
}

/// Top-level configuration for alterguard.
#[derive(Debug, Clone)]
pub struct AlterguardConfig {
    /// Database connection settings.
    pub database: DatabaseConfig,
    /// Tables with more rows than this go through pt-osc.
    pub pt_osc_threshold: i64,
    /// Skip `ANALYZE TABLE` on the new table before a swap.
    pub disable_analyze_table: bool,
    /// Refuse to drop a retired table whose buffer-pool footprint exceeds this (0 disables).
    pub buffer_pool_size_threshold_mb: f64,
    /// pt-online-schema-change settings.
    pub pt_osc: PtOscConfig,
    /// pt-archiver settings.
    pub pt_archiver: PtArchiverConfig,
    /// Slow-operation alerting.
    pub alert: AlertConfig,
    /// Session variables applied before the swap.
    pub session: SessionConfig,
    /// Concurrent-session guard.
    pub connection_check: ConnectionCheckConfig,
    /// Notification delivery settings.
    pub notifications: NotificationConfig,
}

impl Default for AlterguardConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig::default(),
            pt_osc_threshold: DEFAULT_PT_OSC_THRESHOLD,
            disable_analyze_table: false,
            buffer_pool_size_threshold_mb: 0.0,
            pt_osc: PtOscConfig::default(),
            pt_archiver: PtArchiverConfig::default(),
            alert: AlertConfig::default(),
            session: SessionConfig::default(),
            connection_check: ConnectionCheckConfig::default(),
            notifications: NotificationConfig::default(),
        }
    }
}

/// Database connection configuration.
#[derive(Clone)]
pub struct DatabaseConfig {
    /// Go-driver style DSN (`user[:pass]@tcp(host:port)/db`).
    pub dsn: Option<String>,
    /// Number of times to retry a failed connection (max 20).
    pub connect_retries: u32,
    /// Connection timeout in seconds (0 waits indefinitely).
    pub connect_timeout_secs: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            dsn: None,
            connect_retries: 0,
            connect_timeout_secs: 30,
        }
    }
}

impl fmt::Debug for DatabaseConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseConfig")
            .field("dsn", &self.dsn.as_ref().map(|_| "[REDACTED]"))
            .field("connect_retries", &self.connect_retries)
            .field("connect_timeout_secs", &self.connect_timeout_secs)
            .finish()
    }
}

/// pt-online-schema-change settings.
#[derive(Debug, Clone, PartialEq)]
pub struct PtOscConfig {
    /// Executable to run.
    pub binary: String,
    /// `--charset`.
    pub charset: Option<String>,
    /// `--recursion-method`; `<db>` and `<table>` are substituted.
    pub recursion_method: Option<String>,
    /// Leave the swap to `alterguard swap`.
    pub no_swap_tables: bool,
    /// `--chunk-size` (0 leaves the tool default).
    pub chunk_size: u64,
    /// `--max-lag` in seconds (0 leaves the tool default).
    pub max_lag: f64,
    /// `--statistics`.
    pub statistics: bool,
    /// Always pass `--dry-run`.
    pub dry_run: bool,
    /// `--no-drop-triggers`.
    pub no_drop_triggers: bool,
    /// `--no-drop-new-table`.
    pub no_drop_new_table: bool,
    /// `--no-drop-old-table`.
    pub no_drop_old_table: bool,
    /// Trigger naming scheme of the deployed tool.
    pub trigger_naming: TriggerNaming,
}

impl Default for PtOscConfig {
    fn default() -> Self {
        Self {
            binary: "pt-online-schema-change".to_string(),
            charset: None,
            recursion_method: None,
            no_swap_tables: false,
            chunk_size: 0,
            max_lag: 0.0,
            statistics: false,
            dry_run: false,
            no_drop_triggers: false,
            no_drop_new_table: false,
            no_drop_old_table: false,
            trigger_naming: TriggerNaming::default(),
        }
    }
}

/// pt-archiver settings.
#[derive(Debug, Clone, PartialEq)]
pub struct PtArchiverConfig {
    /// Purge the retired table before dropping it.
    pub enabled: bool,
    /// Executable to run.
    pub binary: String,
    /// `--where` filter (defaults to `1=1`).
    pub where_clause: Option<String>,
    /// `--limit` (0 leaves the tool default).
    pub limit: u64,
    /// `--commit-each`.
    pub commit_each: bool,
    /// `--progress` (0 disables).
    pub progress: u64,
    /// `--max-lag` in seconds (0 leaves the tool default).
    pub max_lag: f64,
    /// `--no-check-charset`.
    pub no_check_charset: bool,
    /// `--bulk-delete`.
    pub bulk_delete: bool,
    /// `--primary-key-only`.
    pub primary_key_only: bool,
    /// `--statistics`.
    pub statistics: bool,
}

impl Default for PtArchiverConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            binary: "pt-archiver".to_string(),
            where_clause: None,
            limit: 0,
            commit_each: false,
            progress: 0,
            max_lag: 0.0,
            no_check_charset: false,
            bulk_delete: false,
            primary_key_only: false,
            statistics: false,
        }
    }
}

/// Slow-operation alerting.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AlertConfig {
    /// Warn when the rename runs longer than this (0 disables).
    pub execution_time_threshold_secs: u64,
}

/// Session variables applied on the swap connection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionConfig {
    /// `lock_wait_timeout` in seconds (0 leaves the server value).
    pub lock_wait_timeout: i64,
    /// `innodb_lock_wait_timeout` in seconds (0 leaves the server value).
    pub innodb_lock_wait_timeout: i64,
}

/// Concurrent-session guard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionCheckConfig {
    /// Refuse to proceed while other sessions of the same user are connected.
    pub enabled: bool,
}

impl Default for ConnectionCheckConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

/// Notification delivery settings.
#[derive(Clone, Default)]
pub struct NotificationConfig {
    /// Slack incoming-webhook URL; notifications are off when unset.
    pub slack_webhook_url: Option<String>,
    /// Environment label prefixed to every message.
    pub environment: Option<String>,
}

impl fmt::Debug for NotificationConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NotificationConfig")
            .field(
                "slack_webhook_url",
                &self.slack_webhook_url.as_ref().map(|_| "[REDACTED]"),
            )
            .field("environment", &self.environment)
            .finish()
    }
}

// ── TOML deserialization structs ──

#[derive(Deserialize, Default)]
struct TomlConfig {
    pt_osc_threshold: Option<i64>,
    disable_analyze_table: Option<bool>,
    buffer_pool_size_threshold_mb: Option<f64>,
    database: Option<TomlDatabaseConfig>,
    pt_osc: Option<TomlPtOscConfig>,
    pt_archiver: Option<TomlPtArchiverConfig>,
    alert: Option<TomlAlertConfig>,
    session_config: Option<TomlSessionConfig>,
    connection_check: Option<TomlConnectionCheckConfig>,
}

#[derive(Deserialize, Default)]
struct TomlDatabaseConfig {
    connect_retries: Option<u32>,
    connect_timeout: Option<u32>,
}

#[derive(Deserialize, Default)]
struct TomlPtOscConfig {
    binary: Option<String>,
    charset: Option<String>,
    recursion_method: Option<String>,
    no_swap_tables: Option<bool>,
    chunk_size: Option<u64>,
    max_lag: Option<f64>,
    statistics: Option<bool>,
    dry_run: Option<bool>,
    no_drop_triggers: Option<bool>,
    no_drop_new_table: Option<bool>,
    no_drop_old_table: Option<bool>,
    trigger_naming: Option<String>,
}

#[derive(Deserialize, Default)]
struct TomlPtArchiverConfig {
    enabled: Option<bool>,
    binary: Option<String>,
    #[serde(rename = "where")]
    where_clause: Option<String>,
    limit: Option<u64>,
    commit_each: Option<bool>,
    progress: Option<u64>,
    max_lag: Option<f64>,
    no_check_charset: Option<bool>,
    bulk_delete: Option<bool>,
    primary_key_only: Option<bool>,
    statistics: Option<bool>,
}

#[derive(Deserialize, Default)]
struct TomlAlertConfig {
    execution_time_threshold_seconds: Option<u64>,
}

#[derive(Deserialize, Default)]
struct TomlSessionConfig {
    lock_wait_timeout: Option<i64>,
    innodb_lock_wait_timeout: Option<i64>,
}

#[derive(Deserialize, Default)]
struct TomlConnectionCheckConfig {
    enabled: Option<bool>,
}

#[derive(Deserialize)]
struct TomlTasks {
    queries: Option<Vec<String>>,
}

/// CLI overrides that take highest priority.
#[derive(Debug, Default, Clone)]
pub struct CliOverrides {
    /// Override the environment label.
    pub environment: Option<String>,
    /// Override the pt-osc row threshold.
    pub pt_osc_threshold: Option<i64>,
    /// Override the number of connection retries.
    pub connect_retries: Option<u32>,
    /// Override the connection timeout in seconds.
    pub connect_timeout: Option<u32>,
}

impl AlterguardConfig {
    /// Load configuration with the following priority (highest wins):
    /// 1. CLI arguments
    /// 2. Environment variables
    /// 3. TOML config file
    /// 4. Built-in defaults
    pub fn load(config_path: Option<&str>, overrides: &CliOverrides) -> Result<Self> {
        let mut config = AlterguardConfig::default();

        // Layer 3: TOML config file
        let toml_path = config_path.unwrap_or(DEFAULT_CONFIG_FILE);
        if let Ok(content) = std::fs::read_to_string(toml_path) {
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                if let Ok(meta) = std::fs::metadata(toml_path) {
                    let mode = meta.permissions().mode();
                    if mode & 0o077 != 0 {
                        log::warn!("Config file has overly permissive permissions. Consider chmod 600.; path={}, mode={:o}", toml_path, mode);
                    }
                }
            }
            let toml_config: TomlConfig = toml::from_str(&content).map_err(|e| {
                AlterguardError::ConfigError(format!(
                    "Failed to parse config file '{}': {}",
                    toml_path, e
                ))
            })?;
            config.apply_toml(toml_config);
        } else if config_path.is_some() {
            return Err(AlterguardError::ConfigError(format!(
                "Config file '{}' not found",
                toml_path
            )));
        }

        // Layer 2: Environment variables
        config.apply_env(|key| std::env::var(key).ok());

        // Layer 1: CLI overrides
        config.apply_cli(overrides);

        if config.database.connect_retries > 20 {
            config.database.connect_retries = 20;
            log::warn!("connect_retries capped at 20");
        }

        Ok(config)
    }

    fn apply_toml(&mut self, toml: TomlConfig) {
        apply_option!(toml.pt_osc_threshold => self.pt_osc_threshold);
        apply_option!(toml.disable_analyze_table => self.disable_analyze_table);
        apply_option!(toml.buffer_pool_size_threshold_mb => self.buffer_pool_size_threshold_mb);

        if let Some(db) = toml.database {
            apply_option!(db.connect_retries => self.database.connect_retries);
            apply_option!(db.connect_timeout => self.database.connect_timeout_secs);
        }

        if let Some(p) = toml.pt_osc {
            apply_option!(p.binary => self.pt_osc.binary);
            apply_option_some!(p.charset => self.pt_osc.charset);
            apply_option_some!(p.recursion_method => self.pt_osc.recursion_method);
            apply_option!(p.no_swap_tables => self.pt_osc.no_swap_tables);
            apply_option!(p.chunk_size => self.pt_osc.chunk_size);
            apply_option!(p.max_lag => self.pt_osc.max_lag);
            apply_option!(p.statistics => self.pt_osc.statistics);
            apply_option!(p.dry_run => self.pt_osc.dry_run);
            apply_option!(p.no_drop_triggers => self.pt_osc.no_drop_triggers);
            apply_option!(p.no_drop_new_table => self.pt_osc.no_drop_new_table);
            apply_option!(p.no_drop_old_table => self.pt_osc.no_drop_old_table);
            if let Some(v) = p.trigger_naming {
                match v.parse() {
                    Ok(naming) => self.pt_osc.trigger_naming = naming,
                    Err(_) => log::warn!(
                        "Invalid trigger_naming '{}' in config, using default 'database_qualified'. Valid values: database_qualified, table_only",
                        v
                    ),
                }
            }
        }

        if let Some(a) = toml.pt_archiver {
            apply_option!(a.enabled => self.pt_archiver.enabled);
            apply_option!(a.binary => self.pt_archiver.binary);
            apply_option_some!(a.where_clause => self.pt_archiver.where_clause);
            apply_option!(a.limit => self.pt_archiver.limit);
            apply_option!(a.commit_each => self.pt_archiver.commit_each);
            apply_option!(a.progress => self.pt_archiver.progress);
            apply_option!(a.max_lag => self.pt_archiver.max_lag);
            apply_option!(a.no_check_charset => self.pt_archiver.no_check_charset);
            apply_option!(a.bulk_delete => self.pt_archiver.bulk_delete);
            apply_option!(a.primary_key_only => self.pt_archiver.primary_key_only);
            apply_option!(a.statistics => self.pt_archiver.statistics);
        }

        if let Some(a) = toml.alert {
            apply_option!(a.execution_time_threshold_seconds => self.alert.execution_time_threshold_secs);
        }

        if let Some(s) = toml.session_config {
            apply_option!(s.lock_wait_timeout => self.session.lock_wait_timeout);
            apply_option!(s.innodb_lock_wait_timeout => self.session.innodb_lock_wait_timeout);
        }

        if let Some(c) = toml.connection_check {
            apply_option!(c.enabled => self.connection_check.enabled);
        }
    }

    fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("DATABASE_DSN").filter(|v| !v.is_empty()) {
            self.database.dsn = Some(v);
        }
        if let Some(v) = lookup("PT_OSC_THRESHOLD") {
            match v.trim().parse::<i64>() {
                Ok(n) => self.pt_osc_threshold = n,
                Err(_) => log::warn!("Ignoring non-numeric PT_OSC_THRESHOLD; value={}", v),
            }
        }
        if let Some(v) = lookup("ALTERGUARD_CONNECT_RETRIES") {
            if let Ok(n) = v.parse::<u32>() {
                self.database.connect_retries = n;
            }
        }
        if let Some(v) = lookup("ALTERGUARD_ENVIRONMENT").filter(|v| !v.is_empty()) {
            self.notifications.environment = Some(v);
        }
        if let Some(v) = lookup("SLACK_WEBHOOK_URL").filter(|v| !v.is_empty()) {
            self.notifications.slack_webhook_url = Some(v);
        }
    }

    fn apply_cli(&mut self, overrides: &CliOverrides) {
        apply_option_some_clone!(overrides.environment => self.notifications.environment);
        apply_option!(overrides.pt_osc_threshold => self.pt_osc_threshold);
        apply_option!(overrides.connect_retries => self.database.connect_retries);
        apply_option!(overrides.connect_timeout => self.database.connect_timeout_secs);
    }

    /// Parsed connection details from `DATABASE_DSN`.
    pub fn connection_info(&self) -> Result<ConnectionInfo> {
        let dsn = self.database.dsn.as_deref().ok_or_else(|| {
            AlterguardError::ConfigError(
                "DATABASE_DSN environment variable is not set".to_string(),
            )
        })?;
        Ok(ConnectionInfo::parse(dsn)?)
    }
}

/// Read `queries = [...]` from a tasks file.
pub fn load_tasks_file(path: &str) -> Result<Vec<String>> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        AlterguardError::ConfigError(format!("Failed to read tasks file '{}': {}", path, e))
    })?;
    parse_tasks(&content, path)
}

fn parse_tasks(content: &str, origin: &str) -> Result<Vec<String>> {
    let tasks: TomlTasks = toml::from_str(content).map_err(|e| {
        AlterguardError::ConfigError(format!("Failed to parse tasks file '{}': {}", origin, e))
    })?;
    let queries = tasks.queries.unwrap_or_default();

    if queries.is_empty() {
        return Err(AlterguardError::ConfigError(format!(
            "No queries defined in '{}'",
            origin
        )));
    }
    if let Some(idx) = queries.iter().position(|q| q.trim().is_empty()) {
        return Err(AlterguardError::ConfigError(format!(
            "Query is empty in '{}' (index: {})",
            origin, idx
        )));
    }

    Ok(queries)
}

/// Combine the tasks file and piped input into one batch.
///
/// At least one source must be given and the result must not be empty.
pub fn collect_queries(tasks_path: Option<&str>, stdin_input: Option<&str>) -> Result<Vec<String>> {
    if tasks_path.is_none() && stdin_input.is_none() {
        return Err(AlterguardError::ConfigError(
            "Either --tasks-config or --stdin must be specified".to_string(),
        ));
    }

    let mut queries = Vec::new();
    if let Some(path) = tasks_path {
        queries.extend(load_tasks_file(path)?);
    }
    if let Some(input) = stdin_input {
        let piped = split_statements(input);
        if piped.is_empty() {
            return Err(AlterguardError::ConfigError(
                "No queries provided on standard input".to_string(),
            ));
        }
        queries.extend(piped);
    }

    Ok(queries)
}
