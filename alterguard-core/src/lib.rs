//! MySQL schema-change orchestration.
//!
//! Small tables are altered with a plain `ALTER TABLE`; tables above a
//! row-count threshold go through pt-online-schema-change. Swap, cleanup
//! and purge steps are separate operations, each gated by guard checks.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use alterguard_core::config::AlterguardConfig;
//! use alterguard_core::{Alterguard, CliOverrides};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = AlterguardConfig::load(None, &CliOverrides::default())?;
//! let guard = Alterguard::new(config, false).await?;
//! let report = guard
//!     .run(&["ALTER TABLE users ADD COLUMN nickname VARCHAR(64)".to_string()])
//!     .await?;
//! println!("Executed {} steps", report.outcomes.len());
//! # Ok(())
//! # }
//! ```
//!
//! # Architecture
//!
//! - [`config`]: Configuration loading (TOML, env vars, CLI overrides)
//! - [`dsn`]: `user:pass@tcp(host:port)/db` connection strings
//! - [`db`]: The `SchemaDatabase` seam and its MySQL implementation
//! - [`row_count`]: Row-count resolution with fallbacks
//! - [`statement`]: Statement classification and per-table grouping
//! - [`process`]: Supervised external tool runs
//! - [`ptosc`]: pt-online-schema-change integration
//! - [`ptarchiver`]: pt-archiver integration
//! - [`preflight`]: Guard checks before destructive steps
//! - [`monitor`]: Slow-operation watcher for the swap rename
//! - [`notify`]: Lifecycle notifications (Slack)
//! - [`commands`]: Individual command implementations
//! - [`error`]: Error types

pub mod commands;
pub mod config;
pub mod db;
pub mod dsn;
pub mod error;
pub mod monitor;
pub mod notify;
pub mod preflight;
pub mod process;
pub mod ptarchiver;
pub mod ptosc;
pub mod row_count;
pub mod statement;

use std::sync::Arc;

use config::AlterguardConfig;
use db::{MySqlDatabase, SchemaDatabase};
use error::Result;
use notify::{Notifications, SlackNotifier};
use ptarchiver::{PtArchiverExecutor, RowPurge};
use ptosc::{OnlineSchemaChange, PtOscExecutor};

pub use commands::cleanup::{CleanupOptions, CleanupReport};
pub use commands::purge::PurgeReport;
pub use commands::run::{ExecutionOutcome, RunReport};
pub use commands::swap::SwapReport;
pub use config::CliOverrides;
pub use error::AlterguardError;
pub use preflight::PreflightCheck;

/// Main entry point for the alterguard library.
///
/// Holds one database session, the two tool executors and the
/// notification sink, and runs commands against them.
pub struct Alterguard {
    pub config: AlterguardConfig,
    database: String,
    db: Arc<dyn SchemaDatabase>,
    osc: Arc<dyn OnlineSchemaChange>,
    archiver: Arc<dyn RowPurge>,
    notifications: Notifications,
    dry_run: bool,
}

impl Alterguard {
    /// Connect to the database and wire up the tools from `config`.
    ///
    /// `dry_run` forces every tool run and statement into dry-run mode.
    pub async fn new(config: AlterguardConfig, dry_run: bool) -> Result<Self> {
        let info = config.connection_info()?;
        let db = MySqlDatabase::connect(&info, &config.database).await?;

        let osc = PtOscExecutor::new(config.pt_osc.clone(), info.clone());
        let archiver = PtArchiverExecutor::new(config.pt_archiver.clone(), info.clone());
        let notifications =
            Notifications::new(Arc::new(SlackNotifier::new(&config.notifications)));

        Ok(Self {
            database: info.database,
            config,
            db: Arc::new(db),
            osc: Arc::new(osc),
            archiver: Arc::new(archiver),
            notifications,
            dry_run,
        })
    }

    /// Build an instance from existing parts.
    pub fn with_parts(
        config: AlterguardConfig,
        database: impl Into<String>,
        db: Arc<dyn SchemaDatabase>,
        osc: Arc<dyn OnlineSchemaChange>,
        archiver: Arc<dyn RowPurge>,
        notifications: Notifications,
        dry_run: bool,
    ) -> Self {
        Self {
            config,
            database: database.into(),
            db,
            osc,
            archiver,
            notifications,
            dry_run,
        }
    }

    /// Get a reference to the database handle.
    pub fn db(&self) -> &dyn SchemaDatabase {
        self.db.as_ref()
    }

    fn context(&self) -> commands::CommandContext<'_> {
        commands::CommandContext {
            config: &self.config,
            database: &self.database,
            db: self.db.as_ref(),
            osc: self.osc.as_ref(),
            archiver: self.archiver.as_ref(),
            notifications: &self.notifications,
            dry_run: self.dry_run,
        }
    }

    /// Apply a batch of CREATE/ALTER/DROP statements.
    pub async fn run(&self, queries: &[String]) -> Result<RunReport> {
        commands::run::execute(&self.context(), queries).await
    }

    /// Swap `table` with its working table.
    pub async fn swap(&self, table: &str) -> Result<SwapReport> {
        commands::swap::execute(&self.context(), table).await
    }

    /// Drop the retired table, the working table and/or the tool's triggers.
    pub async fn cleanup(&self, table: &str, options: CleanupOptions) -> Result<CleanupReport> {
        commands::cleanup::execute(&self.context(), table, options).await
    }

    /// Purge the rows of `<table>_old` with pt-archiver.
    pub async fn purge(&self, table: &str) -> Result<PurgeReport> {
        commands::purge::execute(&self.context(), table).await
    }
}
