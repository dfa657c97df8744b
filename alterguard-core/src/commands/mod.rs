//! Command implementations: run, swap, cleanup, purge.

pub mod cleanup;
pub mod purge;
pub mod run;
pub mod swap;

use std::time::Instant;

use crate::config::AlterguardConfig;
use crate::db::SchemaDatabase;
use crate::error::{AlterguardError, Result};
use crate::notify::{task_name, Notifications, TaskEvent};
use crate::preflight::PreflightCheck;
use crate::ptarchiver::RowPurge;
use crate::ptosc::OnlineSchemaChange;

/// Everything a command needs, borrowed from the [`crate::Alterguard`] instance.
pub struct CommandContext<'a> {
    pub config: &'a AlterguardConfig,
    /// Schema the connection is bound to, used for trigger names.
    pub database: &'a str,
    pub db: &'a dyn SchemaDatabase,
    pub osc: &'a dyn OnlineSchemaChange,
    pub archiver: &'a dyn RowPurge,
    pub notifications: &'a Notifications,
    /// Force every tool run and statement into dry-run mode.
    pub dry_run: bool,
}

impl CommandContext<'_> {
    /// Task name for notifications, marked in dry-run mode.
    pub fn task(&self, base: &str) -> String {
        task_name(base, self.dry_run)
    }

    /// Announce a failed guard check under `task`, passing the result through.
    pub(crate) async fn gate(
        &self,
        task: &str,
        table: &str,
        result: Result<PreflightCheck>,
    ) -> Result<PreflightCheck> {
        if let Err(ref e) = result {
            let event = TaskEvent::new(self.task(task), table);
            self.notifications.failure(&event, e).await;
        }
        result
    }

    /// Announce `err` and return it.
    pub(crate) async fn fail<T>(&self, event: &TaskEvent, err: AlterguardError) -> Result<T> {
        self.notifications.failure(event, &err).await;
        Err(err)
    }
}

pub(crate) fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}
