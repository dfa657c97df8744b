//! CLI entry point for the alterguard schema-change tool.
//! Provides clap-based command routing for run, swap, cleanup and purge,
//! and exit code mapping based on error type.

mod output;

use std::io::Read;
use std::process;

use clap::{Parser, Subcommand};
use colored::Colorize;
use serde::Serialize;

use alterguard_core::config::{collect_queries, AlterguardConfig, CliOverrides};
use alterguard_core::error::AlterguardError;
use alterguard_core::{Alterguard, CleanupOptions};

/// Top-level CLI definition with global flags and subcommand dispatch.
#[derive(Parser)]
#[command(
    name = "alterguard",
    about = "MySQL schema changes with ALTER TABLE or pt-online-schema-change, chosen by table size",
    version,
    propagate_version = true
)]
struct Cli {
    /// Config file path (default: alterguard.toml)
    #[arg(short, long, value_name = "PATH", global = true)]
    config: Option<String>,

    /// Tasks file with `queries = [...]`
    #[arg(long, value_name = "PATH", global = true)]
    tasks_config: Option<String>,

    /// Environment label for notifications (overrides ALTERGUARD_ENVIRONMENT)
    #[arg(short, long, value_name = "ENV", global = true)]
    environment: Option<String>,

    /// Row count above which pt-online-schema-change is used
    #[arg(long, value_name = "ROWS", global = true)]
    threshold: Option<i64>,

    /// Number of retries when connecting to the database
    #[arg(long, value_name = "N", global = true)]
    connect_retries: Option<u32>,

    /// Connection timeout in seconds (default: 30, 0 = no timeout)
    #[arg(long, value_name = "SECS", global = true)]
    connect_timeout: Option<u32>,

    /// Force dry-run mode for every statement and tool run
    #[arg(long, global = true)]
    dry_run: bool,

    /// Output results as JSON
    #[arg(long, global = true)]
    json: bool,

    /// Suppress non-essential output
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Enable verbose/debug output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

/// All available alterguard subcommands.
#[derive(Subcommand)]
enum Commands {
    /// Apply the queries from --tasks-config and/or standard input
    Run {
        /// Read `;`-terminated statements from standard input
        #[arg(long)]
        stdin: bool,
    },

    /// Swap a table with the working table left by pt-osc
    Swap {
        /// Table to swap
        table: String,
    },

    /// Drop leftovers of an online schema change
    Cleanup {
        /// Table whose artifacts to remove
        table: String,

        /// Drop <table>_old
        #[arg(long)]
        drop_table: bool,

        /// Drop _<table>_new
        #[arg(long)]
        drop_new_table: bool,

        /// Drop the pt-osc insert/update/delete triggers
        #[arg(long)]
        drop_triggers: bool,
    },

    /// Delete the rows of <table>_old with pt-archiver
    Purge {
        /// Table whose retired copy to purge
        table: String,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let debug_env = std::env::var("DEBUG").is_ok_and(|v| v.eq_ignore_ascii_case("true"));

    // Set up logging (suppress when JSON output is requested)
    let filter = if cli.json || cli.quiet {
        "error"
    } else if cli.verbose || debug_env {
        "debug"
    } else {
        "info"
    };

    env_logger::Builder::new()
        .parse_env(env_logger::Env::default().default_filter_or(filter))
        .format_target(false)
        .init();

    if let Err(e) = run(cli).await {
        print_error(&e);
        process::exit(exit_code(&e));
    }
}

/// Map error types to differentiated exit codes.
fn exit_code(error: &AlterguardError) -> i32 {
    match error {
        AlterguardError::ConfigError(_) => 2,
        AlterguardError::DsnError(_) => 2,
        AlterguardError::UnsupportedStatement { .. } => 3,
        AlterguardError::DatabaseError(_) => 4,
        AlterguardError::SqlFailed { .. } => 5,
        AlterguardError::ToolFailed { .. } => 6,
        AlterguardError::PreconditionFailed { .. } => 7,
        AlterguardError::TableMissing { .. } => 7,
        AlterguardError::RowCountUnavailable { .. } => 8,
        AlterguardError::TriggerCleanupFailed { .. } => 9,
        _ => 1,
    }
}

fn print_json<T: Serialize>(value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(json) => println!("{}", json),
        Err(e) => log::error!("Failed to serialize report; error={}", e),
    }
}

fn read_stdin() -> Result<String, AlterguardError> {
    let mut input = String::new();
    std::io::stdin().read_to_string(&mut input)?;
    Ok(input)
}

/// Build configuration and dispatch the chosen subcommand.
async fn run(cli: Cli) -> Result<(), AlterguardError> {
    let json_output = cli.json;

    let overrides = CliOverrides {
        environment: cli.environment,
        pt_osc_threshold: cli.threshold,
        connect_retries: cli.connect_retries,
        connect_timeout: cli.connect_timeout,
    };

    let config = AlterguardConfig::load(cli.config.as_deref(), &overrides)?;

    // Read the batch before connecting
    let queries = match &cli.command {
        Commands::Run { stdin } => {
            let piped = if *stdin { Some(read_stdin()?) } else { None };
            Some(collect_queries(
                cli.tasks_config.as_deref(),
                piped.as_deref(),
            )?)
        }
        _ => None,
    };

    if cli.dry_run && !json_output {
        println!("{}", "DRY RUN: no changes will be made.".yellow().bold());
    }

    let guard = Alterguard::new(config, cli.dry_run).await?;

    match cli.command {
        Commands::Run { .. } => {
            let queries = queries.unwrap_or_default();
            let report = guard.run(&queries).await?;
            if json_output {
                print_json(&report);
            } else {
                output::print_run_report(&report);
            }
        }
        Commands::Swap { table } => {
            let report = guard.swap(&table).await?;
            if json_output {
                print_json(&report);
            } else {
                output::print_swap_report(&report);
            }
        }
        Commands::Cleanup {
            table,
            drop_table,
            drop_new_table,
            drop_triggers,
        } => {
            let options = CleanupOptions {
                drop_table,
                drop_new_table,
                drop_triggers,
            };
            let report = guard.cleanup(&table, options).await?;
            if json_output {
                print_json(&report);
            } else {
                output::print_cleanup_report(&report);
            }
        }
        Commands::Purge { table } => {
            let report = guard.purge(&table).await?;
            if json_output {
                print_json(&report);
            } else {
                output::print_purge_report(&report);
            }
        }
    }

    Ok(())
}

/// Print an error with actionable guidance.
fn print_error(error: &AlterguardError) {
    eprintln!("{} {}", "ERROR:".red().bold(), error);

    match error {
        AlterguardError::ConfigError(_) | AlterguardError::DsnError(_) => {
            eprintln!(
                "{}",
                "Hint: Check alterguard.toml and set DATABASE_DSN (user:pass@tcp(host:port)/db)."
                    .dimmed()
            );
        }
        AlterguardError::DatabaseError(_) => {
            eprintln!(
                "{}",
                "Hint: Verify the database is running and DATABASE_DSN is correct.".dimmed()
            );
        }
        AlterguardError::UnsupportedStatement { .. } => {
            eprintln!(
                "{}",
                "Hint: Only CREATE, ALTER and DROP statements can be run. Nothing was executed."
                    .dimmed()
            );
        }
        AlterguardError::PreconditionFailed { hint: Some(hint), .. } => {
            eprintln!("{}", format!("Hint: {}", hint).dimmed());
        }
        AlterguardError::TableMissing { .. } => {
            eprintln!(
                "{}",
                "Hint: Run the pt-osc change with no_swap_tables = true before 'alterguard swap'."
                    .dimmed()
            );
        }
        AlterguardError::ToolFailed { .. } => {
            if let Some(transcript) = error.transcript() {
                eprintln!("{}", "Tool output:".dimmed());
                eprintln!("{}", output::transcript_tail(transcript, 20).dimmed());
            }
        }
        AlterguardError::TriggerCleanupFailed { .. } => {
            eprintln!(
                "{}",
                "Hint: Check SHOW TRIGGERS and drop the remaining triggers manually.".dimmed()
            );
        }
        _ => {}
    }
}
