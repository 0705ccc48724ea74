//! filingsync CLI entry point

use chrono::NaiveDate;
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::{generate, Shell};
use filingsync::{
    archive::Quarter,
    commands::{
        cmd_backfill, cmd_cleanup, cmd_init, cmd_jobs, cmd_missing, cmd_recover, cmd_retry,
        cmd_run, cmd_status, cmd_sync, cmd_tickers, cmd_trigger, print_backfill_stats,
        print_cleanup_stats, print_init_report, print_job_summaries, print_jobs,
        print_missing_dates, print_recover_report, print_retry_stats, print_status,
        print_sync_report, print_ticker_report, BackfillTarget, Services, SyncTarget,
    },
    config::Config,
    error::{Error, Result},
    progress::LogWriterFactory,
};
use serde::Serialize;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "filingsync")]
#[command(version, about = "Ingest disclosure-archive filings into a local store", long_about = None)]
struct Cli {
    /// Path to config file
    #[arg(short, long, global = true, env = "FILINGSYNC_CONFIG")]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Output as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize filingsync configuration and database
    Init {
        /// Overwrite an existing config with defaults
        #[arg(long)]
        force: bool,
    },

    /// Download filings from one discovery source
    Sync {
        #[command(subcommand)]
        target: SyncCommand,
    },

    /// Retry failed filings that still have attempts left
    Retry {
        /// Retry ceiling (defaults to download.max_retries)
        #[arg(long)]
        max_retries: Option<u32>,
    },

    /// Download dates that have no recorded filings
    Backfill {
        #[command(subcommand)]
        target: BackfillCommand,
    },

    /// List dates without any recorded filing (no network access)
    Missing {
        /// First date (YYYY-MM-DD)
        start: NaiveDate,
        /// Last date, inclusive (YYYY-MM-DD)
        end: NaiveDate,
    },

    /// Show processing record counts
    Stats,

    /// Show recent download jobs
    Jobs {
        /// Maximum number of jobs
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },

    /// Refresh the company ticker table
    Tickers,

    /// Return records abandoned mid-download to FAILED
    Recover {
        /// Only records idle for at least this many minutes
        #[arg(long, default_value = "60")]
        older_than_mins: u64,
    },

    /// Delete settled records and jobs past the retention window
    Cleanup {
        /// Age limit in days (defaults to retention.max_age_days)
        #[arg(long)]
        older_than_days: Option<u32>,
    },

    /// Run the job scheduler until Ctrl-C
    Run {
        /// Jobs to start immediately (sync-filings, sync-tickers, retry-failed,
        /// auto-backfill, cleanup)
        #[arg(long = "now")]
        now: Vec<String>,
    },

    /// Run one scheduled job in the foreground
    Trigger {
        /// Job name
        job: String,
    },

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Subcommand)]
enum SyncCommand {
    /// One day's daily index
    Date {
        /// Date (YYYY-MM-DD)
        date: NaiveDate,
    },

    /// Every day in a range, oldest first
    Range {
        start: NaiveDate,
        end: NaiveDate,
    },

    /// Newest filings from the live feed
    Latest {
        /// Maximum filings (defaults to download.latest_count)
        #[arg(short = 'n', long)]
        count: Option<usize>,
    },

    /// A single filing by accession number
    Accession {
        /// Accession number, e.g. 0000950170-24-000001
        accession: String,
    },

    /// One quarter's full index
    Quarter {
        year: i32,
        /// Quarter number, 1-4
        quarter: u32,
    },

    /// Every quarter from a start year through today
    History {
        /// First year (defaults to download.history_start_year)
        #[arg(long)]
        start_year: Option<i32>,
    },
}

#[derive(Subcommand)]
enum BackfillCommand {
    /// Missing dates within a range
    Range {
        start: NaiveDate,
        end: NaiveDate,
    },

    /// Missing dates within the last N days
    Recent {
        days: u32,
    },

    /// Missing dates within backfill.window_days
    Auto,
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        if matches!(e, Error::Cancelled) {
            warn!("Interrupted; completed work has been kept");
            std::process::exit(130);
        }
        error!("{}", e);
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"))
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(LogWriterFactory))
        .with(filter)
        .init();

    // Handle init command specially (doesn't need existing config)
    if let Commands::Init { force } = cli.command {
        let report = cmd_init(init_base_dir(cli.config), force).await?;
        return emit(cli.json, &report, print_init_report);
    }

    // Handle completions command (doesn't need config/db)
    if let Commands::Completions { shell } = cli.command {
        let mut cmd = Cli::command();
        generate(shell, &mut cmd, "filingsync", &mut std::io::stdout());
        return Ok(());
    }

    let config = load_config(cli.config.as_deref())?;
    let services = Services::open(&config).await?;
    let cancel = cancel_on_ctrl_c();
    let show_progress = !cli.json;
    let json = cli.json;

    match cli.command {
        Commands::Init { .. } | Commands::Completions { .. } => unreachable!(),

        Commands::Sync { target } => {
            let target = match target {
                SyncCommand::Date { date } => SyncTarget::Date(date),
                SyncCommand::Range { start, end } => SyncTarget::Range { start, end },
                SyncCommand::Latest { count } => SyncTarget::Latest { count },
                SyncCommand::Accession { accession } => SyncTarget::Accession(accession),
                SyncCommand::Quarter { year, quarter } => {
                    SyncTarget::Quarter(Quarter::new(year, quarter)?)
                }
                SyncCommand::History { start_year } => SyncTarget::History { start_year },
            };
            let report = cmd_sync(
                &services.downloader,
                target,
                config.download.history_start_year,
                show_progress,
                &cancel,
            )
            .await?;
            emit(json, &report, print_sync_report)?;
        }

        Commands::Retry { max_retries } => {
            let max_retries = max_retries.unwrap_or(config.download.max_retries);
            let stats = cmd_retry(&services.downloader, max_retries, show_progress, &cancel).await?;
            emit(json, &stats, print_retry_stats)?;
        }

        Commands::Backfill { target } => {
            let target = match target {
                BackfillCommand::Range { start, end } => BackfillTarget::Range { start, end },
                BackfillCommand::Recent { days } => BackfillTarget::Recent { days },
                BackfillCommand::Auto => BackfillTarget::Auto,
            };
            let stats = cmd_backfill(
                &services.downloader,
                target,
                config.backfill.window_days,
                show_progress,
                &cancel,
            )
            .await?;
            emit(json, &stats, print_backfill_stats)?;
        }

        Commands::Missing { start, end } => {
            let missing = cmd_missing(&services.downloader, start, end).await?;
            emit(json, &missing, print_missing_dates)?;
        }

        Commands::Stats => {
            let status = cmd_status(&config, &services.db, &services.downloader).await?;
            emit(json, &status, print_status)?;
        }

        Commands::Jobs { limit } => {
            let jobs = cmd_jobs(&services.db, limit).await?;
            emit(json, &jobs, |jobs: &Vec<_>| print_jobs(jobs))?;
        }

        Commands::Tickers => {
            let report = cmd_tickers(&services, &cancel).await?;
            emit(json, &report, print_ticker_report)?;
        }

        Commands::Recover { older_than_mins } => {
            let report = cmd_recover(&services.downloader, older_than_mins).await?;
            emit(json, &report, print_recover_report)?;
        }

        Commands::Cleanup { older_than_days } => {
            let days = older_than_days.unwrap_or(config.retention.max_age_days);
            let stats = cmd_cleanup(&services.downloader, days).await?;
            emit(json, &stats, |stats| print_cleanup_stats(stats, days))?;
        }

        Commands::Run { now } => {
            let summaries = cmd_run(&config, &services, &now, cancel).await?;
            emit(json, &summaries, |jobs: &Vec<_>| print_job_summaries(jobs))?;
        }

        Commands::Trigger { job } => {
            let outcome = cmd_trigger(&config, &services, &job, &cancel).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&outcome)?);
            } else {
                println!("Job '{}': {}", job, outcome);
            }
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
        }
    }

    Ok(())
}

/// Print as pretty JSON or through the human-readable printer
fn emit<T: Serialize>(json: bool, value: &T, print: impl FnOnce(&T)) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(value)?);
    } else {
        print(value);
    }
    Ok(())
}

/// Cancel the returned token on the first Ctrl-C
fn cancel_on_ctrl_c() -> CancellationToken {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Ctrl-C received; finishing in-flight filings");
            token.cancel();
        }
    });
    cancel
}

/// A `.toml` path names the config file; any other path names its directory
fn init_base_dir(path: Option<PathBuf>) -> Option<PathBuf> {
    path.map(|path| {
        if path.extension().is_some_and(|e| e == "toml") {
            path.parent()
                .map(PathBuf::from)
                .unwrap_or_else(Config::default_base_dir)
        } else {
            path
        }
    })
}

fn load_config(path: Option<&std::path::Path>) -> Result<Config> {
    let config_path = path
        .map(PathBuf::from)
        .unwrap_or_else(Config::default_config_path);

    if !config_path.exists() {
        eprintln!(
            "Config file not found: {}\nRun 'filingsync init' first.",
            config_path.display()
        );
        std::process::exit(1);
    }

    Config::load(&config_path)
}
