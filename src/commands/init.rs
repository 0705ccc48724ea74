//! Init command implementation

use crate::config::Config;
use crate::error::Result;
use crate::meta::MetaDb;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::info;

/// Where init put things
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitReport {
    pub config_path: PathBuf,
    pub db_path: PathBuf,
    pub config_written: bool,
}

/// Write a default config (unless one exists and `force` is off) and create
/// the database schema. Safe to run again on an existing install.
pub async fn cmd_init(base_dir: Option<PathBuf>, force: bool) -> Result<InitReport> {
    let mut config = Config::default();
    config.init_paths(base_dir);

    let config_exists = config.paths.config_file.exists();
    let config_written = if config_exists && !force {
        info!(
            "Keeping existing config at {:?}",
            config.paths.config_file
        );
        // Refuse to build a database next to a config that does not load
        config = Config::load(&config.paths.config_file)?;
        false
    } else {
        config.validate()?;
        config.save()?;
        true
    };

    let db = MetaDb::connect(&config).await?;
    db.init_schema().await?;
    info!("Database ready at {:?}", config.paths.db_file);

    Ok(InitReport {
        config_path: config.paths.config_file,
        db_path: config.paths.db_file,
        config_written,
    })
}

pub fn print_init_report(report: &InitReport) {
    if report.config_written {
        println!("✓ Wrote config to {}", report.config_path.display());
    } else {
        println!("✓ Kept existing config at {}", report.config_path.display());
    }
    println!("✓ Database ready at {}", report.db_path.display());
    println!("\nNext steps:");
    println!("  1. Set archive.user_agent to your organisation and contact address");
    println!("  2. filingsync sync latest          # Newest filings from the live feed");
    println!("  3. filingsync backfill recent 30   # Fill the last month");
}
