//! CLI commands implementation

pub mod backfill;
pub mod init;
pub mod maintenance;
pub mod run;
pub mod status;
pub mod sync;

pub use backfill::*;
pub use init::*;
pub use maintenance::*;
pub use run::*;
pub use status::*;
pub use sync::*;

use crate::archive::ArchiveClient;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::meta::MetaDb;
use crate::pipeline::Downloader;
use std::sync::Arc;

/// Everything a command needs, sharing one archive client and therefore one
/// request budget
#[derive(Clone)]
pub struct Services {
    pub db: MetaDb,
    pub client: Arc<ArchiveClient>,
    pub downloader: Downloader,
}

impl Services {
    /// Open the database (which must already be initialised) and build the
    /// client and downloader from `config`
    pub async fn open(config: &Config) -> Result<Self> {
        let db = MetaDb::connect(config).await?;
        if !db.is_initialized().await? {
            return Err(Error::Config(format!(
                "Database at {} is not initialised. Run 'filingsync init' first.",
                config.paths.db_file.display()
            )));
        }

        let client = Arc::new(ArchiveClient::from_config(config)?);
        let downloader = Downloader::with_db(config, client.clone(), db.clone())?;
        Ok(Self {
            db,
            client,
            downloader,
        })
    }
}
