//! Split reader/writer SQLite pools.
//!
//! One writer connection serializes INSERT/UPDATE/DELETE in arrival order;
//! up to eight read-only connections serve SELECTs concurrently under WAL.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};

const MAX_READERS: u32 = 8;
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);
const WRITER_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone)]
pub struct DatabasePool {
    pub reader: SqlitePool,
    pub writer: SqlitePool,
}

impl DatabasePool {
    /// Open both pools, migrating through the writer before any reader
    /// connects.
    pub async fn new(database_url: &str) -> Result<Self, sqlx::Error> {
        let shared = SqliteConnectOptions::from_str(database_url)?
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true)
            .busy_timeout(BUSY_TIMEOUT)
            .create_if_missing(true);

        let writer = SqlitePoolOptions::new()
            .max_connections(1)
            .acquire_timeout(WRITER_ACQUIRE_TIMEOUT)
            .connect_with(shared.clone())
            .await?;
        sqlx::migrate!("../../migrations").run(&writer).await?;

        let reader = SqlitePoolOptions::new()
            .max_connections(MAX_READERS)
            .connect_with(shared.read_only(true))
            .await?;

        Ok(Self { reader, writer })
    }

    /// Round-trip a trivial query on a reader connection.
    pub async fn ping(&self) -> Result<(), sqlx::Error> {
        sqlx::query("SELECT 1").execute(&self.reader).await?;
        Ok(())
    }

    /// Close both pools, waiting for checked-out connections to return.
    pub async fn close(&self) {
        self.reader.close().await;
        self.writer.close().await;
    }
}

/// Database URL under `PARLEY_DATA_DIR`, else `~/.parley/parley.db`.
pub fn default_database_url() -> String {
    let data_dir = std::env::var("PARLEY_DATA_DIR").unwrap_or_else(|_| {
        dirs::home_dir()
            .map(|home| home.join(".parley").display().to_string())
            .unwrap_or_else(|| ".parley".to_string())
    });
    format!("sqlite://{data_dir}/parley.db")
}

/// The file a `sqlite:` URL points at, or `None` for in-memory databases.
pub fn database_file(database_url: &str) -> Option<PathBuf> {
    let rest = database_url
        .strip_prefix("sqlite://")
        .or_else(|| database_url.strip_prefix("sqlite:"))?;
    let path = rest.split('?').next().unwrap_or_default();
    if path.is_empty() || path == ":memory:" {
        return None;
    }
    Some(PathBuf::from(path))
}

/// Create the directory holding the database file if it does not exist yet.
pub async fn ensure_database_dir(database_url: &str) -> std::io::Result<()> {
    let Some(file) = database_file(database_url) else {
        return Ok(());
    };
    match file.parent().filter(|p| !p.as_os_str().is_empty()) {
        Some(dir) if !Path::new(dir).exists() => tokio::fs::create_dir_all(dir).await,
        _ => Ok(()),
    }
}
