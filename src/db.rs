//! Database connection and backend construction.

use anyhow::Result;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;

use qmd_core::store::memory::InMemoryStore;

use crate::config::{Config, StorageBackend};
use crate::migrate;
use crate::sqlite_store::SqliteStore;
use crate::store::AnyStore;

pub async fn connect(config: &Config) -> Result<SqlitePool> {
    let db_path = &config.db.path;

    // Ensure parent directory exists
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", db_path.display()))?
        .create_if_missing(true)
        .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
        .busy_timeout(std::time::Duration::from_secs(5));

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await?;

    Ok(pool)
}

/// Create the database file and schema. A no-op for the memory backend.
pub async fn init(config: &Config) -> Result<()> {
    if config.storage.backend == StorageBackend::Memory {
        return Ok(());
    }
    let pool = connect(config).await?;
    migrate::run_migrations(&pool).await?;
    pool.close().await;
    Ok(())
}

/// Open the configured backend, creating the schema when needed.
pub async fn open_store(config: &Config) -> Result<AnyStore> {
    match config.storage.backend {
        StorageBackend::Sqlite => {
            let pool = connect(config).await?;
            migrate::run_migrations(&pool).await?;
            Ok(AnyStore::Sqlite(SqliteStore::new(pool)))
        }
        StorageBackend::Memory => Ok(AnyStore::Memory(InMemoryStore::new())),
    }
}
