//! SQLite connection handling.

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};

use crate::config::Config;
use crate::store::sqlite::SqliteStore;

/// Open the database at `path`, creating the file and its directory when
/// missing. Foreign keys are enforced.
pub async fn connect_path(path: &Path) -> Result<SqlitePool> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }

    let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", path.display()))?
        .create_if_missing(true)
        .foreign_keys(true)
        .busy_timeout(Duration::from_secs(5))
        .journal_mode(SqliteJournalMode::Wal);

    SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await
        .with_context(|| format!("Failed to open database: {}", path.display()))
}

pub async fn connect(config: &Config) -> Result<SqlitePool> {
    connect_path(&config.db.path).await
}

/// Store over the configured database. Fails when `refsync init` has not
/// been run against it.
pub async fn open_store(config: &Config) -> Result<SqliteStore> {
    let pool = connect(config).await?;
    let initialized: Option<(String,)> = sqlx::query_as(
        "SELECT name FROM sqlite_master WHERE type = 'table' AND name = 'records'",
    )
    .fetch_optional(&pool)
    .await?;
    if initialized.is_none() {
        pool.close().await;
        bail!(
            "Database {} is not initialized. Run `refsync init` first.",
            config.db.path.display()
        );
    }
    Ok(SqliteStore::new(pool))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migrate;
    use crate::store::TargetStore;

    #[tokio::test]
    async fn open_store_requires_init() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::with_db_path(dir.path().join("nested/refsync.sqlite"));

        let err = open_store(&config).await.err().unwrap().to_string();
        assert!(err.contains("not initialized"), "{}", err);
        assert!(dir.path().join("nested").is_dir());

        migrate::run_migrations(&config).await.unwrap();
        let store = open_store(&config).await.unwrap();
        assert!(!store.vocabularies().await.unwrap().is_empty());
    }
}
