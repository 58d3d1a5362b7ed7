use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;
use crate::vocab::{builtin_vocabularies, Vocabulary};

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    apply(&pool).await?;
    pool.close().await;
    Ok(())
}

/// Create every table and seed the built-in vocabulary catalogue. Idempotent.
pub async fn apply(pool: &SqlitePool) -> Result<()> {
    // Vocabulary catalogue
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS vocabularies (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            prefix TEXT NOT NULL UNIQUE,
            namespace_uri TEXT NOT NULL UNIQUE,
            label TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS resource_classes (
            vocabulary_id INTEGER NOT NULL,
            local_name TEXT NOT NULL,
            PRIMARY KEY (vocabulary_id, local_name),
            FOREIGN KEY (vocabulary_id) REFERENCES vocabularies(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS properties (
            vocabulary_id INTEGER NOT NULL,
            local_name TEXT NOT NULL,
            PRIMARY KEY (vocabulary_id, local_name),
            FOREIGN KEY (vocabulary_id) REFERENCES vocabularies(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Records: the body (values, containers, media) is JSON; searchable
    // values are mirrored into record_values.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS records (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            kind TEXT NOT NULL,
            resource_class TEXT,
            body_json TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS record_values (
            record_id INTEGER NOT NULL,
            term TEXT NOT NULL,
            position INTEGER NOT NULL,
            value_type TEXT NOT NULL,
            text TEXT NOT NULL,
            FOREIGN KEY (record_id) REFERENCES records(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Import bookkeeping
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS import_runs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL,
            url TEXT NOT NULL,
            version INTEGER NOT NULL DEFAULT 0,
            job_id TEXT NOT NULL,
            undo_job_id TEXT,
            created_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS imported_records (
            run_id INTEGER NOT NULL,
            source_key TEXT NOT NULL,
            record_id INTEGER NOT NULL,
            UNIQUE(run_id, source_key),
            FOREIGN KEY (run_id) REFERENCES import_runs(id),
            FOREIGN KEY (record_id) REFERENCES records(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Create indexes
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_record_values_term_text ON record_values(term, text)",
    )
    .execute(pool)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_record_values_record ON record_values(record_id)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_records_kind ON records(kind)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_import_runs_url ON import_runs(url)")
        .execute(pool)
        .await?;

    seed_vocabularies(pool, &builtin_vocabularies()).await?;
    Ok(())
}

/// Register vocabularies, their classes and properties. Existing rows are kept.
pub async fn seed_vocabularies(pool: &SqlitePool, vocabularies: &[Vocabulary]) -> Result<()> {
    let mut tx = pool.begin().await?;
    for vocab in vocabularies {
        sqlx::query(
            "INSERT OR IGNORE INTO vocabularies (prefix, namespace_uri, label) VALUES (?, ?, ?)",
        )
        .bind(&vocab.prefix)
        .bind(&vocab.namespace_uri)
        .bind(&vocab.label)
        .execute(&mut *tx)
        .await?;

        let vocab_id: i64 = sqlx::query_scalar("SELECT id FROM vocabularies WHERE namespace_uri = ?")
            .bind(&vocab.namespace_uri)
            .fetch_one(&mut *tx)
            .await?;

        for class in &vocab.classes {
            sqlx::query(
                "INSERT OR IGNORE INTO resource_classes (vocabulary_id, local_name) VALUES (?, ?)",
            )
            .bind(vocab_id)
            .bind(class)
            .execute(&mut *tx)
            .await?;
        }
        for property in &vocab.properties {
            sqlx::query("INSERT OR IGNORE INTO properties (vocabulary_id, local_name) VALUES (?, ?)")
                .bind(vocab_id)
                .bind(property)
                .execute(&mut *tx)
                .await?;
        }
    }
    tx.commit().await?;
    Ok(())
}
