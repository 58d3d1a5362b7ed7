//! SQLite-backed [`TargetStore`] and [`ImportLog`] implementation.
//!
//! Each record is one `records` row whose body (values, containers, media)
//! is stored as JSON. Every literal, URI and resource value is mirrored
//! into `record_values` so property searches hit an index instead of
//! scanning bodies.

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, Sqlite, SqlitePool, Transaction};

use crate::models::{
    Draft, ImportRun, ImportRunSummary, ImportedRecordLink, Media, NewImportRun, ResourceKind,
    TargetId, TargetRecord, Value, ValueMap,
};
use crate::vocab::Vocabulary;

use super::{
    apply_update, record_from_draft, referenced_ids, ImportLog, MatchType, PropertyQuery,
    TargetStore, TermIndex, UpdateOptions,
};

/// SQLite implementation of [`TargetStore`] and [`ImportLog`].
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn terms(&self) -> Result<TermIndex> {
        Ok(TermIndex::new(&self.vocabularies().await?))
    }

    async fn check_refs(&self, draft: &Draft) -> Result<()> {
        for id in referenced_ids(draft) {
            let exists: bool = sqlx::query_scalar("SELECT COUNT(*) > 0 FROM records WHERE id = ?")
                .bind(id)
                .fetch_one(&self.pool)
                .await?;
            if !exists {
                bail!("referenced resource #{} does not exist", id);
            }
        }
        for id in &draft.containers {
            let exists: bool = sqlx::query_scalar(
                "SELECT COUNT(*) > 0 FROM records WHERE id = ? AND kind = 'item_set'",
            )
            .bind(id)
            .fetch_one(&self.pool)
            .await?;
            if !exists {
                bail!("container #{} does not exist", id);
            }
        }
        Ok(())
    }

    async fn write_body(
        tx: &mut Transaction<'_, Sqlite>,
        record: &TargetRecord,
    ) -> Result<()> {
        let body = serde_json::to_string(&StoredBody {
            values: record.values.clone(),
            containers: record.containers.clone(),
            media: record.media.clone(),
        })?;
        sqlx::query(
            "UPDATE records SET resource_class = ?, body_json = ?, updated_at = ? WHERE id = ?",
        )
        .bind(&record.resource_class)
        .bind(&body)
        .bind(Utc::now().timestamp())
        .bind(record.id)
        .execute(&mut **tx)
        .await?;

        sqlx::query("DELETE FROM record_values WHERE record_id = ?")
            .bind(record.id)
            .execute(&mut **tx)
            .await?;
        for (term, values) in &record.values {
            for (position, value) in values.iter().enumerate() {
                let Some(text) = value.search_text() else {
                    continue;
                };
                sqlx::query(
                    "INSERT INTO record_values (record_id, term, position, value_type, text) VALUES (?, ?, ?, ?, ?)",
                )
                .bind(record.id)
                .bind(term)
                .bind(position as i64)
                .bind(value_type(value))
                .bind(text)
                .execute(&mut **tx)
                .await?;
            }
        }
        Ok(())
    }
}

#[derive(Serialize, Deserialize)]
struct StoredBody {
    #[serde(default)]
    values: ValueMap,
    #[serde(default)]
    containers: Vec<TargetId>,
    #[serde(default)]
    media: Vec<Media>,
}

fn value_type(value: &Value) -> &'static str {
    match value {
        Value::Literal(_) => "literal",
        Value::Uri(_) => "uri",
        Value::Resource(_) => "resource",
        Value::Node(_) => "node",
    }
}

fn row_to_record(row: &SqliteRow) -> Result<TargetRecord> {
    let kind_str: String = row.get("kind");
    let kind = ResourceKind::parse(&kind_str)
        .ok_or_else(|| anyhow!("unknown record kind '{}'", kind_str))?;
    let body_json: String = row.get("body_json");
    let body: StoredBody = serde_json::from_str(&body_json)?;
    Ok(TargetRecord {
        id: row.get("id"),
        kind,
        resource_class: row.get("resource_class"),
        values: body.values,
        containers: body.containers,
        media: body.media,
    })
}

fn row_to_run(row: &SqliteRow) -> ImportRun {
    let created_at: i64 = row.get("created_at");
    ImportRun {
        id: row.get("id"),
        name: row.get("name"),
        url: row.get("url"),
        version: row.get("version"),
        job_id: row.get("job_id"),
        undo_job_id: row.get("undo_job_id"),
        created_at: DateTime::<Utc>::from_timestamp(created_at, 0).unwrap_or_default(),
    }
}

#[async_trait]
impl TargetStore for SqliteStore {
    async fn vocabularies(&self) -> Result<Vec<Vocabulary>> {
        let rows =
            sqlx::query("SELECT id, prefix, namespace_uri, label FROM vocabularies ORDER BY id")
                .fetch_all(&self.pool)
                .await?;

        let mut vocabularies = Vec::with_capacity(rows.len());
        for row in rows {
            let vocab_id: i64 = row.get("id");
            let classes: Vec<String> = sqlx::query_scalar(
                "SELECT local_name FROM resource_classes WHERE vocabulary_id = ? ORDER BY local_name",
            )
            .bind(vocab_id)
            .fetch_all(&self.pool)
            .await?;
            let properties: Vec<String> = sqlx::query_scalar(
                "SELECT local_name FROM properties WHERE vocabulary_id = ? ORDER BY local_name",
            )
            .bind(vocab_id)
            .fetch_all(&self.pool)
            .await?;
            vocabularies.push(Vocabulary {
                prefix: row.get("prefix"),
                namespace_uri: row.get("namespace_uri"),
                label: row.get("label"),
                classes,
                properties,
            });
        }
        Ok(vocabularies)
    }

    async fn create(&self, kind: ResourceKind, draft: &Draft) -> Result<TargetId> {
        self.terms().await?.check(draft)?;
        self.check_refs(draft).await?;

        let now = Utc::now().timestamp();
        let mut tx = self.pool.begin().await?;
        let id = sqlx::query(
            "INSERT INTO records (kind, resource_class, body_json, created_at, updated_at) VALUES (?, NULL, '{}', ?, ?)",
        )
        .bind(kind.as_str())
        .bind(now)
        .bind(now)
        .execute(&mut *tx)
        .await?
        .last_insert_rowid();

        Self::write_body(&mut tx, &record_from_draft(id, kind, draft)).await?;
        tx.commit().await?;
        Ok(id)
    }

    async fn update(
        &self,
        kind: ResourceKind,
        id: TargetId,
        draft: &Draft,
        options: UpdateOptions,
    ) -> Result<()> {
        self.terms().await?.check(draft)?;
        self.check_refs(draft).await?;

        let mut record = self
            .read(kind, id)
            .await?
            .ok_or_else(|| anyhow!("{} #{} not found", kind.as_str(), id))?;
        apply_update(&mut record, draft, options);

        let mut tx = self.pool.begin().await?;
        Self::write_body(&mut tx, &record).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn read(&self, kind: ResourceKind, id: TargetId) -> Result<Option<TargetRecord>> {
        let row = sqlx::query(
            "SELECT id, kind, resource_class, body_json FROM records WHERE id = ? AND kind = ?",
        )
        .bind(id)
        .bind(kind.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(row_to_record).transpose()
    }

    async fn search(&self, kind: ResourceKind, query: &PropertyQuery) -> Result<Vec<TargetRecord>> {
        let predicate = match query.match_type {
            MatchType::Eq => "v.text = ?",
            MatchType::Contains => "instr(v.text, ?) > 0",
        };
        let sql = format!(
            r#"
            SELECT r.id, r.kind, r.resource_class, r.body_json
            FROM records r
            WHERE r.kind = ?
              AND EXISTS (
                SELECT 1 FROM record_values v
                WHERE v.record_id = r.id AND v.term = ? AND {}
              )
            ORDER BY r.id
            "#,
            predicate
        );
        let rows = sqlx::query(&sql)
            .bind(kind.as_str())
            .bind(&query.property)
            .bind(&query.text)
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(row_to_record).collect()
    }
}

#[async_trait]
impl ImportLog for SqliteStore {
    async fn create_run(&self, run: &NewImportRun) -> Result<ImportRun> {
        let now = Utc::now().timestamp();
        let id = sqlx::query(
            "INSERT INTO import_runs (name, url, version, job_id, created_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&run.name)
        .bind(&run.url)
        .bind(run.version)
        .bind(&run.job_id)
        .bind(now)
        .execute(&self.pool)
        .await?
        .last_insert_rowid();

        self.get_run(id)
            .await?
            .ok_or_else(|| anyhow!("import run #{} vanished after insert", id))
    }

    async fn get_run(&self, id: i64) -> Result<Option<ImportRun>> {
        let row = sqlx::query(
            "SELECT id, name, url, version, job_id, undo_job_id, created_at FROM import_runs WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(row_to_run))
    }

    async fn list_runs(&self) -> Result<Vec<ImportRunSummary>> {
        let rows = sqlx::query(
            r#"
            SELECT r.id, r.name, r.url, r.version, r.job_id, r.undo_job_id, r.created_at,
                   (SELECT COUNT(*) FROM imported_records l WHERE l.run_id = r.id) AS link_count
            FROM import_runs r
            ORDER BY r.id DESC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| ImportRunSummary {
                run: row_to_run(row),
                link_count: row.get("link_count"),
            })
            .collect())
    }

    async fn set_run_version(&self, id: i64, version: i64) -> Result<()> {
        let result = sqlx::query("UPDATE import_runs SET version = ? WHERE id = ?")
            .bind(version)
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            bail!("import run #{} not found", id);
        }
        Ok(())
    }

    async fn latest_version(&self, url: &str) -> Result<Option<i64>> {
        let version: Option<i64> =
            sqlx::query_scalar("SELECT MAX(version) FROM import_runs WHERE url = ? AND version > 0")
                .bind(url)
                .fetch_one(&self.pool)
                .await?;
        Ok(version)
    }

    async fn record_link(&self, link: &ImportedRecordLink) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO imported_records (run_id, source_key, record_id)
            VALUES (?, ?, ?)
            ON CONFLICT(run_id, source_key) DO UPDATE SET
                record_id = excluded.record_id
            "#,
        )
        .bind(link.run_id)
        .bind(&link.source_key)
        .bind(link.record_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn links_for_run(&self, run_id: i64) -> Result<Vec<ImportedRecordLink>> {
        let rows = sqlx::query(
            "SELECT run_id, source_key, record_id FROM imported_records WHERE run_id = ? ORDER BY rowid",
        )
        .bind(run_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .iter()
            .map(|row| ImportedRecordLink {
                run_id: row.get("run_id"),
                source_key: row.get("source_key"),
                record_id: row.get("record_id"),
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::{db, migrate};

    async fn open(dir: &tempfile::TempDir) -> SqliteStore {
        let config = Config::with_db_path(dir.path().join("refsync.sqlite"));
        migrate::run_migrations(&config).await.unwrap();
        SqliteStore::new(db::connect(&config).await.unwrap())
    }

    #[tokio::test]
    async fn vocabularies_are_seeded_once() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(&dir).await;
        migrate::apply(store.pool()).await.unwrap();
        let vocabs = store.vocabularies().await.unwrap();
        assert_eq!(vocabs.iter().filter(|v| v.prefix == "skos").count(), 1);
        let skos = vocabs.iter().find(|v| v.prefix == "skos").unwrap();
        assert!(skos.properties.contains(&"broader".to_string()));
    }

    #[tokio::test]
    async fn create_update_search_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(&dir).await;

        let mut set = Draft::new();
        set.push("dcterms:title", Value::literal("Library"));
        let set_id = store.create(ResourceKind::ItemSet, &set).await.unwrap();

        let mut doc = Draft::with_class(Some("bibo:Book".into()));
        doc.push("dcterms:isReferencedBy", Value::literal("ABCD1234"));
        doc.push("dcterms:title", Value::literal("Old"));
        doc.containers.push(set_id);
        let id = store.create(ResourceKind::Item, &doc).await.unwrap();

        let mut patch = Draft::new();
        patch.push("dcterms:title", Value::literal("New"));
        store
            .update(ResourceKind::Item, id, &patch, UpdateOptions::REPLACE)
            .await
            .unwrap();

        let hits = store
            .search(
                ResourceKind::Item,
                &PropertyQuery::eq("dcterms:isReferencedBy", "ABCD1234"),
            )
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].first_literal("dcterms:title"), Some("New"));
        assert_eq!(hits[0].containers, vec![set_id]);

        let old = store
            .search(ResourceKind::Item, &PropertyQuery::eq("dcterms:title", "Old"))
            .await
            .unwrap();
        assert!(old.is_empty());
        let partial = store
            .search(ResourceKind::Item, &PropertyQuery::contains("dcterms:title", "Ne"))
            .await
            .unwrap();
        assert_eq!(partial.len(), 1);
    }

    #[tokio::test]
    async fn rejects_unknown_property() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(&dir).await;
        let mut bad = Draft::new();
        bad.push("ex:nope", Value::literal("x"));
        assert!(store.create(ResourceKind::Item, &bad).await.is_err());
    }

    #[tokio::test]
    async fn import_log_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(&dir).await;
        let mut concept = Draft::new();
        concept.push("skos:prefLabel", Value::literal("History"));
        let record_id = store.create(ResourceKind::Item, &concept).await.unwrap();

        let run = store
            .create_run(&NewImportRun {
                name: "My library".into(),
                url: "https://api.example.org/users/1".into(),
                version: 0,
                job_id: "job-1".into(),
            })
            .await
            .unwrap();
        assert_eq!(run.version, 0);

        for _ in 0..2 {
            store
                .record_link(&ImportedRecordLink {
                    run_id: run.id,
                    source_key: "History".into(),
                    record_id,
                })
                .await
                .unwrap();
        }
        assert_eq!(store.links_for_run(run.id).await.unwrap().len(), 1);

        store.set_run_version(run.id, 42).await.unwrap();
        assert_eq!(store.latest_version(&run.url).await.unwrap(), Some(42));
        assert_eq!(store.latest_version("other").await.unwrap(), None);

        let runs = store.list_runs().await.unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].link_count, 1);
        assert_eq!(runs[0].run.version, 42);
    }
}
