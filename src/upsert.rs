//! Dedup/upsert engine.
//!
//! Every entity the importer writes (documents, actors, tag concepts,
//! annotations) carries a designated dedup property. Before writing, the
//! store is searched for a record whose dedup property equals the entity's
//! key; a hit is updated in place, a miss is created. Successful writes of
//! keyed entities are recorded as [`ImportedRecordLink`]s for the run.
//!
//! Error policy:
//!
//! - store lookups (`search`, `read`) failing abort the run;
//! - create/update rejections are absorbed into the [`Journal`] as
//!   [`RecordFailure`]s and logged at WARN;
//! - a failed link write is logged at WARN and otherwise ignored.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use anyhow::Result;
use serde::Serialize;
use tracing::{trace, warn};

use crate::models::{
    Draft, ImportedRecordLink, Media, RecordRef, ResourceKind, TargetId, TargetRecord, Value,
};
use crate::store::{ImportLog, PropertyQuery, TargetStore, UpdateOptions};

/// Entity family being written, used to tally outcomes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Document,
    Note,
    Actor,
    Person,
    Tag,
    Annotation,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Tally {
    pub created: usize,
    pub updated: usize,
    pub failed: usize,
}

/// A write rejected by the store. Never fatal.
#[derive(Debug, Clone, Serialize)]
pub struct RecordFailure {
    pub key: String,
    pub stage: Stage,
    pub message: String,
}

/// Outcomes accumulated over a run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Journal {
    pub tallies: BTreeMap<Stage, Tally>,
    pub failures: Vec<RecordFailure>,
}

impl Journal {
    pub fn tally(&self, stage: Stage) -> Tally {
        self.tallies.get(&stage).copied().unwrap_or_default()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Created(TargetId),
    Updated(TargetId),
}

impl Outcome {
    pub fn id(&self) -> TargetId {
        match self {
            Outcome::Created(id) | Outcome::Updated(id) => *id,
        }
    }
}

/// External key to assigned record, filled as documents are written so
/// later stages never re-query the store for them.
#[derive(Debug, Default)]
pub struct KeyTable {
    records: HashMap<String, RecordRef>,
}

impl KeyTable {
    pub fn insert(&mut self, key: impl Into<String>, record: RecordRef) {
        self.records.insert(key.into(), record);
    }

    pub fn get(&self, key: &str) -> Option<&RecordRef> {
        self.records.get(key)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

pub struct Upserter<'a> {
    store: &'a dyn TargetStore,
    log: &'a dyn ImportLog,
    run_id: i64,
    journal: Mutex<Journal>,
}

impl<'a> Upserter<'a> {
    pub fn new(store: &'a dyn TargetStore, log: &'a dyn ImportLog, run_id: i64) -> Self {
        Self {
            store,
            log,
            run_id,
            journal: Mutex::new(Journal::default()),
        }
    }

    /// Snapshot of the outcomes so far.
    pub fn journal(&self) -> Journal {
        match self.journal.lock() {
            Ok(j) => j.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// First record of `kind` whose `property` equals `text`.
    pub async fn find(
        &self,
        kind: ResourceKind,
        property: &str,
        text: &str,
    ) -> Result<Option<TargetRecord>> {
        let hits = self
            .store
            .search(kind, &PropertyQuery::eq(property, text))
            .await?;
        Ok(hits.into_iter().next())
    }

    /// Look up by dedup key, then update or create.
    ///
    /// Returns `None` when the store rejected the write. `link_key`, when
    /// given, is recorded against the resulting id.
    #[allow(clippy::too_many_arguments)]
    pub async fn upsert(
        &self,
        stage: Stage,
        kind: ResourceKind,
        property: &str,
        key: &str,
        draft: &Draft,
        options: UpdateOptions,
        link_key: Option<&str>,
    ) -> Result<Option<Outcome>> {
        let outcome = match self.find(kind, property, key).await? {
            Some(existing) => self
                .update(stage, kind, key, existing.id, draft, options)
                .await
                .map(Outcome::Updated),
            None => self.create(stage, kind, key, draft).await.map(Outcome::Created),
        };
        if let (Some(outcome), Some(link_key)) = (outcome, link_key) {
            self.link(link_key, outcome.id()).await;
        }
        Ok(outcome)
    }

    /// Create one record, journaling the outcome.
    pub async fn create(
        &self,
        stage: Stage,
        kind: ResourceKind,
        key: &str,
        draft: &Draft,
    ) -> Option<TargetId> {
        match self.store.create(kind, draft).await {
            Ok(id) => {
                trace!(key, id, ?stage, "created");
                self.bump(stage, |t| t.created += 1);
                Some(id)
            }
            Err(e) => {
                self.fail(stage, key, format!("{:#}", e));
                None
            }
        }
    }

    /// Update one record, journaling the outcome.
    pub async fn update(
        &self,
        stage: Stage,
        kind: ResourceKind,
        key: &str,
        id: TargetId,
        draft: &Draft,
        options: UpdateOptions,
    ) -> Option<TargetId> {
        match self.store.update(kind, id, draft, options).await {
            Ok(()) => {
                trace!(key, id, ?stage, "updated");
                self.bump(stage, |t| t.updated += 1);
                Some(id)
            }
            Err(e) => {
                self.fail(stage, key, format!("{:#}", e));
                None
            }
        }
    }

    /// Create up to one batch of new records with continue-on-error, linking
    /// each success to its key. Results are positional.
    pub async fn create_batch(
        &self,
        stage: Stage,
        kind: ResourceKind,
        batch: &[(String, Draft)],
    ) -> Result<Vec<Option<TargetId>>> {
        let drafts: Vec<Draft> = batch.iter().map(|(_, d)| d.clone()).collect();
        let results = self.store.batch_create(kind, &drafts).await?;

        let mut ids = Vec::with_capacity(batch.len());
        for ((key, _), result) in batch.iter().zip(results) {
            match result {
                Ok(id) => {
                    self.bump(stage, |t| t.created += 1);
                    self.link(key, id).await;
                    ids.push(Some(id));
                }
                Err(message) => {
                    self.fail(stage, key, message);
                    ids.push(None);
                }
            }
        }
        Ok(ids)
    }

    /// Append `value` under `term` unless the record already holds it.
    /// Returns whether a write happened.
    pub async fn append_unique(
        &self,
        stage: Stage,
        kind: ResourceKind,
        id: TargetId,
        term: &str,
        value: Value,
    ) -> Result<bool> {
        let Some(record) = self.store.read(kind, id).await? else {
            self.fail(stage, &format!("#{}", id), format!("{} #{} not found", kind.as_str(), id));
            return Ok(false);
        };
        if record.has_value(term, &value) {
            return Ok(false);
        }
        let mut patch = Draft::new();
        patch.push(term, value);
        match self.store.update(kind, id, &patch, UpdateOptions::APPEND).await {
            Ok(()) => Ok(true),
            Err(e) => {
                self.fail(stage, &format!("#{}", id), format!("{:#}", e));
                Ok(false)
            }
        }
    }

    /// Append the media entries `id` does not hold yet, matched on source
    /// URL. Returns whether a write happened.
    pub async fn append_media(
        &self,
        stage: Stage,
        kind: ResourceKind,
        key: &str,
        id: TargetId,
        media: Vec<Media>,
    ) -> Result<bool> {
        let Some(record) = self.store.read(kind, id).await? else {
            self.fail(stage, key, format!("{} #{} not found", kind.as_str(), id));
            return Ok(false);
        };
        let mut patch = Draft::new();
        for entry in media {
            let known = record
                .media
                .iter()
                .chain(patch.media.iter())
                .any(|m| m.source == entry.source);
            if !known {
                patch.media.push(entry);
            }
        }
        if patch.media.is_empty() {
            return Ok(false);
        }
        Ok(self
            .update(stage, kind, key, id, &patch, UpdateOptions::APPEND)
            .await
            .is_some())
    }

    /// Record `{run, key} -> id`. Failures are logged and ignored.
    pub async fn link(&self, key: &str, id: TargetId) {
        let link = ImportedRecordLink {
            run_id: self.run_id,
            source_key: key.to_string(),
            record_id: id,
        };
        if let Err(e) = self.log.record_link(&link).await {
            warn!(run_id = self.run_id, key, id, error = %e, "failed to record import link");
        }
    }

    fn bump(&self, stage: Stage, f: impl FnOnce(&mut Tally)) {
        if let Ok(mut journal) = self.journal.lock() {
            f(journal.tallies.entry(stage).or_default());
        }
    }

    fn fail(&self, stage: Stage, key: &str, message: String) {
        warn!(run_id = self.run_id, key, ?stage, error = %message, "record write rejected");
        if let Ok(mut journal) = self.journal.lock() {
            journal.tallies.entry(stage).or_default().failed += 1;
            journal.failures.push(RecordFailure {
                key: key.to_string(),
                stage,
                message,
            });
        }
    }
}
