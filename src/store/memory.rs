//! In-memory [`TargetStore`] and [`ImportLog`] implementation.
//!
//! Uses `BTreeMap` and `Vec` behind one `std::sync::RwLock`. Validation
//! matches the SQLite backend: unknown terms, empty values, dangling
//! resource references and unknown containers are rejected.

use std::collections::BTreeMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use chrono::Utc;

use crate::models::{
    Draft, ImportRun, ImportRunSummary, ImportedRecordLink, NewImportRun, ResourceKind,
    TargetId, TargetRecord,
};
use crate::vocab::{builtin_vocabularies, Vocabulary};

use super::{
    apply_update, record_from_draft, referenced_ids, ImportLog, PropertyQuery, TargetStore,
    TermIndex, UpdateOptions,
};

#[derive(Default)]
struct State {
    records: BTreeMap<TargetId, TargetRecord>,
    next_id: TargetId,
    runs: Vec<ImportRun>,
    links: Vec<ImportedRecordLink>,
}

/// In-memory store for tests and embedding.
pub struct InMemoryStore {
    vocabularies: Vec<Vocabulary>,
    terms: TermIndex,
    state: RwLock<State>,
}

impl InMemoryStore {
    /// Store seeded with the built-in vocabulary catalogue.
    pub fn new() -> Self {
        Self::with_vocabularies(builtin_vocabularies())
    }

    pub fn with_vocabularies(vocabularies: Vec<Vocabulary>) -> Self {
        let terms = TermIndex::new(&vocabularies);
        Self {
            vocabularies,
            terms,
            state: RwLock::new(State {
                next_id: 1,
                ..State::default()
            }),
        }
    }

    /// Snapshot of every record of `kind`, ascending by id.
    pub fn records(&self, kind: ResourceKind) -> Vec<TargetRecord> {
        match self.state.read() {
            Ok(state) => state
                .records
                .values()
                .filter(|r| r.kind == kind)
                .cloned()
                .collect(),
            Err(_) => Vec::new(),
        }
    }

    pub fn count(&self, kind: ResourceKind) -> usize {
        self.records(kind).len()
    }

    fn read_state(&self) -> Result<RwLockReadGuard<'_, State>> {
        self.state.read().map_err(|_| anyhow!("store lock poisoned"))
    }

    fn write_state(&self) -> Result<RwLockWriteGuard<'_, State>> {
        self.state.write().map_err(|_| anyhow!("store lock poisoned"))
    }

    fn check_refs(state: &State, draft: &Draft) -> Result<()> {
        for id in referenced_ids(draft) {
            if !state.records.contains_key(&id) {
                bail!("referenced resource #{} does not exist", id);
            }
        }
        for id in &draft.containers {
            match state.records.get(id) {
                Some(r) if r.kind == ResourceKind::ItemSet => {}
                _ => bail!("container #{} does not exist", id),
            }
        }
        Ok(())
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TargetStore for InMemoryStore {
    async fn vocabularies(&self) -> Result<Vec<Vocabulary>> {
        Ok(self.vocabularies.clone())
    }

    async fn create(&self, kind: ResourceKind, draft: &Draft) -> Result<TargetId> {
        self.terms.check(draft)?;
        let mut state = self.write_state()?;
        Self::check_refs(&state, draft)?;
        let id = state.next_id;
        state.next_id += 1;
        state.records.insert(id, record_from_draft(id, kind, draft));
        Ok(id)
    }

    async fn update(
        &self,
        kind: ResourceKind,
        id: TargetId,
        draft: &Draft,
        options: UpdateOptions,
    ) -> Result<()> {
        self.terms.check(draft)?;
        let mut state = self.write_state()?;
        Self::check_refs(&state, draft)?;
        let record = state
            .records
            .get_mut(&id)
            .filter(|r| r.kind == kind)
            .ok_or_else(|| anyhow!("{} #{} not found", kind.as_str(), id))?;
        apply_update(record, draft, options);
        Ok(())
    }

    async fn read(&self, kind: ResourceKind, id: TargetId) -> Result<Option<TargetRecord>> {
        let state = self.read_state()?;
        Ok(state.records.get(&id).filter(|r| r.kind == kind).cloned())
    }

    async fn search(&self, kind: ResourceKind, query: &PropertyQuery) -> Result<Vec<TargetRecord>> {
        let state = self.read_state()?;
        Ok(state
            .records
            .values()
            .filter(|r| r.kind == kind && query.matches(r))
            .cloned()
            .collect())
    }
}

#[async_trait]
impl ImportLog for InMemoryStore {
    async fn create_run(&self, run: &NewImportRun) -> Result<ImportRun> {
        let mut state = self.write_state()?;
        let id = state.runs.iter().map(|r| r.id).max().unwrap_or(0) + 1;
        let created = ImportRun {
            id,
            name: run.name.clone(),
            url: run.url.clone(),
            version: run.version,
            job_id: run.job_id.clone(),
            undo_job_id: None,
            created_at: Utc::now(),
        };
        state.runs.push(created.clone());
        Ok(created)
    }

    async fn get_run(&self, id: i64) -> Result<Option<ImportRun>> {
        let state = self.read_state()?;
        Ok(state.runs.iter().find(|r| r.id == id).cloned())
    }

    async fn list_runs(&self) -> Result<Vec<ImportRunSummary>> {
        let state = self.read_state()?;
        let mut runs: Vec<ImportRunSummary> = state
            .runs
            .iter()
            .map(|run| ImportRunSummary {
                link_count: state.links.iter().filter(|l| l.run_id == run.id).count() as i64,
                run: run.clone(),
            })
            .collect();
        runs.sort_by(|a, b| b.run.id.cmp(&a.run.id));
        Ok(runs)
    }

    async fn set_run_version(&self, id: i64, version: i64) -> Result<()> {
        let mut state = self.write_state()?;
        let run = state
            .runs
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or_else(|| anyhow!("import run #{} not found", id))?;
        run.version = version;
        Ok(())
    }

    async fn latest_version(&self, url: &str) -> Result<Option<i64>> {
        let state = self.read_state()?;
        Ok(state
            .runs
            .iter()
            .filter(|r| r.url == url && r.version > 0)
            .map(|r| r.version)
            .max())
    }

    async fn record_link(&self, link: &ImportedRecordLink) -> Result<()> {
        let mut state = self.write_state()?;
        match state
            .links
            .iter_mut()
            .find(|l| l.run_id == link.run_id && l.source_key == link.source_key)
        {
            Some(existing) => existing.record_id = link.record_id,
            None => state.links.push(link.clone()),
        }
        Ok(())
    }

    async fn links_for_run(&self, run_id: i64) -> Result<Vec<ImportedRecordLink>> {
        let state = self.read_state()?;
        Ok(state
            .links
            .iter()
            .filter(|l| l.run_id == run_id)
            .cloned()
            .collect())
    }
}
