//! Storage abstraction for refsync.
//!
//! Two traits split the store's responsibilities:
//!
//! - [`TargetStore`]: the generic linked-data record store the importer
//!   writes into (create, partial update, read, property search, batch
//!   create with continue-on-error).
//! - [`ImportLog`]: import-run bookkeeping, the durable
//!   `{run, source key} -> record id` correspondence and the version cursor.
//!
//! Both are implemented by [`memory::InMemoryStore`] (tests, embedding) and
//! [`sqlite::SqliteStore`] (the CLI).
//!
//! # Operations
//!
//! | Method | Purpose |
//! |--------|---------|
//! | [`vocabularies`](TargetStore::vocabularies) | Registered vocabularies with their classes and properties |
//! | [`create`](TargetStore::create) | Validate and persist a draft, returning its id |
//! | [`update`](TargetStore::update) | Full, partial-replace or partial-append update |
//! | [`read`](TargetStore::read) | Load one record |
//! | [`search`](TargetStore::search) | Records whose property equals/contains a text |
//! | [`batch_create`](TargetStore::batch_create) | Create many drafts, one result per draft |

pub mod memory;
pub mod sqlite;

use std::collections::HashSet;

use anyhow::Result;
use async_trait::async_trait;

use crate::models::{
    Draft, ImportRun, ImportRunSummary, ImportedRecordLink, NewImportRun, ResourceKind,
    TargetId, TargetRecord, Value,
};
use crate::vocab::Vocabulary;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchType {
    /// Exact text equality.
    Eq,
    /// Substring match.
    Contains,
}

/// A single-property search filter.
#[derive(Debug, Clone)]
pub struct PropertyQuery {
    pub property: String,
    pub match_type: MatchType,
    pub text: String,
}

impl PropertyQuery {
    pub fn eq(property: &str, text: impl Into<String>) -> Self {
        Self {
            property: property.to_string(),
            match_type: MatchType::Eq,
            text: text.into(),
        }
    }

    pub fn contains(property: &str, text: impl Into<String>) -> Self {
        Self {
            property: property.to_string(),
            match_type: MatchType::Contains,
            text: text.into(),
        }
    }

    /// Whether `record` holds a value under the property satisfying this query.
    pub fn matches(&self, record: &TargetRecord) -> bool {
        record
            .values
            .get(&self.property)
            .into_iter()
            .flatten()
            .filter_map(Value::search_text)
            .any(|text| match self.match_type {
                MatchType::Eq => text == self.text,
                MatchType::Contains => text.contains(&self.text),
            })
    }
}

/// How an update treats the record's existing data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpdateOptions {
    /// Only the terms present in the draft are touched.
    pub partial: bool,
    /// Supplied values are appended to, not substituted for, existing ones.
    pub append: bool,
}

impl UpdateOptions {
    /// Replace the whole record with the draft.
    pub const FULL: UpdateOptions = UpdateOptions {
        partial: false,
        append: false,
    };
    /// Replace only the supplied terms.
    pub const REPLACE: UpdateOptions = UpdateOptions {
        partial: true,
        append: false,
    };
    /// Append to the supplied terms.
    pub const APPEND: UpdateOptions = UpdateOptions {
        partial: true,
        append: true,
    };
}

#[async_trait]
pub trait TargetStore: Send + Sync {
    /// Vocabularies registered in the store.
    async fn vocabularies(&self) -> Result<Vec<Vocabulary>>;

    /// Validate and persist a new record.
    async fn create(&self, kind: ResourceKind, draft: &Draft) -> Result<TargetId>;

    /// Update an existing record according to `options`.
    async fn update(
        &self,
        kind: ResourceKind,
        id: TargetId,
        draft: &Draft,
        options: UpdateOptions,
    ) -> Result<()>;

    async fn read(&self, kind: ResourceKind, id: TargetId) -> Result<Option<TargetRecord>>;

    /// Records of `kind` matching `query`, ascending by id.
    async fn search(&self, kind: ResourceKind, query: &PropertyQuery) -> Result<Vec<TargetRecord>>;

    /// Create every draft independently. A rejected draft yields `Err` in
    /// its slot and does not stop the others.
    async fn batch_create(
        &self,
        kind: ResourceKind,
        drafts: &[Draft],
    ) -> Result<Vec<std::result::Result<TargetId, String>>> {
        let mut results = Vec::with_capacity(drafts.len());
        for draft in drafts {
            results.push(self.create(kind, draft).await.map_err(|e| format!("{:#}", e)));
        }
        Ok(results)
    }
}

#[async_trait]
pub trait ImportLog: Send + Sync {
    async fn create_run(&self, run: &NewImportRun) -> Result<ImportRun>;

    async fn get_run(&self, id: i64) -> Result<Option<ImportRun>>;

    /// Every run, newest first, with the number of records linked to it.
    async fn list_runs(&self) -> Result<Vec<ImportRunSummary>>;

    /// Advance the run's version cursor.
    async fn set_run_version(&self, id: i64, version: i64) -> Result<()>;

    /// Highest version cursor recorded for a library URL, if any run advanced one.
    async fn latest_version(&self, url: &str) -> Result<Option<i64>>;

    /// Insert or replace the link for `(run_id, source_key)`.
    async fn record_link(&self, link: &ImportedRecordLink) -> Result<()>;

    async fn links_for_run(&self, run_id: i64) -> Result<Vec<ImportedRecordLink>>;
}

// ═══════════════════════════════════════════════════════════════════════
// Shared backend helpers
// ═══════════════════════════════════════════════════════════════════════

/// Every `prefix:local` class and property a store accepts.
#[derive(Debug, Clone, Default)]
pub(crate) struct TermIndex {
    classes: HashSet<String>,
    properties: HashSet<String>,
}

impl TermIndex {
    pub(crate) fn new(vocabularies: &[Vocabulary]) -> Self {
        let mut index = TermIndex::default();
        for vocab in vocabularies {
            for class in &vocab.classes {
                index.classes.insert(format!("{}:{}", vocab.prefix, class));
            }
            for property in &vocab.properties {
                index
                    .properties
                    .insert(format!("{}:{}", vocab.prefix, property));
            }
        }
        index
    }

    /// Reject drafts naming unknown terms or holding empty values.
    pub(crate) fn check(&self, draft: &Draft) -> Result<()> {
        if let Some(class) = &draft.resource_class {
            if !self.classes.contains(class) {
                anyhow::bail!("unknown resource class '{}'", class);
            }
        }
        self.check_values(&draft.values)
    }

    fn check_values(&self, values: &crate::models::ValueMap) -> Result<()> {
        for (term, list) in values {
            if !self.properties.contains(term) {
                anyhow::bail!("unknown property '{}'", term);
            }
            for value in list {
                match value {
                    Value::Literal(s) | Value::Uri(s) if s.trim().is_empty() => {
                        anyhow::bail!("empty value for property '{}'", term)
                    }
                    Value::Node(inner) => self.check_values(inner)?,
                    _ => {}
                }
            }
        }
        Ok(())
    }
}

/// Ids referenced by resource values (including inside nested nodes).
pub(crate) fn referenced_ids(draft: &Draft) -> Vec<TargetId> {
    fn walk(values: &crate::models::ValueMap, out: &mut Vec<TargetId>) {
        for value in values.values().flatten() {
            match value {
                Value::Resource(id) => out.push(*id),
                Value::Node(inner) => walk(inner, out),
                _ => {}
            }
        }
    }
    let mut ids = Vec::new();
    walk(&draft.values, &mut ids);
    ids.sort_unstable();
    ids.dedup();
    ids
}

/// Build a fresh record from a draft.
pub(crate) fn record_from_draft(id: TargetId, kind: ResourceKind, draft: &Draft) -> TargetRecord {
    TargetRecord {
        id,
        kind,
        resource_class: draft.resource_class.clone(),
        values: draft.values.clone(),
        containers: draft.containers.clone(),
        media: draft.media.clone(),
    }
}

/// Apply an update to a record in place.
pub(crate) fn apply_update(record: &mut TargetRecord, draft: &Draft, options: UpdateOptions) {
    if !options.partial {
        *record = record_from_draft(record.id, record.kind, draft);
        return;
    }
    if draft.resource_class.is_some() {
        record.resource_class = draft.resource_class.clone();
    }
    for (term, values) in &draft.values {
        let slot = record.values.entry(term.clone()).or_default();
        if options.append {
            slot.extend(values.iter().cloned());
        } else {
            *slot = values.clone();
        }
    }
    if options.append {
        for container in &draft.containers {
            if !record.containers.contains(container) {
                record.containers.push(*container);
            }
        }
        record.media.extend(draft.media.iter().cloned());
    } else {
        if !draft.containers.is_empty() {
            record.containers = draft.containers.clone();
        }
        if !draft.media.is_empty() {
            record.media = draft.media.clone();
        }
    }
}
