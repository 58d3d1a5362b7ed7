//! Import run orchestration.
//!
//! Drives one [`ImportRun`](crate::models::ImportRun) through its states:
//!
//! ```text
//! Pending → Fetching → Upserting → BuildingTaxonomy → GeneratingAnnotations → Completed
//!              └───────────┴──────────────┴─────────────────────┴──→ Stopped
//! ```
//!
//! The changed-key listing is walked in chunks. Each chunk is fetched,
//! filtered by date added, mapped and written before the next chunk is
//! requested, so only one chunk of source records is alive at a time.
//! Attachment media whose parent sits in another chunk is carried over
//! and appended to the parent once it has an id.
//! Tags seen while fetching are collected in a [`TagLedger`] and turned
//! into taxonomy chains and annotations once every document has an id.
//!
//! Cancellation is cooperative: [`StopSignal::should_stop`] is polled at
//! each chunk, each document update, each batch create, each carried-over
//! media append and each tag label.
//! Work already sent to the store is kept. Any [`SourceError`] aborts the
//! run. The version cursor is only advanced when the run completes.
//!
//! [`SourceError`]: crate::error::SourceError

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::actors::{ActorDirectory, ACCOUNT_KEY, PERSON_KEY};
use crate::annotate::{Annotator, TagLedger, ANNOTATION_KEY};
use crate::config::Config;
use crate::mapper::{self, FileImport, Mapper, DOCUMENT_KEY};
use crate::mapping::MappingTables;
use crate::models::{
    Draft, Media, RecordRef, ResourceKind, SourceRecord, TagOrigin, TargetId, Value,
};
use crate::progress::{ImportProgressEvent, ImportProgressReporter};
use crate::schema::Schema;
use crate::source::{Library, LibraryKind, SourceClient, SourceUrl, Transport};
use crate::store::{ImportLog, TargetStore, UpdateOptions};
use crate::taxonomy::{Taxonomy, TAG_KEY};
use crate::upsert::{Journal, KeyTable, RecordFailure, Stage, Tally, Upserter};

const COMPILED_BY: &str = "cito:isCompiledBy";
const PART_OF: &str = "dcterms:isPartOf";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Pending,
    Fetching,
    Upserting,
    BuildingTaxonomy,
    GeneratingAnnotations,
    Completed,
    Stopped,
}

impl RunState {
    pub fn label(&self) -> &'static str {
        match self {
            RunState::Pending => "pending",
            RunState::Fetching => "fetching",
            RunState::Upserting => "upserting",
            RunState::BuildingTaxonomy => "building taxonomy",
            RunState::GeneratingAnnotations => "generating annotations",
            RunState::Completed => "completed",
            RunState::Stopped => "stopped",
        }
    }
}

/// Cooperative cancellation check.
pub trait StopSignal: Send + Sync {
    fn should_stop(&self) -> bool;
}

/// Shareable stop flag, set from a signal handler.
#[derive(Debug, Clone, Default)]
pub struct StopFlag(Arc<AtomicBool>);

impl StopFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

impl StopSignal for StopFlag {
    fn should_stop(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Inbound arguments for one run.
#[derive(Debug, Clone)]
pub struct ImportArgs {
    pub run_id: i64,
    pub library: Library,
    pub collection: Option<String>,
    pub api_key: Option<String>,
    pub import_files: bool,
    /// Version cursor: only records changed after it are fetched.
    pub since: i64,
    /// Keep records added at or after this instant.
    pub added_after: Option<DateTime<Utc>>,
    /// Keep records added strictly before this instant.
    pub added_before: Option<DateTime<Utc>>,
    /// Item set every document is placed in.
    pub container: Option<TargetId>,
    /// Account name of the operator running the import.
    pub operator: String,
}

/// Collaborators a run talks to.
pub struct ImportContext<'a> {
    pub config: &'a Config,
    pub store: &'a dyn TargetStore,
    pub log: &'a dyn ImportLog,
    pub transport: &'a dyn Transport,
    pub tables: &'a MappingTables,
    pub stop: &'a dyn StopSignal,
    pub progress: &'a dyn ImportProgressReporter,
}

/// Outcome of one run.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: i64,
    pub state: RunState,
    /// Version cursor after the run.
    pub version: i64,
    pub changed: usize,
    pub fetched: usize,
    pub out_of_range: usize,
    pub documents: Tally,
    pub notes: Tally,
    pub actors: Tally,
    pub persons: Tally,
    pub tags: Tally,
    pub annotations: Tally,
    pub failures: Vec<RecordFailure>,
}

impl RunReport {
    fn new(run_id: i64, version: i64) -> Self {
        Self {
            run_id,
            state: RunState::Pending,
            version,
            changed: 0,
            fetched: 0,
            out_of_range: 0,
            documents: Tally::default(),
            notes: Tally::default(),
            actors: Tally::default(),
            persons: Tally::default(),
            tags: Tally::default(),
            annotations: Tally::default(),
            failures: Vec::new(),
        }
    }

    fn absorb(&mut self, journal: Journal) {
        self.documents = journal.tally(Stage::Document);
        self.notes = journal.tally(Stage::Note);
        self.actors = journal.tally(Stage::Actor);
        self.persons = journal.tally(Stage::Person);
        self.tags = journal.tally(Stage::Tag);
        self.annotations = journal.tally(Stage::Annotation);
        self.failures = journal.failures;
    }
}

/// Whether a record's date added lies in `[after, before)`. Undated records
/// only pass when no bound is set.
pub fn in_date_range(
    added: Option<DateTime<Utc>>,
    after: Option<DateTime<Utc>>,
    before: Option<DateTime<Utc>>,
) -> bool {
    match added {
        Some(at) => after.map_or(true, |a| at >= a) && before.map_or(true, |b| at < b),
        None => after.is_none() && before.is_none(),
    }
}

/// Account actor of the library member who added `record`, if known.
async fn creating_user(
    actors: &mut ActorDirectory<'_>,
    up: &Upserter<'_>,
    record: &SourceRecord,
) -> Result<Option<RecordRef>> {
    match &record.meta.created_by_user {
        Some(user) => {
            let id = user.id.to_string();
            actors.account(up, &user.username, Some(&id)).await
        }
        None => Ok(None),
    }
}

/// Mutable state owned by one run.
struct Run<'a, 'c> {
    ctx: &'c ImportContext<'a>,
    args: &'c ImportArgs,
    schema: &'c Schema,
    client: SourceClient<'a>,
    up: Upserter<'a>,
    actors: ActorDirectory<'c>,
    operator: Option<RecordRef>,
    ledger: TagLedger,
    documents: KeyTable,
    note_parents: Vec<(String, String)>,
    /// Attachment media waiting for a parent from another chunk.
    pending_media: HashMap<String, Vec<Media>>,
    report: RunReport,
}

pub async fn run_import(ctx: &ImportContext<'_>, args: &ImportArgs) -> Result<RunReport> {
    let run = ctx
        .log
        .get_run(args.run_id)
        .await?
        .with_context(|| format!("import run #{} not found", args.run_id))?;

    let vocabularies = ctx.store.vocabularies().await?;
    let schema = Schema::from_vocabularies(&vocabularies, &ctx.config.vocabularies);
    schema.require_properties(&[DOCUMENT_KEY, ACCOUNT_KEY, PERSON_KEY, TAG_KEY, ANNOTATION_KEY])?;
    debug!(
        classes = schema.class_count(),
        properties = schema.property_count(),
        "schema cache built"
    );

    if let Some(container) = args.container {
        if ctx.store.read(ResourceKind::ItemSet, container).await?.is_none() {
            bail!("container #{} not found", container);
        }
    }

    let urls = SourceUrl::new(&ctx.config.source.base_url, args.library)?;
    let mut state = Run {
        ctx,
        args,
        schema: &schema,
        client: SourceClient::new(ctx.transport, urls, args.api_key.clone()),
        up: Upserter::new(ctx.store, ctx.log, run.id),
        actors: ActorDirectory::new(&schema, &ctx.config.source.account_label),
        operator: None,
        ledger: TagLedger::default(),
        documents: KeyTable::default(),
        note_parents: Vec::new(),
        pending_media: HashMap::new(),
        report: RunReport::new(run.id, run.version),
    };

    let outcome = state.execute().await;
    let journal = state.up.journal();
    let mut report = state.report;
    report.absorb(journal);
    outcome?;

    info!(
        run_id = report.run_id,
        state = report.state.label(),
        version = report.version,
        failures = report.failures.len(),
        "import finished"
    );
    Ok(report)
}

impl<'a, 'c> Run<'a, 'c> {
    fn enter(&mut self, state: RunState) {
        self.report.state = state;
        info!(run_id = self.report.run_id, state = state.label(), "import state");
        self.ctx.progress.report(ImportProgressEvent::Phase {
            run_id: self.report.run_id,
            state,
        });
    }

    fn stopped(&mut self) -> bool {
        if self.ctx.stop.should_stop() {
            self.enter(RunState::Stopped);
            true
        } else {
            false
        }
    }

    async fn execute(&mut self) -> Result<()> {
        let identifier = match self.args.library.kind {
            LibraryKind::User => Some(self.args.library.id.to_string()),
            LibraryKind::Group => None,
        };
        self.operator = self
            .actors
            .account(&self.up, &self.args.operator, identifier.as_deref())
            .await?;

        self.enter(RunState::Fetching);
        let changed = self
            .client
            .changed_keys(self.args.since, self.args.collection.as_deref())
            .await?;
        self.report.changed = changed.keys.len();
        info!(
            run_id = self.report.run_id,
            count = changed.keys.len(),
            since = self.args.since,
            "changed keys resolved"
        );

        let chunk_size = self.ctx.config.source.chunk_size.max(1);
        let total = changed.keys.len() as u64;
        let mut processed = 0u64;
        for chunk in changed.keys.chunks(chunk_size) {
            if self.stopped() {
                return Ok(());
            }
            if self.report.state != RunState::Fetching {
                self.enter(RunState::Fetching);
            }
            let records = self.client.fetch_records(chunk).await?;
            self.report.fetched += records.len();
            let records = self.filter_by_date(records);
            self.collect_tags(&records).await?;

            self.enter(RunState::Upserting);
            if !self.write_chunk(records).await? {
                self.enter(RunState::Stopped);
                return Ok(());
            }
            processed += chunk.len() as u64;
            self.ctx.progress.report(ImportProgressEvent::Records {
                run_id: self.report.run_id,
                n: processed,
                total,
            });
        }
        if !self.attach_pending_media(true).await? {
            self.enter(RunState::Stopped);
            return Ok(());
        }
        self.link_notes().await?;

        if !self.build_annotations().await? {
            return Ok(());
        }

        let version = changed
            .last_modified_version
            .unwrap_or(self.args.since)
            .max(self.args.since);
        self.ctx
            .log
            .set_run_version(self.report.run_id, version)
            .await?;
        self.report.version = version;
        self.enter(RunState::Completed);
        Ok(())
    }

    fn filter_by_date(&mut self, records: Vec<SourceRecord>) -> Vec<SourceRecord> {
        let (after, before) = (self.args.added_after, self.args.added_before);
        let before_len = records.len();
        let kept: Vec<SourceRecord> = records
            .into_iter()
            .filter(|r| in_date_range(r.data.date_added, after, before))
            .collect();
        self.report.out_of_range += before_len - kept.len();
        kept
    }

    /// Fetch each record's tag listing and note who applied what.
    async fn collect_tags(&mut self, records: &[SourceRecord]) -> Result<()> {
        let auto_tagger = self.ctx.config.import.auto_tagger.clone();
        for record in records {
            if record.is_attachment() {
                continue;
            }
            if record.is_note() && !self.ctx.config.import.notes_seed_tags {
                continue;
            }
            let tags = self.client.fetch_tags(&record.key).await?;
            if tags.is_empty() {
                continue;
            }
            let creator = creating_user(&mut self.actors, &self.up, record).await?;
            for tag in &tags {
                let actor = match tag.origin() {
                    TagOrigin::Manual => creator.clone().or_else(|| self.operator.clone()),
                    TagOrigin::Automatic => self.actors.account(&self.up, &auto_tagger, None).await?,
                };
                if let Some(actor) = actor {
                    self.ledger.record(&tag.tag, tag.origin(), &actor, &record.key);
                }
            }
        }
        Ok(())
    }

    /// Map and persist one chunk. Returns `false` when stopped part-way.
    async fn write_chunk(&mut self, records: Vec<SourceRecord>) -> Result<bool> {
        self.actors.persons_for(&self.up, &records).await?;

        let mut parts = mapper::partition(records);
        let mapper = Mapper::new(self.schema, self.ctx.tables);
        let files = match (&self.args.api_key, self.args.import_files) {
            (Some(key), true) => Some(FileImport {
                urls: self.client.urls(),
                api_key: key.as_str(),
            }),
            _ => None,
        };

        let mut documents: Vec<(String, Draft)> = Vec::new();
        let mut notes: Vec<(String, Draft)> = Vec::new();
        for record in &parts.parents {
            let attachments = parts.attachments.remove(&record.key).unwrap_or_default();
            let mut draft = mapper.document(record, &attachments, self.actors.persons(), files.as_ref());
            for media in self.pending_media.remove(&record.key).into_iter().flatten() {
                if !draft.media.iter().any(|m| m.source == media.source) {
                    draft.media.push(media);
                }
            }
            if let Some(container) = self.args.container {
                draft.containers.push(container);
            }
            let creator = creating_user(&mut self.actors, &self.up, record).await?;
            self.add_compilers(&mut draft, creator.as_ref());
            if record.is_note() {
                notes.push((record.key.clone(), draft));
            } else {
                documents.push((record.key.clone(), draft));
            }
        }
        self.note_parents.extend(parts.note_parents);

        // Attachments whose parent is not in this chunk.
        if let Some(files) = files.as_ref() {
            for (parent, attachments) in parts.attachments {
                let media: Vec<Media> = attachments
                    .iter()
                    .filter_map(|a| mapper.map_attachment(a, files))
                    .collect();
                if !media.is_empty() {
                    self.pending_media.entry(parent).or_default().extend(media);
                }
            }
        }
        // Source records are no longer needed once mapped.
        drop(parts.parents);

        for (stage, drafts) in [(Stage::Document, documents), (Stage::Note, notes)] {
            if !self.write_drafts(stage, drafts).await? {
                return Ok(false);
            }
        }
        self.attach_pending_media(false).await
    }

    /// Append carried-over attachment media to parents written earlier in
    /// the run. With `search_store`, parents unknown to the run are looked
    /// up by key; media still without a parent is dropped with a warning.
    /// Returns `false` when stopped.
    async fn attach_pending_media(&mut self, search_store: bool) -> Result<bool> {
        let mut keys: Vec<String> = self.pending_media.keys().cloned().collect();
        keys.sort();
        for key in keys {
            let parent = match self.documents.get(&key) {
                Some(r) => Some(r.id),
                None if search_store => self
                    .up
                    .find(ResourceKind::Item, DOCUMENT_KEY, &key)
                    .await?
                    .map(|r| r.id),
                None => continue,
            };
            let Some(media) = self.pending_media.remove(&key) else {
                continue;
            };
            let Some(parent) = parent else {
                warn!(
                    run_id = self.report.run_id,
                    parent = %key,
                    files = media.len(),
                    "attachment parent not found, media dropped"
                );
                continue;
            };
            if self.ctx.stop.should_stop() {
                return Ok(false);
            }
            self.up
                .append_media(Stage::Document, ResourceKind::Item, &key, parent, media)
                .await?;
        }
        Ok(true)
    }

    fn add_compilers(&self, draft: &mut Draft, creator: Option<&RecordRef>) {
        if !self.schema.has_property(COMPILED_BY) {
            return;
        }
        let mut ids: Vec<TargetId> = self.operator.iter().map(|o| o.id).collect();
        if let Some(c) = creator {
            if !ids.contains(&c.id) {
                ids.push(c.id);
            }
        }
        for id in ids {
            draft.push(COMPILED_BY, Value::Resource(id));
        }
    }

    /// Update existing records one at a time, then batch-create the rest.
    async fn write_drafts(&mut self, stage: Stage, drafts: Vec<(String, Draft)>) -> Result<bool> {
        let mut fresh: Vec<(String, Draft)> = Vec::new();
        for (key, draft) in drafts {
            let Some(existing) = self.up.find(ResourceKind::Item, DOCUMENT_KEY, &key).await? else {
                fresh.push((key, draft));
                continue;
            };
            if self.ctx.stop.should_stop() {
                return Ok(false);
            }
            if let Some(id) = self
                .up
                .update(stage, ResourceKind::Item, &key, existing.id, &draft, UpdateOptions::REPLACE)
                .await
            {
                self.up.link(&key, id).await;
                self.remember(&key, id, &draft);
            }
        }

        for batch in fresh.chunks(self.ctx.config.import.batch_size.max(1)) {
            if self.ctx.stop.should_stop() {
                return Ok(false);
            }
            let ids = self.up.create_batch(stage, ResourceKind::Item, batch).await?;
            for ((key, draft), id) in batch.iter().zip(ids) {
                if let Some(id) = id {
                    self.remember(key, id, draft);
                }
            }
            debug!(run_id = self.report.run_id, ?stage, count = batch.len(), "batch written");
        }
        Ok(true)
    }

    fn remember(&mut self, key: &str, id: TargetId, draft: &Draft) {
        let title = draft
            .first_literal("dcterms:title")
            .map(str::to_string)
            .unwrap_or_else(|| key.to_string());
        self.documents.insert(key, RecordRef { id, title });
    }

    /// Point every promoted note at its parent document.
    async fn link_notes(&mut self) -> Result<()> {
        if !self.schema.has_property(PART_OF) {
            return Ok(());
        }
        let pairs = std::mem::take(&mut self.note_parents);
        for (note_key, parent_key) in pairs {
            let Some(note) = self.documents.get(&note_key).map(|r| r.id) else {
                continue;
            };
            let parent = match self.documents.get(&parent_key) {
                Some(r) => Some(r.id),
                None => self
                    .up
                    .find(ResourceKind::Item, DOCUMENT_KEY, &parent_key)
                    .await?
                    .map(|r| r.id),
            };
            let Some(parent) = parent else {
                continue;
            };
            let mut patch = Draft::new();
            patch.push(PART_OF, Value::Resource(parent));
            self.up
                .update(Stage::Note, ResourceKind::Item, &note_key, note, &patch, UpdateOptions::REPLACE)
                .await;
        }
        Ok(())
    }

    /// Build taxonomy chains, then annotations. Returns `false` when stopped.
    async fn build_annotations(&mut self) -> Result<bool> {
        let labels: Vec<String> = self.ledger.labels().map(str::to_string).collect();
        let total = labels.len() as u64;
        let mut taxonomy = Taxonomy::new(self.schema, &self.ctx.config.import.tag_delimiter);
        let mut chains: HashMap<String, Vec<RecordRef>> = HashMap::new();

        self.enter(RunState::BuildingTaxonomy);
        for (i, label) in labels.iter().enumerate() {
            if self.stopped() {
                return Ok(false);
            }
            let chain = taxonomy.chain(&self.up, label).await?;
            chains.insert(label.clone(), chain);
            self.ctx.progress.report(ImportProgressEvent::Tags {
                run_id: self.report.run_id,
                n: i as u64 + 1,
                total,
            });
        }

        self.enter(RunState::GeneratingAnnotations);
        let annotator = Annotator::new(self.schema);
        for (i, label) in labels.iter().enumerate() {
            if self.stopped() {
                return Ok(false);
            }
            let (Some(entry), Some(chain)) = (self.ledger.get(label), chains.get(label)) else {
                continue;
            };
            annotator
                .annotate_label(&self.up, entry, chain, &self.documents)
                .await?;
            self.ctx.progress.report(ImportProgressEvent::Tags {
                run_id: self.report.run_id,
                n: i as u64 + 1,
                total,
            });
        }
        Ok(true)
    }
}
