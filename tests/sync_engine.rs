use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use reqwest::Url;
use serde_json::json;

use refsync::config::Config;
use refsync::error::SourceError;
use refsync::ingest::{run_import, ImportArgs, ImportContext, RunReport, RunState, StopFlag};
use refsync::mapping::MappingTables;
use refsync::models::{
    Draft, NewImportRun, ResourceKind, TargetId, TargetRecord, Value,
};
use refsync::progress::NoProgress;
use refsync::source::{HttpResponse, Library, LibraryKind, Transport};
use refsync::store::memory::InMemoryStore;
use refsync::store::{ImportLog, PropertyQuery, TargetStore, UpdateOptions};
use refsync::vocab::Vocabulary;

const LIBRARY_URL: &str = "https://api.zotero.org/users/42";

/// Scripted library: answers the versions listing, record fetches and tag
/// listings from in-memory fixtures.
struct FakeLibrary {
    version: i64,
    records: Vec<(i64, serde_json::Value)>,
    tags: HashMap<String, serde_json::Value>,
    failing_tags: Option<String>,
    record_fetches: AtomicUsize,
    /// Raise the flag while serving the n-th record fetch.
    stop_on_fetch: Option<(usize, StopFlag)>,
}

impl FakeLibrary {
    fn new(version: i64) -> Self {
        Self {
            version,
            records: Vec::new(),
            tags: HashMap::new(),
            failing_tags: None,
            record_fetches: AtomicUsize::new(0),
            stop_on_fetch: None,
        }
    }

    fn books(mut self, version: i64, prefix: &str, count: usize) -> Self {
        for i in 0..count {
            let key = format!("{}{:02}", prefix, i);
            let title = format!("Book {}", key);
            self = self.record(version, book(&key, &title, "2021-02-01T00:00:00Z"));
        }
        self
    }

    fn record(mut self, version: i64, record: serde_json::Value) -> Self {
        self.records.push((version, record));
        self
    }

    fn tags(mut self, key: &str, tags: serde_json::Value) -> Self {
        self.tags.insert(key.to_string(), tags);
        self
    }

    fn key_of(record: &serde_json::Value) -> &str {
        record["key"].as_str().unwrap()
    }
}

#[async_trait]
impl Transport for FakeLibrary {
    async fn get(&self, url: &str) -> Result<HttpResponse, SourceError> {
        let parsed = Url::parse(url).unwrap();
        let segments: Vec<&str> = parsed.path_segments().unwrap().collect();
        let query: HashMap<String, String> = parsed.query_pairs().into_owned().collect();

        match segments.as_slice() {
            ["users", "42", "items"] if query.get("format").map(String::as_str) == Some("versions") => {
                let since: i64 = query["since"].parse().unwrap();
                let mut versions = serde_json::Map::new();
                for (version, record) in &self.records {
                    if *version > since {
                        versions.insert(Self::key_of(record).to_string(), json!(version));
                    }
                }
                Ok(HttpResponse::ok(serde_json::Value::Object(versions).to_string())
                    .with_header("Last-Modified-Version", self.version.to_string()))
            }
            ["users", "42", "items"] => {
                let n = self.record_fetches.fetch_add(1, Ordering::SeqCst) + 1;
                if let Some((at, flag)) = &self.stop_on_fetch {
                    if n == *at {
                        flag.stop();
                    }
                }
                let wanted: Vec<&str> = query["itemKey"].split(',').collect();
                let body: Vec<&serde_json::Value> = wanted
                    .iter()
                    .filter_map(|k| {
                        self.records
                            .iter()
                            .map(|(_, r)| r)
                            .find(|r| Self::key_of(r) == *k)
                    })
                    .collect();
                Ok(HttpResponse::ok(serde_json::to_string(&body).unwrap()))
            }
            ["users", "42", "items", key, "tags"] => {
                if self.failing_tags.as_deref() == Some(*key) {
                    return Ok(HttpResponse {
                        status: 500,
                        reason: "Internal Server Error".to_string(),
                        headers: Vec::new(),
                        body: String::new(),
                    });
                }
                let body = self.tags.get(*key).cloned().unwrap_or_else(|| json!([]));
                Ok(HttpResponse::ok(body.to_string()))
            }
            _ => panic!("unexpected request: {}", url),
        }
    }
}

/// Store that rejects any record titled `rejected`.
struct Rejecting {
    inner: InMemoryStore,
    rejected: &'static str,
}

#[async_trait]
impl TargetStore for Rejecting {
    async fn vocabularies(&self) -> anyhow::Result<Vec<Vocabulary>> {
        self.inner.vocabularies().await
    }

    async fn create(&self, kind: ResourceKind, draft: &Draft) -> anyhow::Result<TargetId> {
        if draft.first_literal("dcterms:title") == Some(self.rejected) {
            anyhow::bail!("title not accepted: {}", self.rejected);
        }
        self.inner.create(kind, draft).await
    }

    async fn update(
        &self,
        kind: ResourceKind,
        id: TargetId,
        draft: &Draft,
        options: UpdateOptions,
    ) -> anyhow::Result<()> {
        self.inner.update(kind, id, draft, options).await
    }

    async fn read(&self, kind: ResourceKind, id: TargetId) -> anyhow::Result<Option<TargetRecord>> {
        self.inner.read(kind, id).await
    }

    async fn search(
        &self,
        kind: ResourceKind,
        query: &PropertyQuery,
    ) -> anyhow::Result<Vec<TargetRecord>> {
        self.inner.search(kind, query).await
    }
}

fn book(key: &str, title: &str, added: &str) -> serde_json::Value {
    json!({
        "key": key,
        "version": 1,
        "data": {
            "itemType": "book",
            "title": title,
            "dateAdded": added,
            "creators": [
                {"creatorType": "author", "firstName": "Zoe", "lastName": "Zed"},
                {"creatorType": "author", "name": "ACME"}
            ]
        }
    })
}

fn stored_file(key: &str, parent: &str, added: &str) -> serde_json::Value {
    json!({
        "key": key,
        "links": {"enclosure": {"href": format!("https://files.example/{}", key), "type": "application/pdf"}},
        "data": {
            "itemType": "attachment",
            "parentItem": parent,
            "title": "Scan",
            "dateAdded": added
        }
    })
}

fn manual(label: &str) -> serde_json::Value {
    json!({"tag": label, "meta": {"type": 0}})
}

fn sample_library() -> FakeLibrary {
    FakeLibrary::new(10)
        .record(3, book("K1", "A Book", "2021-03-01T10:00:00Z"))
        .record(
            4,
            json!({
                "key": "N1",
                "data": {
                    "itemType": "note",
                    "parentItem": "K1",
                    "note": "<p>Read chapter 2</p>",
                    "dateAdded": "2021-03-02T10:00:00Z"
                }
            }),
        )
        .record(
            5,
            json!({
                "key": "A1",
                "data": {
                    "itemType": "attachment",
                    "parentItem": "K1",
                    "title": "Full text",
                    "dateAdded": "2021-03-02T11:00:00Z"
                }
            }),
        )
        .tags("K1", json!([manual("History - Europe - 1900s")]))
}

async fn start_run(log: &InMemoryStore, version: i64) -> i64 {
    log.create_run(&NewImportRun {
        name: "test import".to_string(),
        url: LIBRARY_URL.to_string(),
        version,
        job_id: "job-1".to_string(),
    })
    .await
    .unwrap()
    .id
}

fn args(run_id: i64, since: i64) -> ImportArgs {
    ImportArgs {
        run_id,
        library: Library {
            kind: LibraryKind::User,
            id: 42,
        },
        collection: None,
        api_key: None,
        import_files: false,
        since,
        added_after: None,
        added_before: None,
        container: None,
        operator: "ada".to_string(),
    }
}

async fn import(
    store: &dyn TargetStore,
    log: &InMemoryStore,
    library: &FakeLibrary,
    args: &ImportArgs,
    stop: &StopFlag,
) -> anyhow::Result<RunReport> {
    let config = Config::with_db_path(PathBuf::from("unused.sqlite"));
    let tables = MappingTables::builtin();
    let ctx = ImportContext {
        config: &config,
        store,
        log,
        transport: library,
        tables: &tables,
        stop,
        progress: &NoProgress,
    };
    run_import(&ctx, args).await
}

async fn find(store: &InMemoryStore, property: &str, text: &str) -> Option<TargetRecord> {
    store
        .search(ResourceKind::Item, &PropertyQuery::eq(property, text))
        .await
        .unwrap()
        .into_iter()
        .next()
}

async fn document(store: &InMemoryStore, key: &str) -> Option<TargetRecord> {
    find(store, "dcterms:isReferencedBy", key).await
}

#[tokio::test]
async fn first_run_writes_documents_people_tags_and_annotations() {
    let store = InMemoryStore::new();
    let library = sample_library();
    let run_id = start_run(&store, 0).await;

    let report = import(&store, &store, &library, &args(run_id, 0), &StopFlag::new())
        .await
        .unwrap();
    assert_eq!(report.state, RunState::Completed);
    assert_eq!(report.changed, 3);
    assert_eq!(report.version, 10);
    assert_eq!(store.get_run(run_id).await.unwrap().unwrap().version, 10);
    assert_eq!(report.documents.created, 1);
    assert_eq!(report.notes.created, 1);
    assert!(report.failures.is_empty());

    let doc = document(&store, "K1").await.unwrap();
    assert_eq!(doc.resource_class.as_deref(), Some("bibo:Book"));
    assert_eq!(doc.first_literal("dcterms:title"), Some("A Book"));

    let zoe = find(&store, "foaf:givenName", "Zoe Zed").await.unwrap();
    let acme = find(&store, "foaf:givenName", "ACME").await.unwrap();
    assert_eq!(
        doc.values["dcterms:creator"],
        vec![Value::Resource(zoe.id), Value::Resource(acme.id)]
    );

    let operator = find(&store, "foaf:accountName", "ada").await.unwrap();
    assert!(doc.has_value("cito:isCompiledBy", &Value::Resource(operator.id)));

    // The attachment has no record of its own; the note is promoted.
    assert!(document(&store, "A1").await.is_none());
    let note = document(&store, "N1").await.unwrap();
    assert_eq!(note.first_literal("dcterms:title"), Some("Note: N1"));
    assert_eq!(note.values["dcterms:isPartOf"], vec![Value::Resource(doc.id)]);

    let history = find(&store, "skos:prefLabel", "History").await.unwrap();
    let europe = find(&store, "skos:prefLabel", "Europe").await.unwrap();
    let century = find(&store, "skos:prefLabel", "1900s").await.unwrap();
    assert_eq!(history.resource_class.as_deref(), Some("skos:Concept"));
    assert_eq!(europe.values["skos:broader"], vec![Value::Resource(history.id)]);
    assert_eq!(century.values["skos:broader"], vec![Value::Resource(europe.id)]);
    assert_eq!(history.values["skos:narrower"], vec![Value::Resource(europe.id)]);
    assert_eq!(europe.values["skos:narrower"], vec![Value::Resource(century.id)]);
    assert!(!history.values.contains_key("skos:broader"));

    // One annotation per chain node, attributed to the operator.
    let annotations = store.records(ResourceKind::Annotation);
    assert_eq!(annotations.len(), 3);
    for annotation in &annotations {
        assert_eq!(
            annotation.values["dcterms:creator"],
            vec![Value::Resource(operator.id)]
        );
        assert_eq!(annotation.values["oa:hasSource"], vec![Value::Resource(doc.id)]);
    }
    let doc = document(&store, "K1").await.unwrap();
    assert_eq!(
        doc.values["skos:semanticRelation"],
        vec![
            Value::Resource(history.id),
            Value::Resource(europe.id),
            Value::Resource(century.id)
        ]
    );

    let links: HashMap<String, TargetId> = store
        .links_for_run(run_id)
        .await
        .unwrap()
        .into_iter()
        .map(|l| (l.source_key, l.record_id))
        .collect();
    assert_eq!(links["K1"], doc.id);
    assert_eq!(links["N1"], note.id);
    assert_eq!(links["History - Europe - 1900s"], century.id);
    let key = format!("doc:{}_actor:{}_tag:{}", doc.id, operator.id, history.id);
    assert!(links.contains_key(&key));
}

#[tokio::test]
async fn rerun_updates_instead_of_duplicating() {
    let store = InMemoryStore::new();
    let library = sample_library();
    let first = start_run(&store, 0).await;
    import(&store, &store, &library, &args(first, 0), &StopFlag::new())
        .await
        .unwrap();
    let items = store.count(ResourceKind::Item);

    let second = start_run(&store, 0).await;
    let report = import(&store, &store, &library, &args(second, 0), &StopFlag::new())
        .await
        .unwrap();
    assert_eq!(report.state, RunState::Completed);
    assert_eq!(report.documents.created, 0);
    assert_eq!(report.documents.updated, 1);
    assert_eq!(report.notes.created, 0);
    assert_eq!(report.annotations.created, 0);
    assert_eq!(report.annotations.updated, 3);
    assert_eq!(store.count(ResourceKind::Item), items);
    assert_eq!(store.count(ResourceKind::Annotation), 3);

    let doc = document(&store, "K1").await.unwrap();
    assert_eq!(doc.values["skos:semanticRelation"].len(), 3);
    assert_eq!(doc.values["dcterms:creator"].len(), 2);
}

#[tokio::test]
async fn cursor_limits_the_next_run_to_changed_records() {
    let store = InMemoryStore::new();
    let first = start_run(&store, 0).await;
    import(&store, &store, &sample_library(), &args(first, 0), &StopFlag::new())
        .await
        .unwrap();
    let since = store.latest_version(LIBRARY_URL).await.unwrap().unwrap();
    assert_eq!(since, 10);

    let unchanged = start_run(&store, since).await;
    let report = import(&store, &store, &sample_library(), &args(unchanged, since), &StopFlag::new())
        .await
        .unwrap();
    assert_eq!(report.changed, 0);
    assert_eq!(report.state, RunState::Completed);
    assert_eq!(report.version, 10);

    let edited = FakeLibrary::new(12)
        .record(11, book("K1", "A Book, Revised", "2021-03-01T10:00:00Z"))
        .tags("K1", json!([manual("History - Europe - 1900s")]));
    let next = start_run(&store, since).await;
    let report = import(&store, &store, &edited, &args(next, since), &StopFlag::new())
        .await
        .unwrap();
    assert_eq!(report.changed, 1);
    assert_eq!(report.version, 12);
    let doc = document(&store, "K1").await.unwrap();
    assert_eq!(doc.first_literal("dcterms:title"), Some("A Book, Revised"));
    assert_eq!(store.latest_version(LIBRARY_URL).await.unwrap(), Some(12));
}

#[tokio::test]
async fn records_outside_the_date_range_are_skipped() {
    let store = InMemoryStore::new();
    let library = FakeLibrary::new(3)
        .record(1, book("OLD", "Old Book", "2019-06-01T00:00:00Z"))
        .record(2, book("NEW", "New Book", "2022-06-01T00:00:00Z"));
    let run_id = start_run(&store, 0).await;
    let mut args = args(run_id, 0);
    args.added_after = Utc.with_ymd_and_hms(2021, 1, 1, 0, 0, 0).single();

    let report = import(&store, &store, &library, &args, &StopFlag::new())
        .await
        .unwrap();
    assert_eq!(report.fetched, 2);
    assert_eq!(report.out_of_range, 1);
    assert!(document(&store, "OLD").await.is_none());
    assert!(document(&store, "NEW").await.is_some());
}

#[tokio::test]
async fn transport_error_aborts_without_advancing_the_cursor() {
    let store = InMemoryStore::new();
    let mut library = sample_library();
    library.failing_tags = Some("K1".to_string());
    let run_id = start_run(&store, 0).await;

    let err = import(&store, &store, &library, &args(run_id, 0), &StopFlag::new())
        .await
        .unwrap_err();
    assert!(err.to_string().contains("500 Internal Server Error"), "{}", err);
    assert_eq!(store.get_run(run_id).await.unwrap().unwrap().version, 0);
    assert!(document(&store, "K1").await.is_none());
}

#[tokio::test]
async fn stop_keeps_the_cursor() {
    let store = InMemoryStore::new();
    let run_id = start_run(&store, 0).await;
    let stop = StopFlag::new();
    stop.stop();

    let report = import(&store, &store, &sample_library(), &args(run_id, 0), &stop)
        .await
        .unwrap();
    assert_eq!(report.state, RunState::Stopped);
    assert_eq!(report.version, 0);
    assert_eq!(store.get_run(run_id).await.unwrap().unwrap().version, 0);
    assert!(document(&store, "K1").await.is_none());
}

#[tokio::test]
async fn rejected_record_does_not_stop_its_batch() {
    let store = Rejecting {
        inner: InMemoryStore::new(),
        rejected: "Broken",
    };
    let library = FakeLibrary::new(2)
        .record(1, book("BAD", "Broken", "2021-01-01T00:00:00Z"))
        .record(2, book("GOOD", "Fine", "2021-01-02T00:00:00Z"));
    let run_id = start_run(&store.inner, 0).await;

    let report = import(&store, &store.inner, &library, &args(run_id, 0), &StopFlag::new())
        .await
        .unwrap();
    assert_eq!(report.state, RunState::Completed);
    assert_eq!(report.documents.created, 1);
    assert_eq!(report.documents.failed, 1);
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].key, "BAD");
    assert!(document(&store.inner, "GOOD").await.is_some());
    assert!(document(&store.inner, "BAD").await.is_none());
}

#[tokio::test]
async fn tags_are_attributed_to_creating_user_or_auto_tagger() {
    let store = InMemoryStore::new();
    let library = FakeLibrary::new(1)
        .record(
            1,
            json!({
                "key": "K1",
                "meta": {"createdByUser": {"id": 5, "username": "bob"}},
                "data": {"itemType": "journalArticle", "title": "Paper", "dateAdded": "2021-01-01T00:00:00Z"}
            }),
        )
        .tags(
            "K1",
            json!([manual("Physics"), {"tag": "Optics", "meta": {"type": 1}}]),
        );
    let run_id = start_run(&store, 0).await;
    import(&store, &store, &library, &args(run_id, 0), &StopFlag::new())
        .await
        .unwrap();

    let bob = find(&store, "foaf:accountName", "bob").await.unwrap();
    assert_eq!(bob.first_literal("schema:identifier"), Some("5"));
    let tagger = find(&store, "foaf:accountName", "Automatic tagger").await.unwrap();
    let physics = find(&store, "skos:prefLabel", "Physics").await.unwrap();
    let optics = find(&store, "skos:prefLabel", "Optics").await.unwrap();

    let by_target = |tag: TargetId| {
        store
            .records(ResourceKind::Annotation)
            .into_iter()
            .find(|a| match &a.values["oa:hasTarget"][0] {
                Value::Node(target) => target["rdf:value"] == vec![Value::Resource(tag)],
                _ => false,
            })
            .unwrap()
    };
    assert_eq!(
        by_target(physics.id).values["dcterms:creator"],
        vec![Value::Resource(bob.id)]
    );
    assert_eq!(
        by_target(optics.id).values["dcterms:creator"],
        vec![Value::Resource(tagger.id)]
    );

    let doc = document(&store, "K1").await.unwrap();
    let operator = find(&store, "foaf:accountName", "ada").await.unwrap();
    assert_eq!(
        doc.values["cito:isCompiledBy"],
        vec![Value::Resource(operator.id), Value::Resource(bob.id)]
    );
}

fn with_files(mut args: ImportArgs) -> ImportArgs {
    args.import_files = true;
    args.api_key = Some("secret".to_string());
    args
}

#[tokio::test]
async fn attachment_in_a_later_chunk_reaches_its_parent() {
    let store = InMemoryStore::new();
    let library = FakeLibrary::new(5)
        .record(1, book("P1", "Parent", "2021-01-01T00:00:00Z"))
        .books(2, "F", 49)
        .record(3, stored_file("A1", "P1", "2021-03-01T00:00:00Z"));
    let run_id = start_run(&store, 0).await;
    let args = with_files(args(run_id, 0));

    let report = import(&store, &store, &library, &args, &StopFlag::new())
        .await
        .unwrap();
    assert_eq!(report.state, RunState::Completed);
    assert_eq!(report.changed, 51);
    assert_eq!(library.record_fetches.load(Ordering::SeqCst), 2);
    assert_eq!(report.documents.created, 50);
    assert!(report.failures.is_empty());

    let parent = document(&store, "P1").await.unwrap();
    assert_eq!(parent.media.len(), 1);
    assert_eq!(parent.media[0].source, format!("{}/items/A1/file", LIBRARY_URL));
    assert_eq!(
        parent.media[0].ingest_url,
        format!("{}/items/A1/file?key=secret", LIBRARY_URL)
    );
    assert!(document(&store, "A1").await.is_none());
}

#[tokio::test]
async fn attachment_before_its_parent_waits_for_it() {
    let store = InMemoryStore::new();
    let library = FakeLibrary::new(5)
        .record(1, stored_file("A1", "P1", "2021-01-01T00:00:00Z"))
        .books(2, "F", 49)
        .record(3, book("P1", "Parent", "2021-03-01T00:00:00Z"));
    let run_id = start_run(&store, 0).await;

    let report = import(&store, &store, &library, &with_files(args(run_id, 0)), &StopFlag::new())
        .await
        .unwrap();
    assert_eq!(report.state, RunState::Completed);
    let parent = document(&store, "P1").await.unwrap();
    assert_eq!(parent.media.len(), 1);
    assert_eq!(parent.media[0].title.as_deref(), Some("Scan"));
}

#[tokio::test]
async fn replaying_a_run_keeps_one_link_per_key() {
    let store = InMemoryStore::new();
    let library = FakeLibrary::new(5)
        .record(1, book("P1", "Parent", "2021-01-01T00:00:00Z"))
        .books(2, "F", 49)
        .record(3, stored_file("A1", "P1", "2021-03-01T00:00:00Z"))
        .tags("P1", json!([manual("History - Europe")]));
    let run_id = start_run(&store, 0).await;
    let args = with_files(args(run_id, 0));

    import(&store, &store, &library, &args, &StopFlag::new())
        .await
        .unwrap();
    let links = store.links_for_run(run_id).await.unwrap().len();
    let items = store.count(ResourceKind::Item);
    assert!(links >= 52);

    let report = import(&store, &store, &library, &args, &StopFlag::new())
        .await
        .unwrap();
    assert_eq!(report.state, RunState::Completed);
    assert_eq!(report.documents.created, 0);
    assert_eq!(store.links_for_run(run_id).await.unwrap().len(), links);
    assert_eq!(store.count(ResourceKind::Item), items);
    assert_eq!(document(&store, "P1").await.unwrap().media.len(), 1);
}

#[tokio::test]
async fn stop_between_chunks_keeps_earlier_writes_and_the_cursor() {
    let store = InMemoryStore::new();
    let stop = StopFlag::new();
    let mut library = FakeLibrary::new(9).books(1, "B", 60);
    library.stop_on_fetch = Some((2, stop.clone()));
    let run_id = start_run(&store, 0).await;

    let report = import(&store, &store, &library, &args(run_id, 0), &stop)
        .await
        .unwrap();
    assert_eq!(report.state, RunState::Stopped);
    assert_eq!(report.fetched, 60);
    assert_eq!(report.documents.created, 50);
    assert_eq!(report.version, 0);
    assert_eq!(store.get_run(run_id).await.unwrap().unwrap().version, 0);
    assert!(document(&store, "B00").await.is_some());
    assert!(document(&store, "B49").await.is_some());
    assert!(document(&store, "B50").await.is_none());
    assert!(document(&store, "B59").await.is_none());
}
