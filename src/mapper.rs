//! Record mapping: source records to target drafts.
//!
//! Pure transformation in stages, each resolving names through the
//! [`MappingTables`] against the run's [`Schema`]:
//!
//! 1. resource class from the item type;
//! 2. one literal (or URI, for `bibo:uri`) per populated scalar field;
//! 3. one resource reference per creator, pointing at an already-upserted
//!    person;
//! 4. a media entry per stored-file attachment when file import is enabled.
//!
//! [`partition`] splits a fetched chunk into top-level drafts (documents
//! and promoted notes) and attachment children grouped by parent key.
//! An attachment's parent may sit in another chunk; the caller carries
//! those over.

use std::collections::HashMap;

use tracing::trace;

use crate::mapping::MappingTables;
use crate::models::{Draft, Media, SourceRecord, TargetId, Value};
use crate::schema::Schema;
use crate::source::SourceUrl;

/// Property holding a document's external key.
pub const DOCUMENT_KEY: &str = "dcterms:isReferencedBy";

/// Scalar fields are emitted as URI values under this property.
const URI_PROPERTY: &str = "bibo:uri";

/// Credentialed access to attachment files.
pub struct FileImport<'a> {
    pub urls: &'a SourceUrl,
    pub api_key: &'a str,
}

pub struct Mapper<'a> {
    schema: &'a Schema,
    tables: &'a MappingTables,
}

impl<'a> Mapper<'a> {
    pub fn new(schema: &'a Schema, tables: &'a MappingTables) -> Self {
        Self { schema, tables }
    }

    pub fn resource_class(&self, record: &SourceRecord) -> Option<String> {
        self.tables
            .resolve_class(record.item_type(), self.schema)
            .map(str::to_string)
    }

    /// Append one value per populated scalar field, in server field order.
    pub fn map_values(&self, record: &SourceRecord, draft: &mut Draft) {
        for (field, raw) in &record.data.fields {
            let Some(text) = scalar_text(raw) else {
                continue;
            };
            let Some(term) = self.tables.resolve_field(field, self.schema) else {
                trace!(key = %record.key, field, "field dropped, no live property");
                continue;
            };
            let value = if term == URI_PROPERTY {
                Value::Uri(text)
            } else {
                Value::Literal(text)
            };
            draft.push(term, value);
        }
    }

    /// Append a reference per creator in the order given. `persons` maps a
    /// creator display name to its person record.
    pub fn map_creators(
        &self,
        record: &SourceRecord,
        draft: &mut Draft,
        persons: &HashMap<String, TargetId>,
    ) {
        for creator in &record.data.creators {
            let Some(term) = self.tables.resolve_creator(&creator.creator_type, self.schema) else {
                continue;
            };
            let Some(id) = creator.display_name().and_then(|name| persons.get(&name).copied())
            else {
                continue;
            };
            draft.push(term, Value::Resource(id));
        }
    }

    /// Media entry for `attachment`, when it has a downloadable enclosure.
    pub fn map_attachment(&self, attachment: &SourceRecord, files: &FileImport) -> Option<Media> {
        attachment.links.enclosure.as_ref()?;
        let params = [("key", files.api_key.to_string())];
        Some(Media {
            ingester: "url".to_string(),
            source: files.urls.item_file(&attachment.key, &[]),
            ingest_url: files.urls.item_file(&attachment.key, &params),
            title: attachment.title().map(str::to_string),
        })
    }

    /// Full draft for a top-level record: class, fields, creators, the
    /// external key, and media from its attachments.
    pub fn document(
        &self,
        record: &SourceRecord,
        attachments: &[SourceRecord],
        persons: &HashMap<String, TargetId>,
        files: Option<&FileImport>,
    ) -> Draft {
        let mut draft = Draft::with_class(self.resource_class(record));
        self.map_values(record, &mut draft);
        if record.is_note() && record.title().is_none() {
            if let Some(term) = self.tables.resolve_field("title", self.schema) {
                draft.push(term, Value::literal(note_title(&record.key)));
            }
        }
        self.map_creators(record, &mut draft, persons);

        let key = Value::literal(record.key.as_str());
        if !draft.has_value(DOCUMENT_KEY, &key) {
            draft.push(DOCUMENT_KEY, key);
        }

        if let Some(files) = files {
            draft.media.extend(
                attachments
                    .iter()
                    .filter_map(|a| self.map_attachment(a, files)),
            );
        }
        draft
    }
}

/// Synthetic title for an untitled note.
pub fn note_title(key: &str) -> String {
    format!("Note: {}", key)
}

/// Text of a scalar field, or `None` for empty, zero, false, null and
/// structured values.
pub fn scalar_text(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::String(s) if s.is_empty() || s == "0" => None,
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Number(n) if n.as_f64() == Some(0.0) => None,
        serde_json::Value::Number(n) => Some(n.to_string()),
        serde_json::Value::Bool(true) => Some("1".to_string()),
        _ => None,
    }
}

/// A fetched chunk split by parent relationship.
#[derive(Debug, Default)]
pub struct Partition {
    /// Records that get their own target record, in fetch order: top-level
    /// records plus notes promoted from children.
    pub parents: Vec<SourceRecord>,
    /// Attachment children by parent key.
    pub attachments: HashMap<String, Vec<SourceRecord>>,
    /// `(note key, parent key)` for every promoted child note.
    pub note_parents: Vec<(String, String)>,
}

pub fn partition(records: Vec<SourceRecord>) -> Partition {
    let mut out = Partition::default();
    for record in records {
        match record.parent_key().map(str::to_string) {
            Some(parent) if record.is_note() => {
                out.note_parents.push((record.key.clone(), parent));
                out.parents.push(record);
            }
            Some(parent) => out.attachments.entry(parent).or_default().push(record),
            None => out.parents.push(record),
        }
    }
    out
}
