//! Core data models used throughout refsync.
//!
//! Two families of types live here: the wire shapes returned by the
//! reference-management API ([`SourceRecord`] and friends) and the shapes
//! written to the target store ([`Draft`], [`TargetRecord`], [`Value`]),
//! plus the bookkeeping rows that tie an import run to what it wrote.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identifier assigned by the target store.
pub type TargetId = i64;

// ═══════════════════════════════════════════════════════════════════════
// Source side
// ═══════════════════════════════════════════════════════════════════════

/// One document, note, or attachment as returned by the items endpoint.
///
/// Only the parts the engine needs are deserialized; `library`, `version`,
/// and the `self`/`alternate` links are dropped at parse time.
#[derive(Debug, Clone, Deserialize)]
pub struct SourceRecord {
    pub key: String,
    #[serde(default)]
    pub links: RecordLinks,
    #[serde(default)]
    pub meta: RecordMeta,
    pub data: RecordData,
}

impl SourceRecord {
    pub fn item_type(&self) -> &str {
        &self.data.item_type
    }

    pub fn is_note(&self) -> bool {
        self.data.item_type == "note"
    }

    pub fn is_attachment(&self) -> bool {
        self.data.item_type == "attachment"
    }

    pub fn parent_key(&self) -> Option<&str> {
        self.data.parent_item.as_deref().filter(|k| !k.is_empty())
    }

    pub fn title(&self) -> Option<&str> {
        self.data
            .fields
            .get("title")
            .and_then(|v| v.as_str())
            .filter(|t| !t.is_empty())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordData {
    pub item_type: String,
    #[serde(default)]
    pub date_added: Option<DateTime<Utc>>,
    #[serde(default)]
    pub parent_item: Option<String>,
    #[serde(default)]
    pub creators: Vec<Creator>,
    /// Every remaining field, in server order.
    #[serde(flatten)]
    pub fields: serde_json::Map<String, serde_json::Value>,
}

/// A creator entry: either a single `name` or a `firstName`/`lastName` pair.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Creator {
    pub creator_type: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub last_name: Option<String>,
}

impl Creator {
    /// The single `name` when set, else first and last name joined by a
    /// space. `None` when all are empty.
    pub fn display_name(&self) -> Option<String> {
        let trimmed = |p: &Option<String>| {
            p.as_deref()
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
        };
        if let Some(name) = trimmed(&self.name) {
            return Some(name);
        }
        let parts: Vec<String> = [&self.first_name, &self.last_name]
            .into_iter()
            .filter_map(trimmed)
            .collect();
        if parts.is_empty() {
            None
        } else {
            Some(parts.join(" "))
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RecordLinks {
    /// Present on stored-file attachments when the request carried a credential.
    #[serde(default)]
    pub enclosure: Option<Link>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Link {
    pub href: String,
    #[serde(default, rename = "type")]
    pub media_type: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordMeta {
    #[serde(default)]
    pub created_by_user: Option<SourceUser>,
}

/// The library member who added a record (group libraries only).
#[derive(Debug, Clone, Deserialize)]
pub struct SourceUser {
    pub id: i64,
    pub username: String,
}

/// One entry of the per-item tag listing.
#[derive(Debug, Clone, Deserialize)]
pub struct ItemTag {
    pub tag: String,
    #[serde(default)]
    pub meta: ItemTagMeta,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ItemTagMeta {
    #[serde(default, rename = "type")]
    pub kind: u8,
}

impl ItemTag {
    pub fn origin(&self) -> TagOrigin {
        if self.meta.kind == 0 {
            TagOrigin::Manual
        } else {
            TagOrigin::Automatic
        }
    }
}

/// Who applied a tag: a library member, or the server's automatic tagger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TagOrigin {
    Manual,
    Automatic,
}

// ═══════════════════════════════════════════════════════════════════════
// Target side
// ═══════════════════════════════════════════════════════════════════════

/// A value held by a property term.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Value {
    Literal(String),
    Uri(String),
    /// Reference to another record's id.
    Resource(TargetId),
    /// Anonymous nested node (annotation bodies and targets).
    Node(ValueMap),
}

impl Value {
    pub fn literal(text: impl Into<String>) -> Self {
        Value::Literal(text.into())
    }

    /// Text compared by equality searches. Nested nodes are not searchable.
    pub fn search_text(&self) -> Option<String> {
        match self {
            Value::Literal(s) | Value::Uri(s) => Some(s.clone()),
            Value::Resource(id) => Some(id.to_string()),
            Value::Node(_) => None,
        }
    }
}

/// Property term (`prefix:local`) to its ordered values.
pub type ValueMap = BTreeMap<String, Vec<Value>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Item,
    ItemSet,
    Annotation,
}

impl ResourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Item => "item",
            ResourceKind::ItemSet => "item_set",
            ResourceKind::Annotation => "annotation",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "item" => Some(ResourceKind::Item),
            "item_set" => Some(ResourceKind::ItemSet),
            "annotation" => Some(ResourceKind::Annotation),
            _ => None,
        }
    }
}

/// A file to be ingested alongside a document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Media {
    pub ingester: String,
    /// Public source URL (no credential).
    pub source: String,
    /// URL actually fetched by the ingester (may carry a credential).
    pub ingest_url: String,
    #[serde(default)]
    pub title: Option<String>,
}

/// A record to create, or the supplied part of a partial update.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Draft {
    #[serde(default)]
    pub resource_class: Option<String>,
    #[serde(default)]
    pub values: ValueMap,
    #[serde(default)]
    pub containers: Vec<TargetId>,
    #[serde(default)]
    pub media: Vec<Media>,
}

impl Draft {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_class(class: Option<String>) -> Self {
        Self {
            resource_class: class,
            ..Self::default()
        }
    }

    /// Append a value under `term`, keeping insertion order.
    pub fn push(&mut self, term: &str, value: Value) {
        self.values.entry(term.to_string()).or_default().push(value);
    }

    pub fn first_literal(&self, term: &str) -> Option<&str> {
        first_literal(&self.values, term)
    }

    pub fn has_value(&self, term: &str, value: &Value) -> bool {
        self.values
            .get(term)
            .map(|vs| vs.contains(value))
            .unwrap_or(false)
    }
}

/// A persisted record as read back from the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetRecord {
    pub id: TargetId,
    pub kind: ResourceKind,
    pub resource_class: Option<String>,
    pub values: ValueMap,
    pub containers: Vec<TargetId>,
    pub media: Vec<Media>,
}

impl TargetRecord {
    pub fn first_literal(&self, term: &str) -> Option<&str> {
        first_literal(&self.values, term)
    }

    pub fn has_value(&self, term: &str, value: &Value) -> bool {
        self.values
            .get(term)
            .map(|vs| vs.contains(value))
            .unwrap_or(false)
    }

    /// Human label: title, concept label, or account name, else `[#id]`.
    pub fn display_title(&self) -> String {
        ["dcterms:title", "skos:prefLabel", "foaf:accountName", "foaf:givenName"]
            .iter()
            .find_map(|term| self.first_literal(term))
            .map(str::to_string)
            .unwrap_or_else(|| format!("[#{}]", self.id))
    }
}

fn first_literal<'a>(values: &'a ValueMap, term: &str) -> Option<&'a str> {
    values.get(term)?.iter().find_map(|v| match v {
        Value::Literal(s) => Some(s.as_str()),
        _ => None,
    })
}

/// A store id plus the label used in annotation statements.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordRef {
    pub id: TargetId,
    pub title: String,
}

// ═══════════════════════════════════════════════════════════════════════
// Import bookkeeping
// ═══════════════════════════════════════════════════════════════════════

/// One synchronization execution.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ImportRun {
    pub id: i64,
    pub name: String,
    /// Library endpoint this run reads from.
    pub url: String,
    /// Last-Modified-Version watermark; advanced only on completion.
    pub version: i64,
    pub job_id: String,
    pub undo_job_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewImportRun {
    pub name: String,
    pub url: String,
    pub version: i64,
    pub job_id: String,
}

/// A run plus the number of records it is linked to ("past imports").
#[derive(Debug, Clone, Serialize)]
pub struct ImportRunSummary {
    #[serde(flatten)]
    pub run: ImportRun,
    pub link_count: i64,
}

/// Durable `{run, external key} -> target id` correspondence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImportedRecordLink {
    pub run_id: i64,
    pub source_key: String,
    pub record_id: TargetId,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn creator_display_name_joins_parts() {
        let c = Creator {
            creator_type: "author".into(),
            first_name: Some("Ada".into()),
            last_name: Some("Lovelace".into()),
            ..Default::default()
        };
        assert_eq!(c.display_name().as_deref(), Some("Ada Lovelace"));

        let single = Creator {
            creator_type: "author".into(),
            name: Some("ACME Corp".into()),
            ..Default::default()
        };
        assert_eq!(single.display_name().as_deref(), Some("ACME Corp"));

        let empty = Creator {
            creator_type: "author".into(),
            first_name: Some("  ".into()),
            ..Default::default()
        };
        assert_eq!(empty.display_name(), None);

        let both = Creator {
            creator_type: "editor".into(),
            name: Some("Royal Society".into()),
            first_name: Some("Ada".into()),
            last_name: Some("Lovelace".into()),
        };
        assert_eq!(both.display_name().as_deref(), Some("Royal Society"));

        let blank_name = Creator {
            creator_type: "author".into(),
            name: Some(" ".into()),
            last_name: Some("Lovelace".into()),
            ..Default::default()
        };
        assert_eq!(blank_name.display_name().as_deref(), Some("Lovelace"));
    }

    #[test]
    fn source_record_parses_wire_shape() {
        let raw = serde_json::json!({
            "key": "ABCD2345",
            "version": 12,
            "library": { "type": "user", "id": 1 },
            "links": {
                "self": { "href": "https://example/self" },
                "enclosure": { "href": "https://example/file", "type": "application/pdf" }
            },
            "meta": { "createdByUser": { "id": 7, "username": "ada" } },
            "data": {
                "key": "ABCD2345",
                "itemType": "attachment",
                "parentItem": "PARENT01",
                "title": "Scan",
                "dateAdded": "2021-03-04T05:06:07Z",
                "creators": [],
                "tags": [{ "tag": "x" }]
            }
        });
        let rec: SourceRecord = serde_json::from_value(raw).unwrap();
        assert!(rec.is_attachment());
        assert_eq!(rec.parent_key(), Some("PARENT01"));
        assert_eq!(rec.title(), Some("Scan"));
        assert_eq!(rec.meta.created_by_user.unwrap().username, "ada");
        assert_eq!(rec.links.enclosure.unwrap().href, "https://example/file");
        assert_eq!(rec.data.date_added.unwrap().timestamp(), 1614834367);
        assert!(rec.data.fields.contains_key("key"));
    }

    #[test]
    fn value_serializes_tagged() {
        let v = Value::Resource(42);
        let s = serde_json::to_string(&v).unwrap();
        assert_eq!(s, r#"{"type":"resource","value":42}"#);
        let back: Value = serde_json::from_str(&s).unwrap();
        assert_eq!(back, v);
    }

    #[test]
    fn item_tag_origin() {
        let manual: ItemTag = serde_json::from_str(r#"{"tag":"a","meta":{"type":0}}"#).unwrap();
        let auto: ItemTag = serde_json::from_str(r#"{"tag":"b","meta":{"type":1}}"#).unwrap();
        let bare: ItemTag = serde_json::from_str(r#"{"tag":"c"}"#).unwrap();
        assert_eq!(manual.origin(), TagOrigin::Manual);
        assert_eq!(auto.origin(), TagOrigin::Automatic);
        assert_eq!(bare.origin(), TagOrigin::Manual);
    }
}
