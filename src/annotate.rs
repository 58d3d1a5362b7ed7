//! Tagging annotations.
//!
//! While tag listings are fetched, a [`TagLedger`] records who applied
//! which label to which record. Once documents and taxonomy nodes have ids,
//! every `(actor, document, concept)` triple becomes one annotation record,
//! deduplicated on the composite key `doc:<id>_actor:<id>_tag:<id>`, and
//! the document gains a `skos:semanticRelation` to the concept.

use std::collections::HashMap;

use anyhow::Result;

use crate::models::{Draft, RecordRef, ResourceKind, TagOrigin, Value, ValueMap};
use crate::schema::Schema;
use crate::store::UpdateOptions;
use crate::upsert::{KeyTable, Outcome, Stage, Upserter};

/// Dedup property for annotations.
pub const ANNOTATION_KEY: &str = "dcterms:isReferencedBy";

const ANNOTATION_CLASS: &str = "oa:Annotation";
const SEMANTIC_RELATION: &str = "skos:semanticRelation";

/// Stable identity of one tagging triple.
pub fn composite_key(document: i64, actor: i64, tag: i64) -> String {
    format!("doc:{}_actor:{}_tag:{}", document, actor, tag)
}

#[derive(Debug, Clone)]
pub struct TagEntry {
    /// Origin of the first application seen.
    pub origin: TagOrigin,
    /// Attributing actor to the record keys it tagged, in first-seen order.
    pub taggings: Vec<(RecordRef, Vec<String>)>,
}

/// Label to who tagged what, in first-seen label order.
#[derive(Debug, Default)]
pub struct TagLedger {
    order: Vec<String>,
    entries: HashMap<String, TagEntry>,
}

impl TagLedger {
    pub fn record(&mut self, label: &str, origin: TagOrigin, actor: &RecordRef, item_key: &str) {
        let entry = self.entries.entry(label.to_string()).or_insert_with(|| {
            self.order.push(label.to_string());
            TagEntry {
                origin,
                taggings: Vec::new(),
            }
        });
        let keys = match entry.taggings.iter_mut().position(|(a, _)| a.id == actor.id) {
            Some(i) => &mut entry.taggings[i].1,
            None => {
                entry.taggings.push((actor.clone(), Vec::new()));
                let last = entry.taggings.len() - 1;
                &mut entry.taggings[last].1
            }
        };
        if !keys.iter().any(|k| k == item_key) {
            keys.push(item_key.to_string());
        }
    }

    pub fn labels(&self) -> impl Iterator<Item = &str> {
        self.order.iter().map(String::as_str)
    }

    pub fn get(&self, label: &str) -> Option<&TagEntry> {
        self.entries.get(label)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

pub struct Annotator<'a> {
    schema: &'a Schema,
}

impl<'a> Annotator<'a> {
    pub fn new(schema: &'a Schema) -> Self {
        Self { schema }
    }

    pub fn draft(&self, actor: &RecordRef, document: &RecordRef, tag: &RecordRef) -> Draft {
        let class = self
            .schema
            .has_class(ANNOTATION_CLASS)
            .then(|| ANNOTATION_CLASS.to_string());
        let mut draft = Draft::with_class(class);
        draft.push(
            ANNOTATION_KEY,
            Value::literal(composite_key(document.id, actor.id, tag.id)),
        );
        draft.push("oa:motivatedBy", Value::literal("tagging"));
        draft.push("dcterms:creator", Value::Resource(actor.id));
        draft.push("oa:hasSource", Value::Resource(document.id));

        let mut body = ValueMap::new();
        body.insert(
            "rdf:value".to_string(),
            vec![Value::literal(format!(
                "{} tagged {} with {}",
                actor.title, document.title, tag.title
            ))],
        );
        body.insert(
            "oa:hasPurpose".to_string(),
            vec![Value::literal("classifying")],
        );
        draft.push("oa:hasBody", Value::Node(body));

        let mut target = ValueMap::new();
        target.insert("rdf:value".to_string(), vec![Value::Resource(tag.id)]);
        target.insert("rdf:type".to_string(), vec![Value::literal("o:Item")]);
        draft.push("oa:hasTarget", Value::Node(target));
        draft
    }

    /// Upsert the annotation for one triple, then relate the document to
    /// the concept.
    pub async fn annotate(
        &self,
        up: &Upserter<'_>,
        actor: &RecordRef,
        document: &RecordRef,
        tag: &RecordRef,
    ) -> Result<Option<Outcome>> {
        let key = composite_key(document.id, actor.id, tag.id);
        let draft = self.draft(actor, document, tag);
        let outcome = up
            .upsert(
                Stage::Annotation,
                ResourceKind::Annotation,
                ANNOTATION_KEY,
                &key,
                &draft,
                UpdateOptions::REPLACE,
                Some(&key),
            )
            .await?;
        if outcome.is_some() {
            up.append_unique(
                Stage::Document,
                ResourceKind::Item,
                document.id,
                SEMANTIC_RELATION,
                Value::Resource(tag.id),
            )
            .await?;
        }
        Ok(outcome)
    }

    /// Annotate every tagging of one label against every node of its chain.
    /// Record keys without an assigned document are skipped.
    pub async fn annotate_label(
        &self,
        up: &Upserter<'_>,
        entry: &TagEntry,
        chain: &[RecordRef],
        documents: &KeyTable,
    ) -> Result<usize> {
        let mut written = 0;
        for (actor, keys) in &entry.taggings {
            for key in keys {
                let Some(document) = documents.get(key) else {
                    continue;
                };
                for node in chain {
                    if self.annotate(up, actor, document, node).await?.is_some() {
                        written += 1;
                    }
                }
            }
        }
        Ok(written)
    }
}
