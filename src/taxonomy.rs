//! Tag taxonomy construction.
//!
//! A compound label such as `History - Europe - 1900s` becomes a chain of
//! concept records, one per segment, deduplicated on `skos:prefLabel`.
//! Each node after the first gets `skos:broader` pointing at its
//! predecessor, and the predecessor gets `skos:narrower` pointing back.
//! Links are only appended when missing, so replaying a label is a no-op.

use std::collections::HashMap;

use anyhow::Result;
use tracing::debug;

use crate::models::{Draft, RecordRef, ResourceKind, Value};
use crate::schema::Schema;
use crate::upsert::{Stage, Upserter};

/// Dedup property for tag concepts.
pub const TAG_KEY: &str = "skos:prefLabel";

const CONCEPT_CLASS: &str = "skos:Concept";
const BROADER: &str = "skos:broader";
const NARROWER: &str = "skos:narrower";

/// Split a compound label into trimmed, non-empty segments.
pub fn split_label<'a>(label: &'a str, delimiter: &str) -> Vec<&'a str> {
    label
        .split(delimiter)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect()
}

pub struct Taxonomy<'a> {
    schema: &'a Schema,
    delimiter: String,
    chains: HashMap<String, Vec<RecordRef>>,
}

impl<'a> Taxonomy<'a> {
    pub fn new(schema: &'a Schema, delimiter: &str) -> Self {
        Self {
            schema,
            delimiter: delimiter.to_string(),
            chains: HashMap::new(),
        }
    }

    pub fn concept_draft(&self, label: &str, broader: Option<&RecordRef>) -> Draft {
        let class = self
            .schema
            .has_class(CONCEPT_CLASS)
            .then(|| CONCEPT_CLASS.to_string());
        let mut draft = Draft::with_class(class);
        if self.schema.has_property("dcterms:title") {
            draft.push("dcterms:title", Value::literal(label));
        }
        draft.push(TAG_KEY, Value::literal(label));
        if let Some(parent) = broader {
            draft.push(BROADER, Value::Resource(parent.id));
        }
        draft
    }

    /// The chain of concept nodes for `label`, root first.
    ///
    /// When a segment cannot be written the chain stops there. The full
    /// label is linked to the last node of the chain.
    pub async fn chain(&mut self, up: &Upserter<'_>, label: &str) -> Result<Vec<RecordRef>> {
        if let Some(chain) = self.chains.get(label) {
            return Ok(chain.clone());
        }

        let mut chain: Vec<RecordRef> = Vec::new();
        for segment in split_label(label, &self.delimiter) {
            // A repeated segment would link a node under its own descendant.
            if chain.iter().any(|node| node.title == segment) {
                continue;
            }
            let prev = chain.last().cloned();
            let node = match up.find(ResourceKind::Item, TAG_KEY, segment).await? {
                Some(existing) => {
                    let node = RecordRef {
                        id: existing.id,
                        title: segment.to_string(),
                    };
                    if let Some(prev) = prev.as_ref().filter(|p| p.id != node.id) {
                        up.append_unique(
                            Stage::Tag,
                            ResourceKind::Item,
                            node.id,
                            BROADER,
                            Value::Resource(prev.id),
                        )
                        .await?;
                        up.append_unique(
                            Stage::Tag,
                            ResourceKind::Item,
                            prev.id,
                            NARROWER,
                            Value::Resource(node.id),
                        )
                        .await?;
                    }
                    node
                }
                None => {
                    let draft = self.concept_draft(segment, prev.as_ref());
                    let Some(id) = up.create(Stage::Tag, ResourceKind::Item, segment, &draft).await
                    else {
                        break;
                    };
                    if let Some(prev) = &prev {
                        up.append_unique(
                            Stage::Tag,
                            ResourceKind::Item,
                            prev.id,
                            NARROWER,
                            Value::Resource(id),
                        )
                        .await?;
                    }
                    RecordRef {
                        id,
                        title: segment.to_string(),
                    }
                }
            };
            chain.push(node);
        }

        if let Some(last) = chain.last() {
            up.link(label, last.id).await;
        }
        debug!(label, nodes = chain.len(), "taxonomy chain resolved");
        self.chains.insert(label.to_string(), chain.clone());
        Ok(chain)
    }
}
