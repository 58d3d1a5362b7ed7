//! Per-run cache of which classes and properties the target store knows.
//!
//! Built once at the start of a run from the store's vocabularies,
//! restricted to the namespaces named in `[vocabularies]`. Terms are keyed
//! by the prefix the store registered, which is what drafts must use.

use std::collections::{BTreeMap, HashSet};

use anyhow::{bail, Result};

use crate::vocab::Vocabulary;

#[derive(Debug, Clone, Default)]
pub struct Schema {
    classes: HashSet<String>,
    properties: HashSet<String>,
}

impl Schema {
    /// Build the cache from store vocabularies, keeping only those whose
    /// namespace URI appears in `namespaces` (prefix → namespace URI).
    pub fn from_vocabularies(
        vocabularies: &[Vocabulary],
        namespaces: &BTreeMap<String, String>,
    ) -> Self {
        let mut schema = Schema::default();
        for vocab in vocabularies {
            if !namespaces.values().any(|uri| uri == &vocab.namespace_uri) {
                continue;
            }
            for class in &vocab.classes {
                schema.classes.insert(format!("{}:{}", vocab.prefix, class));
            }
            for property in &vocab.properties {
                schema
                    .properties
                    .insert(format!("{}:{}", vocab.prefix, property));
            }
        }
        schema
    }

    pub fn has_class(&self, term: &str) -> bool {
        self.classes.contains(term)
    }

    pub fn has_property(&self, term: &str) -> bool {
        self.properties.contains(term)
    }

    /// Fail unless every term is a live property.
    pub fn require_properties(&self, terms: &[&str]) -> Result<()> {
        let missing: Vec<&str> = terms
            .iter()
            .copied()
            .filter(|t| !self.has_property(t))
            .collect();
        if !missing.is_empty() {
            bail!(
                "Target store schema is missing required properties: {}",
                missing.join(", ")
            );
        }
        Ok(())
    }

    pub fn class_count(&self) -> usize {
        self.classes.len()
    }

    pub fn property_count(&self) -> usize {
        self.properties.len()
    }
}
