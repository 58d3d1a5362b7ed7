//! Actor dedup.
//!
//! Two kinds of actors are written:
//!
//! - **accounts** (the run's operator, each record's creating user and the
//!   synthetic automatic tagger), deduplicated on `foaf:accountName`;
//! - **persons** (bibliographic creators), deduplicated on
//!   `foaf:givenName` holding the composed display name.
//!
//! Resolved ids are cached for the lifetime of one run so each name costs
//! at most one lookup and one write.

use std::collections::HashMap;

use anyhow::Result;

use crate::mapping::first_live;
use crate::models::{Creator, Draft, RecordRef, ResourceKind, SourceRecord, TargetId, Value};
use crate::schema::Schema;
use crate::store::UpdateOptions;
use crate::upsert::{Stage, Upserter};

/// Dedup property for account actors.
pub const ACCOUNT_KEY: &str = "foaf:accountName";
/// Dedup property for creator persons.
pub const PERSON_KEY: &str = "foaf:givenName";

fn actor_classes() -> Vec<String> {
    vec!["jdc:Actant".to_string(), "foaf:Agent".to_string()]
}

const PERSON_CLASS: &str = "foaf:Person";

fn push_live(draft: &mut Draft, schema: &Schema, term: &str, value: Value) {
    if schema.has_property(term) {
        draft.push(term, value);
    }
}

pub struct ActorDirectory<'a> {
    schema: &'a Schema,
    account_label: String,
    accounts: HashMap<String, RecordRef>,
    persons: HashMap<String, TargetId>,
}

impl<'a> ActorDirectory<'a> {
    pub fn new(schema: &'a Schema, account_label: &str) -> Self {
        Self {
            schema,
            account_label: account_label.to_string(),
            accounts: HashMap::new(),
            persons: HashMap::new(),
        }
    }

    /// Draft for an account actor.
    pub fn account_draft(&self, name: &str, identifier: Option<&str>) -> Draft {
        let class = first_live(&actor_classes(), |c| self.schema.has_class(c)).map(str::to_string);
        let mut draft = Draft::with_class(class);
        draft.push(ACCOUNT_KEY, Value::literal(name));
        push_live(
            &mut draft,
            self.schema,
            "foaf:account",
            Value::literal(self.account_label.as_str()),
        );
        if let Some(id) = identifier {
            push_live(&mut draft, self.schema, "schema:identifier", Value::literal(id));
        }
        draft
    }

    /// Draft for a creator person, or `None` when the creator has no name.
    pub fn person_draft(&self, creator: &Creator) -> Option<Draft> {
        let name = creator.display_name()?;
        let class = self
            .schema
            .has_class(PERSON_CLASS)
            .then(|| PERSON_CLASS.to_string());
        let mut draft = Draft::with_class(class);
        push_live(&mut draft, self.schema, "dcterms:title", Value::literal(name.as_str()));
        draft.push(PERSON_KEY, Value::literal(name.as_str()));
        for (term, part) in [
            ("foaf:firstName", &creator.first_name),
            ("foaf:lastName", &creator.last_name),
        ] {
            if let Some(part) = part.as_deref().map(str::trim).filter(|p| !p.is_empty()) {
                push_live(&mut draft, self.schema, term, Value::literal(part));
            }
        }
        Some(draft)
    }

    /// Resolve (creating or refreshing once per run) the account actor `name`.
    pub async fn account(
        &mut self,
        up: &Upserter<'_>,
        name: &str,
        identifier: Option<&str>,
    ) -> Result<Option<RecordRef>> {
        if let Some(found) = self.accounts.get(name) {
            return Ok(Some(found.clone()));
        }
        let draft = self.account_draft(name, identifier);
        let outcome = up
            .upsert(
                Stage::Actor,
                ResourceKind::Item,
                ACCOUNT_KEY,
                name,
                &draft,
                UpdateOptions::REPLACE,
                None,
            )
            .await?;
        Ok(outcome.map(|o| {
            let actor = RecordRef {
                id: o.id(),
                title: name.to_string(),
            };
            self.accounts.insert(name.to_string(), actor.clone());
            actor
        }))
    }

    /// Resolve the person for one creator.
    pub async fn person(&mut self, up: &Upserter<'_>, creator: &Creator) -> Result<Option<TargetId>> {
        let Some(name) = creator.display_name() else {
            return Ok(None);
        };
        if let Some(id) = self.persons.get(&name) {
            return Ok(Some(*id));
        }
        let Some(draft) = self.person_draft(creator) else {
            return Ok(None);
        };
        let outcome = up
            .upsert(
                Stage::Person,
                ResourceKind::Item,
                PERSON_KEY,
                &name,
                &draft,
                UpdateOptions::REPLACE,
                None,
            )
            .await?;
        Ok(outcome.map(|o| {
            self.persons.insert(name, o.id());
            o.id()
        }))
    }

    /// Resolve every creator of every record, in record then creator order.
    pub async fn persons_for(&mut self, up: &Upserter<'_>, records: &[SourceRecord]) -> Result<()> {
        for record in records {
            for creator in &record.data.creators {
                self.person(up, creator).await?;
            }
        }
        Ok(())
    }

    /// Display name to person id, for the record mapper.
    pub fn persons(&self) -> &HashMap<String, TargetId> {
        &self.persons
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::default_vocabularies;
    use crate::store::memory::InMemoryStore;
    use crate::store::TargetStore;
    use crate::vocab::builtin_vocabularies;

    fn schema() -> Schema {
        Schema::from_vocabularies(&builtin_vocabularies(), &default_vocabularies())
    }

    #[test]
    fn account_draft_prefers_actant_class() {
        let schema = schema();
        let dir = ActorDirectory::new(&schema, "Zotero");
        let draft = dir.account_draft("ada", Some("17"));
        assert_eq!(draft.resource_class.as_deref(), Some("jdc:Actant"));
        assert_eq!(draft.first_literal(ACCOUNT_KEY), Some("ada"));
        assert_eq!(draft.first_literal("foaf:account"), Some("Zotero"));
        assert_eq!(draft.first_literal("schema:identifier"), Some("17"));
    }

    #[tokio::test]
    async fn same_name_resolves_to_same_actor_across_directories() {
        let store = InMemoryStore::new();
        let schema = schema();
        let up = Upserter::new(&store, &store, 1);

        let mut first = ActorDirectory::new(&schema, "Zotero");
        let a = first.account(&up, "ada", None).await.unwrap().unwrap();
        let again = first.account(&up, "ada", None).await.unwrap().unwrap();
        assert_eq!(a, again);

        let mut second = ActorDirectory::new(&schema, "Zotero");
        let b = second.account(&up, "ada", None).await.unwrap().unwrap();
        assert_eq!(a.id, b.id);
        assert_eq!(store.count(ResourceKind::Item), 1);
    }

    #[tokio::test]
    async fn persons_dedup_by_display_name() {
        let store = InMemoryStore::new();
        let schema = schema();
        let up = Upserter::new(&store, &store, 1);
        let mut dir = ActorDirectory::new(&schema, "Zotero");
        let creator = Creator {
            creator_type: "author".into(),
            first_name: Some("Ada".into()),
            last_name: Some("Lovelace".into()),
            ..Default::default()
        };
        let id = dir.person(&up, &creator).await.unwrap().unwrap();
        let mut other = ActorDirectory::new(&schema, "Zotero");
        assert_eq!(other.person(&up, &creator).await.unwrap(), Some(id));

        let rec = store.read(ResourceKind::Item, id).await.unwrap().unwrap();
        assert_eq!(rec.resource_class.as_deref(), Some("foaf:Person"));
        assert_eq!(rec.first_literal("foaf:lastName"), Some("Lovelace"));
        assert_eq!(rec.first_literal(PERSON_KEY), Some("Ada Lovelace"));
        assert_eq!(rec.values[PERSON_KEY].len(), 1);
    }
}
