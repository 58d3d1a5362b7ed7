//! Priority mapping tables.
//!
//! Each table maps a source vocabulary name (item type, field, creator
//! role) to an ordered list of candidate target terms. Resolution walks
//! the list and returns the first candidate the store's schema knows;
//! when none is live the name is dropped. The mapping is not one-to-one,
//! so some data is lost on purpose and has to be mapped by hand later.
//!
//! Built-in tables can be overridden per entry from a TOML file:
//!
//! ```toml
//! [item_types]
//! webpage = ["bibo:Webpage", "dctype:Text"]
//!
//! [fields]
//! extra = ["dcterms:description"]
//!
//! [creators]
//! castMember = []        # never mapped
//! ```

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::schema::Schema;

/// Ordered candidate terms per source name.
pub type PriorityMap = BTreeMap<String, Vec<String>>;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct MappingTables {
    #[serde(default)]
    pub item_types: PriorityMap,
    #[serde(default)]
    pub fields: PriorityMap,
    #[serde(default)]
    pub creators: PriorityMap,
}

/// Return the first candidate accepted by `is_live`.
pub fn first_live<'a>(candidates: &'a [String], is_live: impl Fn(&str) -> bool) -> Option<&'a str> {
    candidates
        .iter()
        .map(String::as_str)
        .find(|term| is_live(term))
}

impl MappingTables {
    pub fn resolve_class(&self, item_type: &str, schema: &Schema) -> Option<&str> {
        first_live(self.item_types.get(item_type)?, |t| schema.has_class(t))
    }

    pub fn resolve_field(&self, field: &str, schema: &Schema) -> Option<&str> {
        first_live(self.fields.get(field)?, |t| schema.has_property(t))
    }

    pub fn resolve_creator(&self, role: &str, schema: &Schema) -> Option<&str> {
        first_live(self.creators.get(role)?, |t| schema.has_property(t))
    }

    /// Built-in tables, optionally overridden entry-by-entry from `path`.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut tables = Self::builtin();
        if let Some(path) = path {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read mapping file: {}", path.display()))?;
            let overrides: MappingTables = toml::from_str(&content)
                .with_context(|| format!("Failed to parse mapping file: {}", path.display()))?;
            overrides.validate()?;
            tables.item_types.extend(overrides.item_types);
            tables.fields.extend(overrides.fields);
            tables.creators.extend(overrides.creators);
        }
        Ok(tables)
    }

    fn validate(&self) -> Result<()> {
        for (table, map) in [
            ("item_types", &self.item_types),
            ("fields", &self.fields),
            ("creators", &self.creators),
        ] {
            for (name, terms) in map {
                for term in terms {
                    match term.split_once(':') {
                        Some((prefix, local)) if !prefix.is_empty() && !local.is_empty() => {}
                        _ => bail!(
                            "mapping {}.{}: '{}' is not a prefix:local term",
                            table,
                            name,
                            term
                        ),
                    }
                }
            }
        }
        Ok(())
    }

    pub fn builtin() -> Self {
        Self {
            item_types: table(ITEM_TYPES),
            fields: table(FIELDS),
            creators: table(CREATORS),
        }
    }
}

fn table(rows: &[(&str, &[&str])]) -> PriorityMap {
    rows.iter()
        .map(|(name, terms)| {
            (
                name.to_string(),
                terms.iter().map(|t| t.to_string()).collect(),
            )
        })
        .collect()
}

const ITEM_TYPES: &[(&str, &[&str])] = &[
    ("artwork", &["dctype:Image"]),
    ("attachment", &[]),
    ("audioRecording", &["bibo:AudioDocument", "dctype:Sound"]),
    ("bill", &["bibo:Bill"]),
    ("blogPost", &["bibo:Article"]),
    ("book", &["bibo:Book"]),
    ("bookSection", &["bibo:BookSection"]),
    ("case", &["bibo:LegalCaseDocument"]),
    ("computerProgram", &["dctype:Software"]),
    ("conferencePaper", &["bibo:Article"]),
    ("dictionaryEntry", &["bibo:Article"]),
    ("document", &["bibo:Document"]),
    ("email", &["bibo:Email"]),
    ("encyclopediaArticle", &["bibo:Article"]),
    ("film", &["bibo:Film", "dctype:MovingImage"]),
    ("forumPost", &["bibo:Article"]),
    ("hearing", &["bibo:Hearing"]),
    ("instantMessage", &["bibo:PersonalCommunication"]),
    ("interview", &["bibo:Interview"]),
    ("journalArticle", &["bibo:AcademicArticle", "bibo:Article"]),
    ("letter", &["bibo:Letter"]),
    ("magazineArticle", &["bibo:Article"]),
    ("manuscript", &["bibo:Manuscript"]),
    ("map", &["bibo:Map"]),
    ("newspaperArticle", &["bibo:Article"]),
    ("note", &["bibo:Note"]),
    ("patent", &["bibo:Patent"]),
    ("podcast", &["bibo:AudioDocument", "dctype:Sound"]),
    ("presentation", &["bibo:Slideshow"]),
    ("radioBroadcast", &["bibo:AudioDocument", "dctype:Sound"]),
    ("report", &["bibo:Report"]),
    ("statute", &["bibo:Statute"]),
    ("thesis", &["bibo:Thesis"]),
    ("tvBroadcast", &["bibo:AudioVisualDocument", "dctype:MovingImage"]),
    ("videoRecording", &["bibo:AudioVisualDocument", "dctype:MovingImage"]),
    ("webpage", &["bibo:Webpage", "dctype:Text"]),
];

const FIELDS: &[(&str, &[&str])] = &[
    ("key", &["dcterms:isReferencedBy"]),
    ("title", &["dcterms:title"]),
    ("abstractNote", &["dcterms:abstract", "dcterms:description"]),
    ("accessDate", &[]),
    ("artworkMedium", &["dcterms:medium"]),
    ("audioRecordingFormat", &["dcterms:medium"]),
    ("billNumber", &["bibo:number"]),
    ("blogTitle", &["dcterms:isPartOf"]),
    ("bookTitle", &["dcterms:isPartOf"]),
    ("callNumber", &["bibo:locator"]),
    ("caseName", &["dcterms:title"]),
    ("code", &["dcterms:isPartOf"]),
    ("conferenceName", &["bibo:presentedAt"]),
    ("contentType", &["dcterms:format"]),
    ("court", &["bibo:court"]),
    ("date", &["dcterms:date"]),
    ("dateDecided", &["dcterms:date"]),
    ("dateEnacted", &["dcterms:date"]),
    ("dictionaryTitle", &["dcterms:isPartOf"]),
    ("DOI", &["bibo:doi"]),
    ("edition", &["bibo:edition"]),
    ("encyclopediaTitle", &["dcterms:isPartOf"]),
    ("extra", &["dcterms:description"]),
    ("forumTitle", &["dcterms:isPartOf"]),
    ("interviewMedium", &["dcterms:medium"]),
    ("ISBN", &["bibo:isbn"]),
    ("ISSN", &["bibo:issn"]),
    ("issue", &["bibo:issue"]),
    ("language", &["dcterms:language"]),
    ("letterType", &["dcterms:type"]),
    ("manuscriptType", &["dcterms:type"]),
    ("mapType", &["dcterms:type"]),
    ("nameOfAct", &["dcterms:title"]),
    ("note", &["bibo:content"]),
    ("number", &["bibo:number"]),
    ("numberOfVolumes", &["bibo:numVolumes"]),
    ("numPages", &["bibo:numPages"]),
    ("pages", &["bibo:pages"]),
    ("patentNumber", &["bibo:number"]),
    ("place", &["dcterms:spatial"]),
    ("programTitle", &["dcterms:isPartOf"]),
    ("proceedingsTitle", &["dcterms:isPartOf"]),
    ("publicationTitle", &["dcterms:isPartOf"]),
    ("publisher", &["dcterms:publisher"]),
    ("reportNumber", &["bibo:number"]),
    ("reportType", &["dcterms:type"]),
    ("rights", &["dcterms:rights"]),
    ("runningTime", &["dcterms:extent"]),
    ("section", &["bibo:section"]),
    ("series", &["dcterms:isPartOf"]),
    ("shortTitle", &["bibo:shortTitle", "dcterms:alternative"]),
    ("subject", &["dcterms:subject"]),
    ("thesisType", &["dcterms:type"]),
    ("url", &["bibo:uri"]),
    ("videoRecordingFormat", &["dcterms:medium"]),
    ("volume", &["bibo:volume"]),
    ("websiteTitle", &["dcterms:isPartOf"]),
    ("websiteType", &["dcterms:type"]),
];

const CREATORS: &[(&str, &[&str])] = &[
    ("author", &["dcterms:creator"]),
    ("contributor", &["dcterms:contributor"]),
    ("editor", &["bibo:editor", "dcterms:contributor"]),
    ("translator", &["bibo:translator", "dcterms:contributor"]),
    ("seriesEditor", &["bibo:editor"]),
    ("interviewee", &["bibo:interviewee"]),
    ("interviewer", &["bibo:interviewer"]),
    ("director", &["bibo:director"]),
    ("scriptwriter", &[]),
    ("producer", &["bibo:producer"]),
    ("castMember", &[]),
    ("sponsor", &[]),
    ("counsel", &[]),
    ("inventor", &["dcterms:creator"]),
    ("attorneyAgent", &[]),
    ("recipient", &["bibo:recipient"]),
    ("performer", &["bibo:performer"]),
    ("composer", &["dcterms:creator"]),
    ("wordsBy", &[]),
    ("cartographer", &["dcterms:creator"]),
    ("programmer", &["dcterms:creator"]),
    ("reviewedAuthor", &[]),
    ("artist", &["dcterms:creator"]),
    ("commenter", &[]),
    ("presenter", &[]),
    ("guest", &[]),
    ("podcaster", &[]),
    ("cosponsor", &[]),
    ("bookAuthor", &["dcterms:creator"]),
];
