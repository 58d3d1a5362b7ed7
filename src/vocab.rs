//! Built-in vocabulary catalogue.
//!
//! `refsync init` seeds these into a fresh SQLite store so the mapping
//! tables have live classes and properties to resolve against. The
//! in-memory store is built from the same catalogue in tests.

use serde::{Deserialize, Serialize};

/// One RDF vocabulary known to the target store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Vocabulary {
    pub prefix: String,
    pub namespace_uri: String,
    pub label: String,
    /// Local names of resource classes.
    pub classes: Vec<String>,
    /// Local names of properties.
    pub properties: Vec<String>,
}

impl Vocabulary {
    pub fn new(prefix: &str, namespace_uri: &str, label: &str) -> Self {
        Self {
            prefix: prefix.to_string(),
            namespace_uri: namespace_uri.to_string(),
            label: label.to_string(),
            classes: Vec::new(),
            properties: Vec::new(),
        }
    }

    pub fn classes(mut self, names: &[&str]) -> Self {
        self.classes = names.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn properties(mut self, names: &[&str]) -> Self {
        self.properties = names.iter().map(|s| s.to_string()).collect();
        self
    }
}

pub fn builtin_vocabularies() -> Vec<Vocabulary> {
    vec![
        Vocabulary::new("dcterms", "http://purl.org/dc/terms/", "Dublin Core")
            .classes(&["Agent", "BibliographicResource", "LicenseDocument"])
            .properties(&[
                "abstract",
                "alternative",
                "bibliographicCitation",
                "contributor",
                "created",
                "creator",
                "date",
                "description",
                "extent",
                "format",
                "identifier",
                "isPartOf",
                "isReferencedBy",
                "language",
                "medium",
                "modified",
                "publisher",
                "relation",
                "rights",
                "source",
                "spatial",
                "subject",
                "title",
                "type",
            ]),
        Vocabulary::new("dctype", "http://purl.org/dc/dcmitype/", "Dublin Core Type").classes(&[
            "Collection",
            "Dataset",
            "Image",
            "InteractiveResource",
            "MovingImage",
            "Software",
            "Sound",
            "StillImage",
            "Text",
        ]),
        Vocabulary::new("bibo", "http://purl.org/ontology/bibo/", "Bibliographic Ontology")
            .classes(&[
                "AcademicArticle",
                "Article",
                "AudioDocument",
                "AudioVisualDocument",
                "Bill",
                "Book",
                "BookSection",
                "Document",
                "Email",
                "Film",
                "Hearing",
                "Image",
                "Interview",
                "LegalCaseDocument",
                "Letter",
                "Manuscript",
                "Map",
                "Note",
                "Patent",
                "PersonalCommunication",
                "Report",
                "Slideshow",
                "Statute",
                "Thesis",
                "Webpage",
            ])
            .properties(&[
                "content",
                "court",
                "director",
                "doi",
                "edition",
                "editor",
                "interviewee",
                "interviewer",
                "isbn",
                "issn",
                "issue",
                "locator",
                "numPages",
                "numVolumes",
                "number",
                "pages",
                "performer",
                "presentedAt",
                "producer",
                "recipient",
                "section",
                "shortTitle",
                "translator",
                "uri",
                "volume",
            ]),
        Vocabulary::new("foaf", "http://xmlns.com/foaf/0.1/", "Friend of a Friend")
            .classes(&["Agent", "Organization", "Person"])
            .properties(&[
                "account",
                "accountName",
                "familyName",
                "firstName",
                "givenName",
                "lastName",
                "name",
                "nick",
            ]),
        Vocabulary::new("skos", "http://www.w3.org/2004/02/skos/core#", "SKOS")
            .classes(&["Concept", "ConceptScheme"])
            .properties(&[
                "altLabel",
                "broader",
                "inScheme",
                "narrower",
                "prefLabel",
                "related",
                "semanticRelation",
            ]),
        Vocabulary::new("oa", "http://www.w3.org/ns/oa#", "Web Annotation")
            .classes(&["Annotation", "TextualBody"])
            .properties(&[
                "hasBody",
                "hasPurpose",
                "hasSource",
                "hasTarget",
                "motivatedBy",
            ]),
        Vocabulary::new("cito", "http://purl.org/spar/cito/", "Citation Typing Ontology")
            .properties(&["cites", "isCompiledBy"]),
        Vocabulary::new("schema", "http://schema.org/", "Schema.org").properties(&[
            "identifier",
            "name",
        ]),
        Vocabulary::new(
            "rdf",
            "http://www.w3.org/1999/02/22-rdf-syntax-ns#",
            "RDF",
        )
        .properties(&["type", "value"]),
        Vocabulary::new(
            "jdc",
            "https://jardindesconnaissances.univ-paris8.fr/onto/jdc#",
            "Jardin des connaissances",
        )
        .classes(&["Actant"]),
    ]
}
