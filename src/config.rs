use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub source: SourceConfig,
    #[serde(default)]
    pub import: ImportConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default = "default_vocabularies")]
    pub vocabularies: BTreeMap<String, String>,
    #[serde(default)]
    pub mapping: MappingConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SourceConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_api_version")]
    pub api_version: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_account_label")]
    pub account_label: String,
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            api_version: default_api_version(),
            timeout_secs: default_timeout_secs(),
            api_key_env: default_api_key_env(),
            account_label: default_account_label(),
            chunk_size: default_chunk_size(),
        }
    }
}

fn default_base_url() -> String {
    "https://api.zotero.org".to_string()
}
fn default_api_version() -> u32 {
    3
}
// Splits the difference between a typical client default (10s) and the
// server's upper limit (30s).
fn default_timeout_secs() -> u64 {
    20
}
fn default_api_key_env() -> String {
    "ZOTERO_API_KEY".to_string()
}
fn default_account_label() -> String {
    "Zotero".to_string()
}
fn default_chunk_size() -> usize {
    50
}

#[derive(Debug, Deserialize, Clone)]
pub struct ImportConfig {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_auto_tagger")]
    pub auto_tagger: String,
    #[serde(default = "default_tag_delimiter")]
    pub tag_delimiter: String,
    #[serde(default = "default_true")]
    pub notes_seed_tags: bool,
}

impl Default for ImportConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            auto_tagger: default_auto_tagger(),
            tag_delimiter: default_tag_delimiter(),
            notes_seed_tags: true,
        }
    }
}

fn default_batch_size() -> usize {
    50
}
fn default_auto_tagger() -> String {
    "Automatic tagger".to_string()
}
fn default_tag_delimiter() -> String {
    " - ".to_string()
}
fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            format: default_log_format(),
        }
    }
}

fn default_log_format() -> String {
    "text".to_string()
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct MappingConfig {
    /// Optional TOML file overriding built-in priority tables.
    pub path: Option<PathBuf>,
}

/// Namespaces whose classes and properties are live for mapping.
pub fn default_vocabularies() -> BTreeMap<String, String> {
    [
        ("dcterms", "http://purl.org/dc/terms/"),
        ("dctype", "http://purl.org/dc/dcmitype/"),
        ("bibo", "http://purl.org/ontology/bibo/"),
        ("skos", "http://www.w3.org/2004/02/skos/core#"),
        ("foaf", "http://xmlns.com/foaf/0.1/"),
        ("oa", "http://www.w3.org/ns/oa#"),
        ("jdc", "https://jardindesconnaissances.univ-paris8.fr/onto/jdc#"),
        ("schema", "http://schema.org/"),
        ("rdf", "http://www.w3.org/1999/02/22-rdf-syntax-ns#"),
        ("cito", "http://purl.org/spar/cito/"),
    ]
    .into_iter()
    .map(|(p, ns)| (p.to_string(), ns.to_string()))
    .collect()
}

impl Config {
    /// Config with defaults everywhere except the database path.
    pub fn with_db_path(path: PathBuf) -> Self {
        Self {
            db: DbConfig { path },
            source: SourceConfig::default(),
            import: ImportConfig::default(),
            logging: LoggingConfig::default(),
            vocabularies: default_vocabularies(),
            mapping: MappingConfig::default(),
        }
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

pub fn validate(config: &Config) -> Result<()> {
    if config.db.path.as_os_str().is_empty() {
        anyhow::bail!("db.path must not be empty");
    }

    if !(1..=50).contains(&config.source.chunk_size) {
        anyhow::bail!("source.chunk_size must be in [1, 50]");
    }
    if config.source.api_version == 0 {
        anyhow::bail!("source.api_version must be > 0");
    }
    if !config.source.base_url.starts_with("http://")
        && !config.source.base_url.starts_with("https://")
    {
        anyhow::bail!("source.base_url must be an http(s) URL");
    }

    if !(1..=50).contains(&config.import.batch_size) {
        anyhow::bail!("import.batch_size must be in [1, 50]");
    }
    if config.import.tag_delimiter.is_empty() {
        anyhow::bail!("import.tag_delimiter must not be empty");
    }
    if config.import.auto_tagger.trim().is_empty() {
        anyhow::bail!("import.auto_tagger must not be empty");
    }

    match config.logging.format.as_str() {
        "text" | "json" => {}
        other => anyhow::bail!(
            "Unknown logging format: '{}'. Must be text or json.",
            other
        ),
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_config_gets_defaults() {
        let cfg: Config = toml::from_str("[db]\npath = \"x.sqlite\"\n").unwrap();
        validate(&cfg).unwrap();
        assert_eq!(cfg.source.base_url, "https://api.zotero.org");
        assert_eq!(cfg.source.chunk_size, 50);
        assert_eq!(cfg.source.timeout_secs, 20);
        assert_eq!(cfg.import.tag_delimiter, " - ");
        assert!(cfg.import.notes_seed_tags);
        assert_eq!(cfg.vocabularies["skos"], "http://www.w3.org/2004/02/skos/core#");
    }

    #[test]
    fn rejects_oversized_chunks() {
        let cfg: Config =
            toml::from_str("[db]\npath = \"x.sqlite\"\n[source]\nchunk_size = 51\n").unwrap();
        let err = validate(&cfg).unwrap_err().to_string();
        assert!(err.contains("chunk_size"));
    }

    #[test]
    fn rejects_unknown_log_format() {
        let cfg: Config =
            toml::from_str("[db]\npath = \"x.sqlite\"\n[logging]\nformat = \"xml\"\n").unwrap();
        assert!(validate(&cfg).is_err());
    }

    #[test]
    fn load_config_reports_missing_file() {
        let err = load_config(Path::new("/nonexistent/refsync.toml"))
            .unwrap_err()
            .to_string();
        assert!(err.contains("Failed to read config file"));
    }
}
