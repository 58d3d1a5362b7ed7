//! Reference-management API client.
//!
//! Resolves the keys changed since a version cursor, then fetches full
//! records and per-record tag listings in bounded chunks. Every request
//! goes through a [`Transport`] so the pipeline can be driven by a scripted
//! fake in tests and by [`HttpTransport`] (reqwest) in production.
//!
//! # Endpoints
//!
//! | Purpose | Path |
//! |---------|------|
//! | Changed keys | `/{users,groups}/{id}/items?format=versions&since=V` |
//! | Changed keys (collection) | `/{users,groups}/{id}/collections/{c}/items?format=versions&since=V` |
//! | Full records | `/{users,groups}/{id}/items?itemKey=A,B,C` |
//! | Tag listing | `/{users,groups}/{id}/items/{key}/tags` |
//! | Attachment file | `/{users,groups}/{id}/items/{key}/file` |
//!
//! # Errors
//!
//! Any non-success status is a fatal [`SourceError::Transport`] carrying
//! the URL and status line. Nothing is retried.
//!
//! # Pagination
//!
//! Listings that the server paginates advertise the following page in a
//! `Link: <url>; rel="next"` header. The versions listing and the tag
//! listing follow it; the record fetch is bounded by the key chunk.

use std::collections::HashSet;
use std::str::FromStr;
use std::sync::OnceLock;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use regex::Regex;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use reqwest::Url;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::error::SourceError;
use crate::models::{ItemTag, SourceRecord};

// ═══════════════════════════════════════════════════════════════════════
// Library addressing
// ═══════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LibraryKind {
    User,
    Group,
}

impl LibraryKind {
    fn path_segment(&self) -> &'static str {
        match self {
            LibraryKind::User => "users",
            LibraryKind::Group => "groups",
        }
    }
}

impl FromStr for LibraryKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s {
            "user" => Ok(LibraryKind::User),
            "group" => Ok(LibraryKind::Group),
            other => anyhow::bail!("Unknown library type '{}'. Must be user or group.", other),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Library {
    pub kind: LibraryKind,
    pub id: u64,
}

/// Builds endpoint URLs for one library.
#[derive(Debug, Clone)]
pub struct SourceUrl {
    base: Url,
    library: Library,
}

impl SourceUrl {
    pub fn new(base_url: &str, library: Library) -> anyhow::Result<Self> {
        let base = Url::parse(base_url)
            .with_context(|| format!("Invalid source base URL: {}", base_url))?;
        Ok(Self { base, library })
    }

    pub fn library(&self) -> Library {
        self.library
    }

    /// Endpoint identifying the library itself (stored on the import run).
    pub fn library_url(&self) -> String {
        self.build("", &[])
    }

    pub fn items(&self, params: &[(&str, String)]) -> String {
        self.build("/items", params)
    }

    pub fn collection_items(&self, collection: &str, params: &[(&str, String)]) -> String {
        self.build(&format!("/collections/{}/items", collection), params)
    }

    pub fn item_tags(&self, key: &str, params: &[(&str, String)]) -> String {
        self.build(&format!("/items/{}/tags", key), params)
    }

    pub fn item_file(&self, key: &str, params: &[(&str, String)]) -> String {
        self.build(&format!("/items/{}/file", key), params)
    }

    fn build(&self, path: &str, params: &[(&str, String)]) -> String {
        let mut url = self.base.clone();
        let base_path = self.base.path().trim_end_matches('/');
        url.set_path(&format!(
            "{}/{}/{}{}",
            base_path,
            self.library.kind.path_segment(),
            self.library.id,
            path
        ));
        url.set_query(None);
        if !params.is_empty() {
            let mut query = url.query_pairs_mut();
            for (k, v) in params {
                query.append_pair(k, v);
            }
        }
        url.to_string()
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Transport
// ═══════════════════════════════════════════════════════════════════════

/// A fully buffered HTTP response.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub reason: String,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl HttpResponse {
    /// A `200 OK` response with the given body and no headers.
    pub fn ok(body: impl Into<String>) -> Self {
        Self {
            status: 200,
            reason: "OK".to_string(),
            headers: Vec::new(),
            body: body.into(),
        }
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.push((name.to_string(), value.into()));
        self
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn status_line(&self) -> String {
        format!("{} {}", self.status, self.reason).trim_end().to_string()
    }

    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Target of the `Link` header relation `rel` (first, prev, next, last, alternate).
    pub fn link(&self, rel: &str) -> Option<String> {
        parse_link_header(self.header("Link")?, rel)
    }
}

/// Extract the URL for relation `rel` from a `Link` header value.
pub fn parse_link_header(value: &str, rel: &str) -> Option<String> {
    static LINK_RE: OnceLock<Regex> = OnceLock::new();
    let re = LINK_RE.get_or_init(|| {
        Regex::new(r#"<([^>]+)>;\s*rel="([^"]+)""#).expect("link header pattern is valid")
    });
    re.captures_iter(value)
        .find(|c| &c[2] == rel)
        .map(|c| c[1].to_string())
}

/// Synchronous-style request/response access to the source API.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn get(&self, url: &str) -> Result<HttpResponse, SourceError>;
}

/// reqwest-backed transport sending the API version and bearer credential
/// on every request.
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(api_version: u32, api_key: Option<&str>, timeout: Duration) -> anyhow::Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(
            "Zotero-API-Version",
            HeaderValue::from_str(&api_version.to_string())?,
        );
        if let Some(key) = api_key {
            let mut bearer = HeaderValue::from_str(&format!("Bearer {}", key))
                .context("API key contains characters not allowed in a header")?;
            bearer.set_sensitive(true);
            headers.insert(AUTHORIZATION, bearer);
        }
        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(timeout)
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn get(&self, url: &str) -> Result<HttpResponse, SourceError> {
        let network = |e: reqwest::Error| SourceError::Network {
            url: url.to_string(),
            message: e.to_string(),
        };
        let resp = self.client.get(url).send().await.map_err(network)?;
        let status = resp.status();
        let headers = resp
            .headers()
            .iter()
            .map(|(k, v)| (k.as_str().to_string(), v.to_str().unwrap_or("").to_string()))
            .collect();
        let body = resp.text().await.map_err(network)?;
        Ok(HttpResponse {
            status: status.as_u16(),
            reason: status.canonical_reason().unwrap_or("").to_string(),
            headers,
            body,
        })
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Client
// ═══════════════════════════════════════════════════════════════════════

/// Keys changed since a cursor, oldest first, plus the new watermark.
#[derive(Debug, Clone, Default)]
pub struct ChangedKeys {
    pub keys: Vec<String>,
    /// `Last-Modified-Version` of the listing, else the highest version seen.
    pub last_modified_version: Option<i64>,
}

pub struct SourceClient<'a> {
    transport: &'a dyn Transport,
    urls: SourceUrl,
    api_key: Option<String>,
}

impl<'a> SourceClient<'a> {
    pub fn new(transport: &'a dyn Transport, urls: SourceUrl, api_key: Option<String>) -> Self {
        Self {
            transport,
            urls,
            api_key,
        }
    }

    pub fn urls(&self) -> &SourceUrl {
        &self.urls
    }

    /// Keys of every record changed since `since`, ascending by date added,
    /// optionally restricted to one collection.
    pub async fn changed_keys(
        &self,
        since: i64,
        collection: Option<&str>,
    ) -> Result<ChangedKeys, SourceError> {
        let params = [
            ("since", since.to_string()),
            ("format", "versions".to_string()),
            // Ascending date added keeps import order stable, so an operator
            // can estimate an "added after" bound when resuming.
            ("sort", "dateAdded".to_string()),
            ("direction", "asc".to_string()),
        ];
        let mut url = match collection {
            Some(c) => self.urls.collection_items(c, &params),
            None => self.urls.items(&params),
        };

        let mut changed = ChangedKeys::default();
        let mut seen: HashSet<String> = HashSet::new();
        let mut max_seen: Option<i64> = None;
        loop {
            let resp = self.get_checked(&url).await?;
            if changed.last_modified_version.is_none() {
                changed.last_modified_version = resp
                    .header("Last-Modified-Version")
                    .and_then(|v| v.trim().parse().ok());
            }
            let versions: serde_json::Map<String, serde_json::Value> = decode(&url, &resp.body)?;
            for (key, version) in versions {
                if let Some(v) = version.as_i64() {
                    max_seen = Some(max_seen.map_or(v, |m| m.max(v)));
                }
                if seen.insert(key.clone()) {
                    changed.keys.push(key);
                }
            }
            match resp.link("next") {
                Some(next) => url = next,
                None => break,
            }
        }
        if changed.last_modified_version.is_none() {
            changed.last_modified_version = max_seen;
        }
        debug!(count = changed.keys.len(), "resolved changed keys");
        Ok(changed)
    }

    /// Full records for a chunk of keys (at most 50).
    ///
    /// The credential is also passed as a query parameter so the server
    /// attaches enclosure links to stored-file attachments.
    pub async fn fetch_records(&self, keys: &[String]) -> Result<Vec<SourceRecord>, SourceError> {
        let mut params = vec![
            ("itemKey", keys.join(",")),
            ("limit", keys.len().max(1).to_string()),
        ];
        if let Some(key) = &self.api_key {
            params.push(("key", key.clone()));
        }
        let url = self.urls.items(&params);
        let resp = self.get_checked(&url).await?;
        decode(&url, &resp.body)
    }

    /// Tag listing for one record; unlike the bulk response it carries
    /// whether each tag was applied manually or automatically.
    pub async fn fetch_tags(&self, key: &str) -> Result<Vec<ItemTag>, SourceError> {
        let mut params = Vec::new();
        if let Some(api_key) = &self.api_key {
            params.push(("key", api_key.clone()));
        }
        let mut url = self.urls.item_tags(key, &params);
        let mut tags = Vec::new();
        loop {
            let resp = self.get_checked(&url).await?;
            let page: Vec<ItemTag> = decode(&url, &resp.body)?;
            tags.extend(page);
            match resp.link("next") {
                Some(next) => url = next,
                None => break,
            }
        }
        Ok(tags)
    }

    async fn get_checked(&self, url: &str) -> Result<HttpResponse, SourceError> {
        debug!(url, "GET");
        let resp = self.transport.get(url).await?;
        if !resp.is_success() {
            return Err(SourceError::Transport {
                url: url.to_string(),
                status_line: resp.status_line(),
            });
        }
        Ok(resp)
    }
}

fn decode<T: DeserializeOwned>(url: &str, body: &str) -> Result<T, SourceError> {
    serde_json::from_str(body).map_err(|e| SourceError::Decode {
        url: url.to_string(),
        message: e.to_string(),
    })
}
