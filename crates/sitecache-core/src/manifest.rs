//! Build-time asset manifest.
//!
//! The build injects a JSON list of `{"url": ..., "revision": ...}` entries. A `null`
//! revision means the file name already carries a content hash, so the URL doubles as
//! the fingerprint. The manifest is immutable once loaded and names one cache
//! generation, whose tag is derived from its (path, fingerprint) set.

use std::collections::HashMap;
use std::path::Path;

use reqwest::Url;
use serde::Deserialize;
use sha2::{Digest, Sha256};

use crate::error::{WorkerError, WorkerResult};

/// Query parameters that never distinguish one asset from another
const IGNORED_QUERY_PREFIXES: &[&str] = &["utm_", "fbclid"];

/// Appended to directory-style URLs ending in `/`
const DIRECTORY_INDEX: &str = "index.html";

/// Hex characters of the SHA-256 digest kept in a generation tag
const GENERATION_TAG_LEN: usize = 16;

#[derive(Debug, Deserialize)]
struct RawEntry {
    url: String,
    #[serde(default)]
    revision: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetEntry {
    /// Normalised path (plus any significant query) under the origin
    pub path: String,
    pub fingerprint: String,
}

impl AssetEntry {
    /// Storage key component; unique per (path, fingerprint)
    pub fn cache_key(&self) -> String {
        format!("{}#{}", self.path, self.fingerprint)
    }
}

#[derive(Debug, Clone)]
pub struct AssetManifest {
    origin: Url,
    entries: Vec<AssetEntry>,
    by_path: HashMap<String, usize>,
    generation: String,
}

impl AssetManifest {
    /// Build a manifest from `(url, revision)` pairs resolved against `base`
    pub fn from_entries<I, S>(base: &Url, entries: I) -> WorkerResult<Self>
    where
        I: IntoIterator<Item = (S, Option<String>)>,
        S: AsRef<str>,
    {
        let mut list: Vec<AssetEntry> = Vec::new();
        let mut by_path: HashMap<String, usize> = HashMap::new();

        for (url, revision) in entries {
            let url = url.as_ref();
            let resolved = base
                .join(url)
                .map_err(|e| WorkerError::Manifest(format!("{}: {}", url, e)))?;
            if resolved.origin() != base.origin() {
                return Err(WorkerError::Manifest(format!(
                    "{} is not on the application origin",
                    resolved
                )));
            }
            let path = normalize_path(&resolved);
            let fingerprint = revision
                .filter(|r| !r.is_empty())
                .unwrap_or_else(|| path.clone());

            match by_path.get(&path) {
                Some(&i) if list[i].fingerprint == fingerprint => continue,
                Some(&i) => {
                    return Err(WorkerError::Manifest(format!(
                        "conflicting revisions for {}: {} and {}",
                        path, list[i].fingerprint, fingerprint
                    )));
                }
                None => {
                    by_path.insert(path.clone(), list.len());
                    list.push(AssetEntry { path, fingerprint });
                }
            }
        }

        let generation = generation_tag(&list);
        let mut origin = base.clone();
        origin.set_path("/");
        origin.set_query(None);
        origin.set_fragment(None);

        Ok(Self {
            origin,
            entries: list,
            by_path,
            generation,
        })
    }

    /// Parse the injected manifest JSON
    pub fn from_json(base: &Url, json: &str) -> WorkerResult<Self> {
        let raw: Vec<RawEntry> =
            serde_json::from_str(json).map_err(|e| WorkerError::Manifest(e.to_string()))?;
        Self::from_entries(base, raw.into_iter().map(|e| (e.url, e.revision)))
    }

    pub fn load(base: &Url, path: &Path) -> WorkerResult<Self> {
        let json = std::fs::read_to_string(path)
            .map_err(|e| WorkerError::Manifest(format!("{}: {}", path.display(), e)))?;
        Self::from_json(base, &json)
    }

    pub fn entries(&self) -> &[AssetEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Tag of the cache generation this manifest describes
    pub fn generation(&self) -> &str {
        &self.generation
    }

    /// Absolute URL for an entry, used when fetching it
    pub fn url_for(&self, entry: &AssetEntry) -> WorkerResult<Url> {
        self.origin
            .join(&entry.path)
            .map_err(|e| WorkerError::Manifest(format!("{}: {}", entry.path, e)))
    }

    /// Manifest entry a request URL refers to, if any
    pub fn lookup(&self, url: &Url) -> Option<&AssetEntry> {
        if url.origin() != self.origin.origin() {
            return None;
        }
        self.by_path
            .get(&normalize_path(url))
            .map(|&i| &self.entries[i])
    }
}

/// Path plus significant query of a URL: fragment dropped, tracking parameters
/// removed, directory URLs resolved to their index document.
pub fn normalize_path(url: &Url) -> String {
    let mut path = url.path().to_string();
    if path.ends_with('/') {
        path.push_str(DIRECTORY_INDEX);
    }

    let kept: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(k, _)| !IGNORED_QUERY_PREFIXES.iter().any(|p| k.starts_with(p)))
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();

    if kept.is_empty() {
        path
    } else {
        let query: Vec<String> = kept.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
        format!("{}?{}", path, query.join("&"))
    }
}

fn generation_tag(entries: &[AssetEntry]) -> String {
    let mut keys: Vec<String> = entries.iter().map(|e| e.cache_key()).collect();
    keys.sort();

    let mut hasher = Sha256::new();
    for key in &keys {
        hasher.update(key.as_bytes());
        hasher.update(b"\n");
    }
    let digest = hex::encode(hasher.finalize());
    digest[..GENERATION_TAG_LEN].to_string()
}
