//! Precache store: asset bytes for the current build, keyed by fingerprinted path.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt};
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{WorkerError, WorkerResult};
use crate::generation::{body_key, meta_key, GenerationTracker};
use crate::manifest::{AssetEntry, AssetManifest};
use crate::net::{Fetcher, Request, Response, ResponseSource};
use crate::storage::{load_json, save_json, Storage};

/// Metadata stored next to each asset body
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssetMeta {
    pub path: String,
    pub fingerprint: String,
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub cached_at: DateTime<Utc>,
}

/// What an install pass did for each manifest entry
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct InstallReport {
    pub generation: String,
    pub fetched: usize,
    /// Copied from a retained generation holding the same fingerprint
    pub reused: usize,
    pub already_present: usize,
}

impl InstallReport {
    pub fn total(&self) -> usize {
        self.fetched + self.reused + self.already_present
    }
}

pub struct PrecacheStore {
    storage: Arc<dyn Storage>,
    generations: GenerationTracker,
}

impl PrecacheStore {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self {
            generations: GenerationTracker::new(storage.clone()),
            storage,
        }
    }

    pub fn generations(&self) -> &GenerationTracker {
        &self.generations
    }

    async fn load_meta(&self, tag: &str, entry: &AssetEntry) -> WorkerResult<Option<AssetMeta>> {
        Ok(load_json(self.storage.as_ref(), &meta_key(tag, entry)).await?)
    }

    /// Whether `entry` is fully stored in generation `tag`.
    /// Metadata is written after the body, so its presence marks a complete entry.
    pub async fn contains(&self, tag: &str, entry: &AssetEntry) -> WorkerResult<bool> {
        Ok(self.storage.get(&meta_key(tag, entry)).await?.is_some())
    }

    async fn store(&self, tag: &str, meta: &AssetMeta, entry: &AssetEntry, body: Vec<u8>) -> WorkerResult<()> {
        self.storage.put(&body_key(tag, entry), body).await?;
        save_json(self.storage.as_ref(), &meta_key(tag, entry), meta).await?;
        Ok(())
    }

    /// Serve a precached asset. `None` if the generation does not hold it.
    pub async fn lookup(&self, tag: &str, entry: &AssetEntry) -> WorkerResult<Option<Response>> {
        let meta = match self.load_meta(tag, entry).await? {
            Some(meta) => meta,
            None => return Ok(None),
        };
        let body = match self.storage.get(&body_key(tag, entry)).await? {
            Some(body) => body,
            None => {
                warn!(path = %entry.path, generation = tag, "Precache metadata without body");
                return Ok(None);
            }
        };

        Ok(Some(Response {
            status: meta.status,
            headers: meta.headers,
            body,
            source: ResponseSource::Precache,
        }))
    }

    /// Populate the manifest's generation.
    ///
    /// Entries already present are skipped, entries held by another generation under
    /// the same fingerprint are copied, and everything else is fetched with at most
    /// `concurrency` requests in flight. Any fetch failure fails the install; entries
    /// stored before the failure are kept so a retry only fetches what is missing.
    pub async fn install(
        &self,
        manifest: &AssetManifest,
        fetcher: &dyn Fetcher,
        concurrency: usize,
    ) -> WorkerResult<InstallReport> {
        let tag = manifest.generation();
        let mut report = InstallReport {
            generation: tag.to_string(),
            ..Default::default()
        };

        let others: Vec<String> = self
            .generations
            .list_generations()
            .await?
            .into_iter()
            .filter(|g| g != tag)
            .collect();

        let mut to_fetch = Vec::new();
        'entries: for entry in manifest.entries() {
            if self.contains(tag, entry).await? {
                report.already_present += 1;
                continue;
            }
            for other in &others {
                if self.copy_entry(other, tag, entry).await? {
                    report.reused += 1;
                    continue 'entries;
                }
            }
            to_fetch.push(entry);
        }

        debug!(
            generation = tag,
            to_fetch = to_fetch.len(),
            reused = report.reused,
            present = report.already_present,
            "Precache install planned"
        );

        let fetches: Vec<BoxFuture<'_, WorkerResult<()>>> = to_fetch
            .into_iter()
            .map(|entry| self.fetch_entry(tag, manifest, entry, fetcher).boxed())
            .collect();
        let results: Vec<WorkerResult<()>> = stream::iter(fetches)
            .buffer_unordered(concurrency.max(1))
            .collect()
            .await;

        let mut first_error = None;
        for result in results {
            match result {
                Ok(()) => report.fetched += 1,
                Err(e) => {
                    warn!(error = %e, "Precache fetch failed");
                    first_error.get_or_insert(e);
                }
            }
        }
        if let Some(e) = first_error {
            return Err(e);
        }

        info!(
            generation = tag,
            fetched = report.fetched,
            reused = report.reused,
            present = report.already_present,
            "Precache install complete"
        );
        Ok(report)
    }

    async fn copy_entry(&self, from: &str, to: &str, entry: &AssetEntry) -> WorkerResult<bool> {
        let meta = match self.load_meta(from, entry).await? {
            Some(meta) => meta,
            None => return Ok(false),
        };
        let body = match self.storage.get(&body_key(from, entry)).await? {
            Some(body) => body,
            None => return Ok(false),
        };
        self.store(to, &meta, entry, body).await?;
        debug!(path = %entry.path, from = from, "Reused asset from previous generation");
        Ok(true)
    }

    async fn fetch_entry(
        &self,
        tag: &str,
        manifest: &AssetManifest,
        entry: &AssetEntry,
        fetcher: &dyn Fetcher,
    ) -> WorkerResult<()> {
        let url = manifest.url_for(entry)?;
        let install_failure = |reason: String| WorkerError::InstallFailure {
            url: url.to_string(),
            reason,
        };

        let request = Request::get(url.clone());
        let response = fetcher
            .fetch(&request)
            .await
            .map_err(|e| install_failure(e.reason))?;
        if !response.is_success() {
            return Err(install_failure(format!("HTTP status {}", response.status)));
        }

        let meta = AssetMeta {
            path: entry.path.clone(),
            fingerprint: entry.fingerprint.clone(),
            status: response.status,
            headers: response.headers,
            cached_at: Utc::now(),
        };
        self.store(tag, &meta, entry, response.body).await
    }
}
