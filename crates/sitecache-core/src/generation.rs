//! Cache generation tracking.
//!
//! Every build's assets live under their own `precache/<tag>/` prefix. Install writes
//! the new generation next to the old one; activation is the only point where
//! superseded generations are freed, so a page still reading from the previous build
//! never loses its bytes mid-install.

use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::{debug, info};

use crate::error::WorkerResult;
use crate::manifest::AssetEntry;
use crate::storage::{delete_prefix, Storage};

pub const PRECACHE_PREFIX: &str = "precache/";

/// Tag of the generation the worker currently serves from
const ACTIVE_GENERATION_KEY: &str = "worker/active-generation";

pub fn generation_prefix(tag: &str) -> String {
    format!("{}{}/", PRECACHE_PREFIX, tag)
}

pub fn body_key(tag: &str, entry: &AssetEntry) -> String {
    format!("{}body/{}", generation_prefix(tag), entry.cache_key())
}

pub fn meta_key(tag: &str, entry: &AssetEntry) -> String {
    format!("{}meta/{}", generation_prefix(tag), entry.cache_key())
}

/// Generation tag embedded in a precache key, `None` for keys we did not write
fn tag_of(key: &str) -> Option<&str> {
    let rest = key.strip_prefix(PRECACHE_PREFIX)?;
    let (tag, rest) = rest.split_once('/')?;
    if tag.is_empty() || !(rest.starts_with("body/") || rest.starts_with("meta/")) {
        return None;
    }
    Some(tag)
}

/// Result of activation cleanup
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct EvictionReport {
    pub retained: String,
    pub evicted: Vec<String>,
    pub stray_keys_removed: usize,
}

pub struct GenerationTracker {
    storage: Arc<dyn Storage>,
}

impl GenerationTracker {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self { storage }
    }

    /// Every generation with at least one stored key
    pub async fn list_generations(&self) -> WorkerResult<Vec<String>> {
        let keys = self.storage.list_keys(PRECACHE_PREFIX).await?;
        let tags: BTreeSet<&str> = keys.iter().filter_map(|k| tag_of(k)).collect();
        Ok(tags.into_iter().map(str::to_string).collect())
    }

    pub async fn active(&self) -> WorkerResult<Option<String>> {
        let value = self.storage.get(ACTIVE_GENERATION_KEY).await?;
        Ok(value.map(|bytes| String::from_utf8_lossy(&bytes).into_owned()))
    }

    pub async fn set_active(&self, tag: &str) -> WorkerResult<()> {
        self.storage
            .put(ACTIVE_GENERATION_KEY, tag.as_bytes().to_vec())
            .await?;
        Ok(())
    }

    /// Evict every generation except `keep`, then record `keep` as active
    pub async fn activate(&self, keep: &str) -> WorkerResult<EvictionReport> {
        let mut report = EvictionReport {
            retained: keep.to_string(),
            ..Default::default()
        };

        for tag in self.list_generations().await? {
            if tag == keep {
                continue;
            }
            let removed = delete_prefix(self.storage.as_ref(), &generation_prefix(&tag)).await?;
            info!(generation = %tag, keys = removed, "Evicted superseded cache generation");
            report.evicted.push(tag);
        }

        for key in self.storage.list_keys(PRECACHE_PREFIX).await? {
            if tag_of(&key).is_none() && self.storage.delete(&key).await? {
                debug!(key = %key, "Removed unrecognised precache key");
                report.stray_keys_removed += 1;
            }
        }

        self.set_active(keep).await?;
        Ok(report)
    }
}
