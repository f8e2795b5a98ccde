//! App-shell handling for navigations.

use reqwest::Url;
use tracing::{debug, warn};

use crate::error::{WorkerError, WorkerResult};
use crate::manifest::{AssetEntry, AssetManifest};
use crate::net::{Fetcher, Request, Response, ResponseSource};
use crate::precache::PrecacheStore;

/// Answers navigations with the precached app shell. The client-side router then
/// renders the requested route, so every in-scope navigation gets the same document.
#[derive(Debug, Clone)]
pub struct NavigationFallback {
    document: Option<AssetEntry>,
}

impl NavigationFallback {
    /// The app shell must be part of the manifest to be served from the store
    pub fn new(manifest: &AssetManifest, fallback_url: &Url) -> Self {
        let document = manifest.lookup(fallback_url).cloned();
        if document.is_none() {
            warn!(url = %fallback_url, "App shell is not precached; navigations will use the network");
        }
        Self { document }
    }

    /// The shell comes straight from the store. Only when it is missing does the
    /// navigation go to the network, and a transport failure is then returned.
    pub async fn handle(
        &self,
        request: &Request,
        fetcher: &dyn Fetcher,
        precache: &PrecacheStore,
        generation: &str,
    ) -> WorkerResult<Response> {
        if let Some(document) = &self.document {
            match precache.lookup(generation, document).await {
                Ok(Some(mut response)) => {
                    debug!(url = %request.url, shell = %document.path, "Serving app shell");
                    response.source = ResponseSource::Fallback;
                    return Ok(response);
                }
                Ok(None) => {
                    warn!(shell = %document.path, generation = generation, "App shell missing from precache");
                }
                Err(e) => {
                    warn!(error = %e, "Failed to read app shell");
                }
            }
        }

        match fetcher.fetch(request).await {
            Ok(response) => Ok(response),
            Err(e) => {
                debug!(url = %request.url, error = %e, "Navigation failed at the network layer");
                Err(WorkerError::Transport(e))
            }
        }
    }
}
