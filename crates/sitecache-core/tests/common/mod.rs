//! Shared fakes for the integration tests: a scriptable network and a worker harness.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use sitecache_core::lifecycle::MemorySink;
use sitecache_core::{
    AssetManifest, Config, Fetcher, MemoryStorage, Request, Response, ResponseSource, TransportError, Url,
    Worker,
};

pub const ORIGIN: &str = "https://maps.example.org";
pub const API_SITE: &str = "https://api.example.org/v1/site";

pub const INDEX_V1: &[u8] = b"<!doctype html><title>map viewer</title><div id=q-app></div>";
/// Not valid UTF-8 on purpose
pub const APP_JS_V1: &[u8] = &[0x2f, 0x2a, 0xff, 0xfe, 0x00, 0x2a, 0x2f, 0x0a];
pub const APP_JS_V2: &[u8] = b"console.log('v2');\n";

/// In-memory origin. Unknown URLs answer 404; `set_offline(true)` makes every
/// request fail at the transport layer.
#[derive(Default)]
pub struct FakeNetwork {
    routes: Mutex<HashMap<String, (u16, Vec<u8>)>>,
    offline: AtomicBool,
    attempts: Mutex<Vec<Request>>,
    delivered: Mutex<Vec<Request>>,
}

fn route_key(url: &Url) -> String {
    let mut url = url.clone();
    url.set_query(None);
    url.set_fragment(None);
    url.to_string()
}

impl FakeNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn serve(&self, url: &str, status: u16, body: &[u8]) {
        let key = route_key(&Url::parse(url).unwrap());
        self.routes.lock().unwrap().insert(key, (status, body.to_vec()));
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Every request seen, including ones that failed
    pub fn attempts(&self) -> Vec<Request> {
        self.attempts.lock().unwrap().clone()
    }

    /// Requests that reached the origin
    pub fn delivered(&self) -> Vec<Request> {
        self.delivered.lock().unwrap().clone()
    }

    pub fn delivered_bodies(&self, url: &str) -> Vec<String> {
        self.delivered()
            .into_iter()
            .filter(|r| r.url.as_str() == url)
            .map(|r| String::from_utf8(r.body).unwrap())
            .collect()
    }
}

#[async_trait]
impl Fetcher for FakeNetwork {
    async fn fetch(&self, request: &Request) -> Result<Response, TransportError> {
        self.attempts.lock().unwrap().push(request.clone());
        if self.offline.load(Ordering::SeqCst) {
            return Err(TransportError::new(request.url.as_str(), "network unreachable"));
        }
        self.delivered.lock().unwrap().push(request.clone());

        let route = self.routes.lock().unwrap().get(&route_key(&request.url)).cloned();
        let response = match route {
            Some((status, body)) => Response::new(status, body, ResponseSource::Network),
            None => Response::new(404, b"not found".to_vec(), ResponseSource::Network),
        };
        Ok(response.with_header("content-type", "application/octet-stream"))
    }
}

pub fn config() -> Config {
    Config {
        origin: ORIGIN.to_string(),
        api_base: "https://api.example.org/v1".to_string(),
        ..Config::default()
    }
}

pub fn url(path: &str) -> Url {
    Url::parse(ORIGIN).unwrap().join(path).unwrap()
}

pub fn manifest(entries: &[(&str, &str)]) -> AssetManifest {
    AssetManifest::from_entries(
        &Url::parse(ORIGIN).unwrap(),
        entries.iter().map(|(u, r)| (*u, Some(r.to_string()))),
    )
    .unwrap()
}

pub fn manifest_v1() -> AssetManifest {
    manifest(&[("/index.html", "a1"), ("/app.js", "b1")])
}

pub fn manifest_v2() -> AssetManifest {
    manifest(&[("/index.html", "a1"), ("/app.js", "b2")])
}

/// Storage, network and sink shared by every worker built from it, so a second
/// worker behaves like the next deploy of the same app.
pub struct Harness {
    pub storage: Arc<MemoryStorage>,
    pub network: Arc<FakeNetwork>,
    pub sink: Arc<MemorySink>,
}

impl Harness {
    pub fn new() -> Self {
        let network = FakeNetwork::new();
        network.serve(&format!("{}/index.html", ORIGIN), 200, INDEX_V1);
        network.serve(&format!("{}/app.js", ORIGIN), 200, APP_JS_V1);
        network.serve(API_SITE, 201, b"{\"ok\":true}");
        Self {
            storage: Arc::new(MemoryStorage::new()),
            network,
            sink: Arc::new(MemorySink::new()),
        }
    }

    pub fn worker(&self, manifest: AssetManifest) -> Worker {
        self.worker_with(config(), manifest)
    }

    pub fn worker_with(&self, config: Config, manifest: AssetManifest) -> Worker {
        Worker::new(
            config,
            manifest,
            self.storage.clone(),
            self.network.clone(),
            self.sink.clone(),
        )
        .unwrap()
    }
}
