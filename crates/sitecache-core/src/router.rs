//! Request classification.
//!
//! Every request is handed to exactly one strategy, checked in this order:
//!
//! 1. precached asset: served from the current generation, no network
//! 2. navigation inside the scope (production, not denylisted): precached app shell
//! 3. mutating call to the configured API endpoint (production): network, then queue
//! 4. anything else: straight to the network, no caching

use anyhow::Result;
use reqwest::{Method, Url};

use crate::config::{BuildMode, Config};
use crate::manifest::{AssetEntry, AssetManifest};
use crate::net::Request;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route<'m> {
    Precached(&'m AssetEntry),
    Navigation,
    ReplayQueue,
    Passthrough,
}

impl Route<'_> {
    pub fn name(&self) -> &'static str {
        match self {
            Route::Precached(_) => "precache",
            Route::Navigation => "navigation",
            Route::ReplayQueue => "replay-queue",
            Route::Passthrough => "passthrough",
        }
    }
}

/// A final-path-segment pattern with at most one `*` wildcard
#[derive(Debug, Clone, PartialEq, Eq)]
struct DenyPattern {
    prefix: String,
    suffix: Option<String>,
}

impl DenyPattern {
    fn parse(pattern: &str) -> Self {
        match pattern.split_once('*') {
            Some((prefix, suffix)) => Self {
                prefix: prefix.to_string(),
                suffix: Some(suffix.to_string()),
            },
            None => Self {
                prefix: pattern.to_string(),
                suffix: None,
            },
        }
    }

    fn matches(&self, segment: &str) -> bool {
        match &self.suffix {
            None => segment == self.prefix,
            Some(suffix) => {
                segment.len() >= self.prefix.len() + suffix.len()
                    && segment.starts_with(&self.prefix)
                    && segment.ends_with(suffix.as_str())
            }
        }
    }
}

/// Worker bootstrap files; a navigation to one of them never gets the app shell
#[derive(Debug, Clone)]
pub struct Denylist {
    patterns: Vec<DenyPattern>,
}

impl Denylist {
    /// `script_url`'s file name is always protected, whatever `patterns` says
    pub fn new(patterns: &[String], script_url: &Url) -> Self {
        let mut parsed: Vec<DenyPattern> = patterns.iter().map(|p| DenyPattern::parse(p)).collect();
        if let Some(script) = last_segment(script_url) {
            let own = DenyPattern::parse(script);
            if !parsed.contains(&own) {
                parsed.push(own);
            }
        }
        Self { patterns: parsed }
    }

    pub fn is_denied(&self, url: &Url) -> bool {
        match last_segment(url) {
            Some(segment) => self.patterns.iter().any(|p| p.matches(segment)),
            None => false,
        }
    }
}

fn last_segment(url: &Url) -> Option<&str> {
    url.path_segments()
        .and_then(|segments| segments.last())
        .filter(|s| !s.is_empty())
}

#[derive(Debug, Clone)]
pub struct Router {
    scope: Url,
    denylist: Denylist,
    mutating_endpoint: Url,
    queue_methods: Vec<Method>,
    mode: BuildMode,
}

impl Router {
    pub fn from_config(config: &Config) -> Result<Self> {
        Ok(Self {
            scope: config.scope_url()?,
            denylist: Denylist::new(&config.denylist, &config.script_url()?),
            mutating_endpoint: config.mutating_endpoint()?,
            queue_methods: config.queue_methods()?,
            mode: config.mode,
        })
    }

    fn in_scope(&self, url: &Url) -> bool {
        url.origin() == self.scope.origin() && url.path().starts_with(self.scope.path())
    }

    fn is_mutating_endpoint(&self, url: &Url) -> bool {
        url.origin() == self.mutating_endpoint.origin()
            && url.path().trim_end_matches('/') == self.mutating_endpoint.path().trim_end_matches('/')
    }

    /// Only state-changing calls are queued; a replayed read or PUT gains nothing
    fn is_queueable_method(&self, method: &Method) -> bool {
        !method.is_idempotent() && self.queue_methods.contains(method)
    }

    pub fn classify<'m>(&self, manifest: &'m AssetManifest, request: &Request) -> Route<'m> {
        if request.method == Method::GET {
            if let Some(entry) = manifest.lookup(&request.url) {
                return Route::Precached(entry);
            }
        }

        if !self.mode.is_production() {
            return Route::Passthrough;
        }

        if request.is_navigation()
            && self.in_scope(&request.url)
            && !self.denylist.is_denied(&request.url)
        {
            return Route::Navigation;
        }

        if self.is_mutating_endpoint(&request.url) && self.is_queueable_method(&request.method) {
            return Route::ReplayQueue;
        }

        Route::Passthrough
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    fn config() -> Config {
        Config {
            origin: "https://maps.example.org".into(),
            api_base: "https://api.example.org/v1".into(),
            ..Config::default()
        }
    }

    fn manifest() -> AssetManifest {
        AssetManifest::from_entries(
            &url("https://maps.example.org/"),
            vec![("index.html", Some("1".to_string())), ("app.js", Some("1".to_string()))],
        )
        .unwrap()
    }

    #[test]
    fn test_deny_pattern_matching() {
        let exact = DenyPattern::parse("sw.js");
        assert!(exact.matches("sw.js"));
        assert!(!exact.matches("newsw.js"));

        let wildcard = DenyPattern::parse("workbox-*.js");
        assert!(wildcard.matches("workbox-4f2a1c.js"));
        assert!(wildcard.matches("workbox-.js"));
        assert!(!wildcard.matches("workbox.js"));
        assert!(!wildcard.matches("workbox-1.css"));
    }

    #[test]
    fn test_denylist_always_protects_script() {
        let denylist = Denylist::new(&[], &url("https://maps.example.org/worker/offline-sw.js"));
        assert!(denylist.is_denied(&url("https://maps.example.org/worker/offline-sw.js")));
        assert!(denylist.is_denied(&url("https://maps.example.org/offline-sw.js?v=2")));
        assert!(!denylist.is_denied(&url("https://maps.example.org/")));
        assert!(!denylist.is_denied(&url("https://maps.example.org/layers/3")));
    }

    #[test]
    fn test_precached_asset_wins() {
        let router = Router::from_config(&config()).unwrap();
        let manifest = manifest();
        let req = Request::get(url("https://maps.example.org/app.js"));
        assert!(matches!(router.classify(&manifest, &req), Route::Precached(e) if e.path == "/app.js"));

        // A navigation to a precached document is served from the precache too
        let nav = Request::navigate(url("https://maps.example.org/"));
        assert_eq!(router.classify(&manifest, &nav).name(), "precache");
    }

    #[test]
    fn test_navigation_route() {
        let router = Router::from_config(&config()).unwrap();
        let manifest = manifest();
        let nav = Request::navigate(url("https://maps.example.org/layers/12"));
        assert_eq!(router.classify(&manifest, &nav), Route::Navigation);

        let script = Request::navigate(url("https://maps.example.org/sw.js"));
        assert_eq!(router.classify(&manifest, &script), Route::Passthrough);

        let runtime = Request::navigate(url("https://maps.example.org/workbox-9a8b.js"));
        assert_eq!(router.classify(&manifest, &runtime), Route::Passthrough);

        let foreign = Request::navigate(url("https://elsewhere.example.org/"));
        assert_eq!(router.classify(&manifest, &foreign), Route::Passthrough);

        let subresource = Request::get(url("https://maps.example.org/layers/12"));
        assert_eq!(router.classify(&manifest, &subresource), Route::Passthrough);
    }

    #[test]
    fn test_replay_queue_route() {
        let router = Router::from_config(&config()).unwrap();
        let manifest = manifest();

        let post = Request::post(url("https://api.example.org/v1/site"), "{}");
        assert_eq!(router.classify(&manifest, &post), Route::ReplayQueue);

        let post_query = Request::post(url("https://api.example.org/v1/site?draft=1"), "{}");
        assert_eq!(router.classify(&manifest, &post_query), Route::ReplayQueue);

        let get = Request::get(url("https://api.example.org/v1/site"));
        assert_eq!(router.classify(&manifest, &get), Route::Passthrough);

        let put = Request::new(Method::PUT, url("https://api.example.org/v1/site"));
        assert_eq!(router.classify(&manifest, &put), Route::Passthrough);

        let other_path = Request::post(url("https://api.example.org/v1/sites"), "{}");
        assert_eq!(router.classify(&manifest, &other_path), Route::Passthrough);

        let other_origin = Request::post(url("https://api.example.net/v1/site"), "{}");
        assert_eq!(router.classify(&manifest, &other_origin), Route::Passthrough);
    }

    #[test]
    fn test_development_mode_only_precaches() {
        let router = Router::from_config(&Config {
            mode: BuildMode::Development,
            ..config()
        })
        .unwrap();
        let manifest = manifest();

        let nav = Request::navigate(url("https://maps.example.org/layers/12"));
        assert_eq!(router.classify(&manifest, &nav), Route::Passthrough);

        let post = Request::post(url("https://api.example.org/v1/site"), "{}");
        assert_eq!(router.classify(&manifest, &post), Route::Passthrough);

        let asset = Request::get(url("https://maps.example.org/app.js"));
        assert_eq!(router.classify(&manifest, &asset).name(), "precache");
    }
}
