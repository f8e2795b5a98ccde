//! Worker configuration.
//!
//! Registration options, the mutating-API route, the navigation denylist and the queue
//! policy are fixed configuration, loaded once at startup.
//!
//! Configuration is stored at `~/.config/sitecache/config.json`. Missing fields take
//! their defaults, and a few fields can be overridden from the environment.

use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{Context, Result};
use reqwest::{Method, Url};
use serde::{Deserialize, Serialize};

/// Application name used for config/cache directory paths
const APP_NAME: &str = "sitecache";

/// Config file name
const CONFIG_FILE: &str = "config.json";

/// Queued requests older than this are discarded instead of replayed (24 hours)
const DEFAULT_RETENTION_MINUTES: i64 = 24 * 60;
/// Upper bound for `retention_minutes`: one year
const MAX_RETENTION_MINUTES: i64 = 366 * 24 * 60;

/// Periodic drain interval. Connectivity restore also triggers a drain.
const DEFAULT_DRAIN_INTERVAL_SECS: u64 = 300;

/// How often the host checks the origin to detect connectivity changes
const DEFAULT_CONNECTIVITY_INTERVAL_SECS: u64 = 30;

/// Maximum concurrent asset fetches during install
const DEFAULT_PRECACHE_CONCURRENCY: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BuildMode {
    #[default]
    Production,
    Development,
}

impl BuildMode {
    pub fn is_production(&self) -> bool {
        matches!(self, BuildMode::Production)
    }
}

impl FromStr for BuildMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "production" | "prod" => Ok(BuildMode::Production),
            "development" | "dev" | "staging" => Ok(BuildMode::Development),
            other => Err(anyhow::anyhow!("Unknown build mode: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Origin the application is served from, e.g. `https://maps.example.org`
    pub origin: String,
    /// Registration scope, relative to the origin
    pub scope: String,
    /// Worker script URL, relative to the origin
    pub script_url: String,
    /// Base URL of the backend API
    pub api_base: String,
    /// Path under `api_base` whose mutating calls are queued while offline
    pub mutating_path: String,
    /// Methods subject to queueing (idempotent methods are never queued)
    pub queue_methods: Vec<String>,
    pub queue_name: String,
    pub mode: BuildMode,
    /// Precached document served to navigations that fail at the network layer
    pub fallback_url: String,
    /// Final-path-segment patterns never answered by the fallback; one `*` allowed
    pub denylist: Vec<String>,
    pub retention_minutes: i64,
    pub drain_interval_secs: u64,
    pub connectivity_interval_secs: u64,
    pub precache_concurrency: usize,
    pub request_timeout_secs: Option<u64>,
    pub storage_dir: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            origin: "http://localhost:9000".to_string(),
            scope: "/".to_string(),
            script_url: "/sw.js".to_string(),
            api_base: "http://localhost:8000/api".to_string(),
            mutating_path: "/site".to_string(),
            queue_methods: vec!["POST".to_string()],
            queue_name: "bgSyncQueue".to_string(),
            mode: BuildMode::Production,
            fallback_url: "/index.html".to_string(),
            denylist: vec!["sw.js".to_string(), "workbox-*.js".to_string()],
            retention_minutes: DEFAULT_RETENTION_MINUTES,
            drain_interval_secs: DEFAULT_DRAIN_INTERVAL_SECS,
            connectivity_interval_secs: DEFAULT_CONNECTIVITY_INTERVAL_SECS,
            precache_concurrency: DEFAULT_PRECACHE_CONCURRENCY,
            request_timeout_secs: None,
            storage_dir: None,
        }
    }
}

impl Config {
    /// Load from the default location, falling back to defaults if absent
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    pub fn load_from(path: &std::path::Path) -> Result<Self> {
        if path.exists() {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;
            serde_json::from_str(&contents)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self) -> Result<()> {
        let path = Self::config_path()?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    pub fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        Ok(config_dir.join(APP_NAME).join(CONFIG_FILE))
    }

    /// Apply `SITECACHE_*` environment overrides
    pub fn apply_env(&mut self) -> Result<()> {
        if let Ok(origin) = std::env::var("SITECACHE_ORIGIN") {
            self.origin = origin;
        }
        if let Ok(api_base) = std::env::var("SITECACHE_API_BASE") {
            self.api_base = api_base;
        }
        if let Ok(mode) = std::env::var("SITECACHE_MODE") {
            self.mode = mode.parse()?;
        }
        Ok(())
    }

    /// Storage directory, one per origin so two apps never share a store
    pub fn storage_dir(&self) -> Result<PathBuf> {
        if let Some(ref dir) = self.storage_dir {
            return Ok(dir.clone());
        }
        let cache_dir = dirs::cache_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find cache directory"))?;
        let origin = self.origin_url()?;
        let mut host = origin.host_str().unwrap_or("local").to_string();
        if let Some(port) = origin.port() {
            host = format!("{}_{}", host, port);
        }
        Ok(cache_dir.join(APP_NAME).join(host))
    }

    pub fn origin_url(&self) -> Result<Url> {
        Url::parse(&self.origin).with_context(|| format!("Invalid origin URL: {}", self.origin))
    }

    /// Absolute scope URL; always ends with `/`
    pub fn scope_url(&self) -> Result<Url> {
        let mut scope = self.scope.clone();
        if !scope.ends_with('/') {
            scope.push('/');
        }
        self.origin_url()?
            .join(&scope)
            .with_context(|| format!("Invalid scope: {}", self.scope))
    }

    pub fn script_url(&self) -> Result<Url> {
        self.origin_url()?
            .join(&self.script_url)
            .with_context(|| format!("Invalid script URL: {}", self.script_url))
    }

    pub fn fallback_url(&self) -> Result<Url> {
        self.origin_url()?
            .join(&self.fallback_url)
            .with_context(|| format!("Invalid fallback URL: {}", self.fallback_url))
    }

    /// `<api_base><mutating_path>`, e.g. `https://api.example.org/v1/site`
    pub fn mutating_endpoint(&self) -> Result<Url> {
        let joined = format!(
            "{}/{}",
            self.api_base.trim_end_matches('/'),
            self.mutating_path.trim_start_matches('/')
        );
        Url::parse(&joined).with_context(|| format!("Invalid mutating endpoint: {}", joined))
    }

    pub fn queue_methods(&self) -> Result<Vec<Method>> {
        self.queue_methods
            .iter()
            .map(|m| {
                Method::from_bytes(m.to_uppercase().as_bytes())
                    .with_context(|| format!("Invalid queue method: {}", m))
            })
            .collect()
    }

    /// Retention window for queued requests, clamped to the range `validate` accepts
    pub fn retention(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.retention_minutes.clamp(1, MAX_RETENTION_MINUTES))
    }

    /// Check the configuration once so later URL accessors cannot fail
    pub fn validate(&self) -> Result<()> {
        self.scope_url()?;
        self.script_url()?;
        self.fallback_url()?;
        self.mutating_endpoint()?;
        self.queue_methods()?;
        if self.retention_minutes <= 0 {
            anyhow::bail!("retention_minutes must be positive");
        }
        if self.retention_minutes > MAX_RETENTION_MINUTES {
            anyhow::bail!("retention_minutes must be at most {}", MAX_RETENTION_MINUTES);
        }
        if self.precache_concurrency == 0 {
            anyhow::bail!("precache_concurrency must be at least 1");
        }
        Ok(())
    }
}
