//! Subcommand implementations.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use chrono::Utc;
use tracing::warn;

use sitecache_core::lifecycle::{NotificationLevel, TracingSink};
use sitecache_core::queue::DrainReport;
use sitecache_core::utils::{age_display, format_bytes, truncate_string};
use sitecache_core::{
    register, AssetManifest, BackgroundSync, Config, ConnectivityMonitor, FileStorage, Fetcher,
    HttpFetcher, LifecycleEvent, LifecycleSink, Method, PrecacheStore, ReplayQueue, Request,
    Storage, Worker, WorkerEvent,
};

use crate::args::{ConfigArgs, FetchArgs};

/// Width of the URL column in `queue` output
const URL_COLUMN_WIDTH: usize = 60;

/// Logs every event and prints user-facing notifications to stderr
struct ConsoleSink {
    log: TracingSink,
}

impl LifecycleSink for ConsoleSink {
    fn notify(&self, event: &LifecycleEvent) {
        self.log.notify(event);
        if let Some(notification) = event.notification() {
            let prefix = match notification.level {
                NotificationLevel::Info => "info",
                NotificationLevel::Positive => "ok",
                NotificationLevel::Warning => "warning",
            };
            eprintln!("[{}] {}", prefix, notification.message);
        }
    }
}

/// Everything a command needs: configuration, the store and the network
pub struct Host {
    config: Config,
    storage_dir: PathBuf,
    storage: Arc<dyn Storage>,
    fetcher: Arc<dyn Fetcher>,
}

impl Host {
    pub async fn open(config: Config) -> Result<Self> {
        let storage_dir = config.storage_dir()?;
        let storage = FileStorage::open(&storage_dir)
            .await
            .with_context(|| format!("Failed to open store: {}", storage_dir.display()))?;
        let fetcher = HttpFetcher::new(config.request_timeout_secs.map(Duration::from_secs))?;

        Ok(Self {
            config,
            storage_dir,
            storage: Arc::new(storage),
            fetcher: Arc::new(fetcher),
        })
    }

    pub fn storage_dir(&self) -> &Path {
        &self.storage_dir
    }

    fn queue(&self) -> ReplayQueue {
        ReplayQueue::new(
            self.storage.clone(),
            self.config.queue_name.clone(),
            self.config.retention(),
        )
    }

    fn worker(&self, manifest: Option<&Path>) -> Result<Worker> {
        let path = manifest.ok_or_else(|| anyhow!("No precache manifest given (use --manifest)"))?;
        let manifest = AssetManifest::load(&self.config.origin_url()?, path)
            .with_context(|| format!("Failed to load manifest: {}", path.display()))?;

        Worker::new(
            self.config.clone(),
            manifest,
            self.storage.clone(),
            self.fetcher.clone(),
            Arc::new(ConsoleSink { log: TracingSink }),
        )
    }
}

pub fn show_config(config: &Config, args: &ConfigArgs) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(config)?);
    if args.save {
        config.save()?;
        println!("Saved to {}", Config::config_path()?.display());
    }
    Ok(())
}

pub async fn install(host: &Host, manifest: Option<&Path>) -> Result<()> {
    let worker = host.worker(manifest)?;
    let registration = register(&worker).await?;

    let install = &registration.install;
    println!("Generation {} ({} assets)", registration.generation(), install.total());
    println!(
        "  fetched {}, reused {}, already cached {}",
        install.fetched, install.reused, install.already_present
    );
    for tag in &registration.eviction.evicted {
        println!("  evicted {}", tag);
    }
    Ok(())
}

pub async fn status(host: &Host) -> Result<()> {
    let precache = PrecacheStore::new(host.storage.clone());
    let generations = precache.generations();
    let active = generations.active().await?;

    println!("Store:  {}", host.storage_dir.display());
    println!("Origin: {} ({:?})", host.config.origin, host.config.mode);
    println!("Active generation: {}", active.as_deref().unwrap_or("none"));
    for tag in generations.list_generations().await? {
        let marker = if active.as_deref() == Some(tag.as_str()) { "*" } else { " " };
        println!("  {} {}", marker, tag);
    }

    let queue = host.queue();
    let entries = queue.entries().await?;
    println!("Queue '{}': {} request(s)", queue.name(), entries.len());
    if let Some(oldest) = entries.first() {
        println!("  oldest queued {}", age_display(oldest.enqueued_at, Utc::now()));
    }
    Ok(())
}

pub async fn queue(host: &Host) -> Result<()> {
    let queue = host.queue();
    let entries = queue.entries().await?;
    if entries.is_empty() {
        println!("Queue '{}' is empty", queue.name());
        return Ok(());
    }

    let now = Utc::now();
    for entry in entries {
        let expired = if entry.is_expired(now, queue.retention()) { " (expired)" } else { "" };
        println!(
            "#{:<5} {:<6} {:<width$} {:>10}  {}{}",
            entry.seq,
            entry.method,
            truncate_string(&entry.url, URL_COLUMN_WIDTH),
            format_bytes(entry.body.len() as u64),
            age_display(entry.enqueued_at, now),
            expired,
            width = URL_COLUMN_WIDTH,
        );
    }
    Ok(())
}

/// Replay the queue, reporting every replayed or expired entry to `sink`
async fn drain_queue(queue: &ReplayQueue, fetcher: &dyn Fetcher, sink: &dyn LifecycleSink) -> Result<DrainReport> {
    let report = queue.drain(fetcher, Utc::now()).await?;
    for event in report.notifications() {
        sink.notify(&event);
    }
    Ok(report)
}

pub async fn drain(host: &Host) -> Result<()> {
    let sink = ConsoleSink { log: TracingSink };
    let report = drain_queue(&host.queue(), host.fetcher.as_ref(), &sink).await?;

    if report.skipped {
        println!("A drain is already running");
        return Ok(());
    }
    if report.is_noop() {
        println!("Nothing to replay");
        return Ok(());
    }

    println!(
        "Replayed {}, expired {}, still pending {}",
        report.replayed(),
        report.expired(),
        report.pending()
    );
    if report.dropped > 0 {
        println!("Dropped {} unreadable record(s)", report.dropped);
    }
    if let Some(failure) = report.failure {
        println!("Stopped early: {}", failure);
    }
    Ok(())
}

fn parse_header(raw: &str) -> Result<(String, String)> {
    let (name, value) = raw
        .split_once(':')
        .ok_or_else(|| anyhow!("Invalid header '{}', expected 'name: value'", raw))?;
    let name = name.trim();
    if name.is_empty() {
        bail!("Invalid header '{}', empty name", raw);
    }
    Ok((name.to_string(), value.trim().to_string()))
}

pub async fn fetch(host: &Host, manifest: Option<&Path>, args: FetchArgs) -> Result<()> {
    let worker = host.worker(manifest)?;
    if let Err(e) = register(&worker).await {
        warn!(error = %e, "Continuing without offline support");
    }

    let url = host
        .config
        .origin_url()?
        .join(&args.url)
        .with_context(|| format!("Invalid URL: {}", args.url))?;
    let method = Method::from_bytes(args.method.to_uppercase().as_bytes())
        .with_context(|| format!("Invalid method: {}", args.method))?;

    let mut request = if args.navigate {
        Request::navigate(url)
    } else {
        Request::new(method.clone(), url)
    };
    request.method = method;
    if let Some(data) = args.data {
        request.body = data.into_bytes();
    }
    for raw in &args.headers {
        let (name, value) = parse_header(raw)?;
        request = request.with_header(name, value);
    }

    let effects = worker
        .dispatch(WorkerEvent::Fetch(request))
        .await
        .context("Request failed")?;
    let response = effects
        .response
        .ok_or_else(|| anyhow!("No response produced"))?;

    eprintln!(
        "{} ({:?}, {})",
        response.status,
        response.source,
        format_bytes(response.body.len() as u64)
    );
    for (name, value) in &response.headers {
        eprintln!("{}: {}", name, value);
    }
    if args.body {
        std::io::stdout().write_all(&response.body)?;
    }
    Ok(())
}

pub async fn run(host: &Host, manifest: Option<&Path>) -> Result<()> {
    let worker = Arc::new(host.worker(manifest)?);
    if let Err(e) = register(&worker).await {
        warn!(error = %e, "Continuing without offline support");
    }

    let monitor = ConnectivityMonitor::new(
        host.fetcher.clone(),
        host.config.origin_url()?,
        Duration::from_secs(host.config.connectivity_interval_secs),
    );
    let sync = BackgroundSync::start(
        worker,
        Duration::from_secs(host.config.drain_interval_secs),
        Some(monitor),
    );

    eprintln!("Running; press Ctrl-C to stop");
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;

    sync.shutdown().await;
    Ok(())
}
