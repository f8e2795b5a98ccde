//! Background tasks that keep the replay queue moving.
//!
//! A [`BackgroundSync`] task owns the drain schedule: it drains on every connectivity
//! restore and on a fixed interval while online. A [`ConnectivityMonitor`] turns polling
//! of the origin into connectivity-change messages for that task.

use std::sync::Arc;
use std::time::Duration;

use reqwest::{Method, Url};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::net::{Fetcher, Request};
use crate::worker::{Connectivity, Report, Worker, WorkerEvent};

/// Buffer size for connectivity messages
const CHANNEL_BUFFER_SIZE: usize = 16;

/// Polls a URL and reports connectivity changes. Any HTTP response means online.
pub struct ConnectivityMonitor {
    fetcher: Arc<dyn Fetcher>,
    target: Url,
    interval: Duration,
}

impl ConnectivityMonitor {
    pub fn new(fetcher: Arc<dyn Fetcher>, target: Url, interval: Duration) -> Self {
        Self {
            fetcher,
            target,
            interval,
        }
    }

    pub async fn check(&self) -> Connectivity {
        let request = Request::new(Method::HEAD, self.target.clone());
        match self.fetcher.fetch(&request).await {
            Ok(_) => Connectivity::Online,
            Err(e) => {
                debug!(url = %self.target, error = %e, "Connectivity check failed");
                Connectivity::Offline
            }
        }
    }

    /// Only changes are sent; the first result is always sent
    fn spawn(self, tx: mpsc::Sender<Connectivity>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut last = None;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = shutdown.changed() => break,
                }
                let state = self.check().await;
                if last == Some(state) {
                    continue;
                }
                last = Some(state);
                if tx.send(state).await.is_err() {
                    debug!("Connectivity receiver closed, stopping connectivity monitor");
                    break;
                }
            }
        })
    }
}

/// Handle to the running background tasks
pub struct BackgroundSync {
    tx: mpsc::Sender<Connectivity>,
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl BackgroundSync {
    /// Start the drain loop, and the connectivity monitor if one is given
    pub fn start(worker: Arc<Worker>, drain_interval: Duration, monitor: Option<ConnectivityMonitor>) -> Self {
        let (tx, rx) = mpsc::channel(CHANNEL_BUFFER_SIZE);
        let (shutdown, shutdown_rx) = watch::channel(false);

        let mut tasks = vec![tokio::spawn(drain_loop(worker, drain_interval, rx, shutdown_rx.clone()))];
        if let Some(monitor) = monitor {
            tasks.push(monitor.spawn(tx.clone(), shutdown_rx));
        }

        Self { tx, shutdown, tasks }
    }

    /// Sender for connectivity changes observed by the host
    pub fn connectivity(&self) -> mpsc::Sender<Connectivity> {
        self.tx.clone()
    }

    /// Stop all tasks. An in-flight drain finishes first.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for task in self.tasks {
            if let Err(e) = task.await {
                error!(error = %e, "Background task panicked");
            }
        }
    }
}

async fn drain_loop(
    worker: Arc<Worker>,
    drain_interval: Duration,
    mut rx: mpsc::Receiver<Connectivity>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(drain_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        let event = tokio::select! {
            _ = shutdown.changed() => break,
            change = rx.recv() => match change {
                Some(change) => WorkerEvent::Connectivity(change),
                None => break,
            },
            _ = ticker.tick() => {
                if !worker.is_online() {
                    debug!("Offline, skipping scheduled drain");
                    continue;
                }
                WorkerEvent::Sync
            }
        };

        let kind = event.kind();
        match worker.dispatch(event).await {
            Ok(effects) => {
                if let Some(Report::Drain(report)) = effects.report {
                    if !report.is_noop() {
                        info!(
                            trigger = kind,
                            replayed = report.replayed(),
                            expired = report.expired(),
                            pending = report.pending(),
                            "Replay queue drained"
                        );
                    }
                }
            }
            Err(e) => warn!(trigger = kind, error = %e, "Background drain failed"),
        }
    }
    debug!("Background sync stopped");
}
