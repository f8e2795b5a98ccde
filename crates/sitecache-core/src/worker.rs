//! The worker: one process-wide object owning the precache, the replay queue and the
//! routing policy, driven by explicit events.
//!
//! [`Worker::dispatch`] is the single entry point. Each event is handled by one method
//! that returns [`Effects`] (an optional response, lifecycle notifications, and a report
//! of what changed in storage); the dispatcher forwards the notifications to the sink.
//! The worker's own state machine is the pure function [`WorkerState::transition`].

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::{WorkerError, WorkerResult};
use crate::fallback::NavigationFallback;
use crate::generation::EvictionReport;
use crate::lifecycle::{LifecycleEvent, LifecycleSink};
use crate::manifest::AssetManifest;
use crate::net::{Fetcher, Request, Response, ResponseSource};
use crate::precache::{InstallReport, PrecacheStore};
use crate::queue::{DrainReport, ReplayQueue};
use crate::router::{Route, Router};
use crate::storage::Storage;

/// Header on the synthetic response returned for a queued request
pub const QUEUED_HEADER: &str = "x-sitecache-queued";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Parsed,
    Installing,
    Installed,
    Activating,
    Activated,
    /// Replaced by a newer worker
    Redundant,
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            WorkerState::Parsed => "parsed",
            WorkerState::Installing => "installing",
            WorkerState::Installed => "installed",
            WorkerState::Activating => "activating",
            WorkerState::Activated => "activated",
            WorkerState::Redundant => "redundant",
        };
        f.write_str(name)
    }
}

/// Steps of the install/activate lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    InstallStarted,
    InstallSucceeded,
    InstallFailed,
    ActivateStarted,
    ActivateSucceeded,
    ActivateFailed,
    Superseded,
}

impl WorkerState {
    pub fn transition(self, phase: Phase) -> WorkerResult<WorkerState> {
        use Phase::*;
        use WorkerState::*;

        let next = match (self, phase) {
            (Redundant, _) => None,
            (_, Superseded) => Some(Redundant),
            (Parsed, InstallStarted) => Some(Installing),
            (Installing, InstallSucceeded) => Some(Installed),
            (Installing, InstallFailed) => Some(Parsed),
            (Installed, ActivateStarted) => Some(Activating),
            (Activating, ActivateSucceeded) => Some(Activated),
            (Activating, ActivateFailed) => Some(Installed),
            _ => None,
        };

        next.ok_or_else(|| WorkerError::InvalidTransition {
            from: self.to_string(),
            event: format!("{:?}", phase),
        })
    }

    /// Only an active worker intercepts requests
    pub fn controls_requests(&self) -> bool {
        matches!(self, WorkerState::Activated)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Connectivity {
    Online,
    Offline,
}

#[derive(Debug, Clone)]
pub enum WorkerEvent {
    Install,
    Activate,
    Fetch(Request),
    Connectivity(Connectivity),
    /// Periodic replay trigger
    Sync,
}

impl WorkerEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            WorkerEvent::Install => "install",
            WorkerEvent::Activate => "activate",
            WorkerEvent::Fetch(_) => "fetch",
            WorkerEvent::Connectivity(_) => "connectivity",
            WorkerEvent::Sync => "sync",
        }
    }
}

#[derive(Debug)]
pub enum Report {
    Install(InstallReport),
    Activate(EvictionReport),
    Drain(DrainReport),
}

/// Everything an event handler produced
#[derive(Debug, Default)]
pub struct Effects {
    pub response: Option<Response>,
    pub notifications: Vec<LifecycleEvent>,
    pub report: Option<Report>,
    /// Failure that was logged without failing the event
    pub failure: Option<WorkerError>,
}

impl Effects {
    fn respond(response: Response) -> Self {
        Self {
            response: Some(response),
            ..Default::default()
        }
    }
}

pub struct Worker {
    config: Config,
    manifest: AssetManifest,
    router: Router,
    fallback: NavigationFallback,
    precache: PrecacheStore,
    queue: ReplayQueue,
    fetcher: Arc<dyn Fetcher>,
    sink: Arc<dyn LifecycleSink>,
    state: Mutex<WorkerState>,
    online: AtomicBool,
}

impl Worker {
    pub fn new(
        config: Config,
        manifest: AssetManifest,
        storage: Arc<dyn Storage>,
        fetcher: Arc<dyn Fetcher>,
        sink: Arc<dyn LifecycleSink>,
    ) -> Result<Self> {
        config.validate()?;
        let router = Router::from_config(&config)?;
        let fallback = NavigationFallback::new(&manifest, &config.fallback_url()?);
        let queue = ReplayQueue::new(storage.clone(), config.queue_name.clone(), config.retention());

        Ok(Self {
            router,
            fallback,
            precache: PrecacheStore::new(storage),
            queue,
            manifest,
            config,
            fetcher,
            sink,
            state: Mutex::new(WorkerState::Parsed),
            online: AtomicBool::new(true),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn manifest(&self) -> &AssetManifest {
        &self.manifest
    }

    pub fn precache(&self) -> &PrecacheStore {
        &self.precache
    }

    pub fn queue(&self) -> &ReplayQueue {
        &self.queue
    }

    pub fn state(&self) -> WorkerState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    fn advance(&self, phase: Phase) -> WorkerResult<WorkerState> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let next = state.transition(phase)?;
        debug!(from = %*state, to = %next, "Worker state transition");
        *state = next;
        Ok(next)
    }

    pub fn emit(&self, event: LifecycleEvent) {
        self.sink.notify(&event);
    }

    /// Route an event to its handler and deliver the resulting notifications.
    /// The returned future is `Send`, so it can be driven from a spawned task.
    pub fn dispatch(&self, event: WorkerEvent) -> BoxFuture<'_, WorkerResult<Effects>> {
        async move {
            let kind = event.kind();
            let effects = match event {
                WorkerEvent::Install => self.init().await?,
                WorkerEvent::Activate => self.teardown().await?,
                WorkerEvent::Fetch(request) => self.handle_fetch(&request, Utc::now()).await?,
                WorkerEvent::Connectivity(change) => self.handle_connectivity(change, Utc::now()).await?,
                WorkerEvent::Sync => self.handle_sync(Utc::now()).await?,
            };
            debug!(event = kind, notifications = effects.notifications.len(), "Dispatched worker event");
            for notification in &effects.notifications {
                self.sink.notify(notification);
            }
            Ok(effects)
        }
        .boxed()
    }

    /// Install hook: populate the current generation
    pub async fn init(&self) -> WorkerResult<Effects> {
        self.advance(Phase::InstallStarted)?;
        match self
            .precache
            .install(&self.manifest, self.fetcher.as_ref(), self.config.precache_concurrency)
            .await
        {
            Ok(report) => {
                self.advance(Phase::InstallSucceeded)?;
                Ok(Effects {
                    report: Some(Report::Install(report)),
                    ..Default::default()
                })
            }
            Err(e) => {
                self.advance(Phase::InstallFailed)?;
                Err(e)
            }
        }
    }

    /// Activation hook: free superseded generations and start controlling requests.
    /// Activation follows install immediately; there is no waiting phase.
    pub async fn teardown(&self) -> WorkerResult<Effects> {
        self.advance(Phase::ActivateStarted)?;
        match self.precache.generations().activate(self.manifest.generation()).await {
            Ok(report) => {
                self.advance(Phase::ActivateSucceeded)?;
                info!(
                    generation = %report.retained,
                    evicted = report.evicted.len(),
                    "Worker activated"
                );
                Ok(Effects {
                    report: Some(Report::Activate(report)),
                    ..Default::default()
                })
            }
            Err(e) => {
                self.advance(Phase::ActivateFailed)?;
                Err(e)
            }
        }
    }

    /// Mark this worker as replaced by a newer one
    pub fn supersede(&self) -> WorkerResult<()> {
        self.advance(Phase::Superseded)?;
        Ok(())
    }

    pub async fn handle_fetch(&self, request: &Request, now: DateTime<Utc>) -> WorkerResult<Effects> {
        if !self.state().controls_requests() {
            return Ok(Effects::respond(self.network(request).await?));
        }

        let route = self.router.classify(&self.manifest, request);
        debug!(url = %request.url, method = %request.method, route = route.name(), "Routing request");

        match route {
            Route::Precached(entry) => {
                match self.precache.lookup(self.manifest.generation(), entry).await? {
                    Some(response) => Ok(Effects::respond(response)),
                    None => {
                        warn!(path = %entry.path, "Precached asset missing from store, using network");
                        Ok(Effects::respond(self.network(request).await?))
                    }
                }
            }
            Route::Navigation => {
                let response = self
                    .fallback
                    .handle(request, self.fetcher.as_ref(), &self.precache, self.manifest.generation())
                    .await?;
                Ok(Effects::respond(response))
            }
            Route::ReplayQueue => self.network_or_queue(request, now).await,
            Route::Passthrough => Ok(Effects::respond(self.network(request).await?)),
        }
    }

    async fn network(&self, request: &Request) -> WorkerResult<Response> {
        Ok(self.fetcher.fetch(request).await?)
    }

    /// Only a transport failure queues the request; HTTP errors go back to the caller
    async fn network_or_queue(&self, request: &Request, now: DateTime<Utc>) -> WorkerResult<Effects> {
        let error = match self.fetcher.fetch(request).await {
            Ok(response) => return Ok(Effects::respond(response)),
            Err(e) => e,
        };
        debug!(url = %request.url, error = %error, "Mutating request failed at the network layer");

        let entry = self.queue.enqueue(request, now).await?;
        let response = Response::new(202, Vec::new(), ResponseSource::Queued)
            .with_header(QUEUED_HEADER, entry.seq.to_string());

        Ok(Effects {
            response: Some(response),
            notifications: vec![LifecycleEvent::RequestQueued { url: entry.url }],
            ..Default::default()
        })
    }

    /// Record a connectivity change. Going online drains the queue; a failed drain is
    /// logged and reported in [`Effects::failure`] and the change is kept, so the next
    /// timer or manual drain retries.
    pub async fn handle_connectivity(&self, change: Connectivity, now: DateTime<Utc>) -> WorkerResult<Effects> {
        let online = change == Connectivity::Online;
        let was_online = self.online.swap(online, Ordering::SeqCst);
        if online == was_online {
            return Ok(Effects::default());
        }

        if !online {
            return Ok(Effects {
                notifications: vec![LifecycleEvent::Offline],
                ..Default::default()
            });
        }

        let mut effects = match self.handle_sync(now).await {
            Ok(effects) => effects,
            Err(e) => {
                warn!(error = %e, "Replay after reconnect failed");
                Effects {
                    failure: Some(e),
                    ..Default::default()
                }
            }
        };
        effects.notifications.insert(0, LifecycleEvent::Online);
        Ok(effects)
    }

    /// Drain the replay queue
    pub async fn handle_sync(&self, now: DateTime<Utc>) -> WorkerResult<Effects> {
        let report = self.queue.drain(self.fetcher.as_ref(), now).await?;
        Ok(Effects {
            notifications: report.notifications(),
            report: Some(Report::Drain(report)),
            ..Default::default()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path_transitions() {
        let state = WorkerState::Parsed;
        let state = state.transition(Phase::InstallStarted).unwrap();
        assert_eq!(state, WorkerState::Installing);
        let state = state.transition(Phase::InstallSucceeded).unwrap();
        assert_eq!(state, WorkerState::Installed);
        let state = state.transition(Phase::ActivateStarted).unwrap();
        let state = state.transition(Phase::ActivateSucceeded).unwrap();
        assert_eq!(state, WorkerState::Activated);
        assert!(state.controls_requests());
    }

    #[test]
    fn test_failed_install_can_retry() {
        let state = WorkerState::Installing.transition(Phase::InstallFailed).unwrap();
        assert_eq!(state, WorkerState::Parsed);
        assert!(state.transition(Phase::InstallStarted).is_ok());
    }

    #[test]
    fn test_failed_activation_returns_to_installed() {
        let state = WorkerState::Activating.transition(Phase::ActivateFailed).unwrap();
        assert_eq!(state, WorkerState::Installed);
    }

    #[test]
    fn test_invalid_transitions() {
        assert!(WorkerState::Parsed.transition(Phase::ActivateStarted).is_err());
        assert!(WorkerState::Activated.transition(Phase::InstallStarted).is_err());
        assert!(WorkerState::Installed.transition(Phase::InstallSucceeded).is_err());
        assert!(WorkerState::Redundant.transition(Phase::Superseded).is_err());
        assert!(!WorkerState::Installed.controls_requests());
    }

    #[test]
    fn test_superseded_from_any_live_state() {
        for state in [
            WorkerState::Parsed,
            WorkerState::Installing,
            WorkerState::Installed,
            WorkerState::Activating,
            WorkerState::Activated,
        ] {
            assert_eq!(state.transition(Phase::Superseded).unwrap(), WorkerState::Redundant);
        }
    }
}
