//! Registration boundary.
//!
//! Registering installs the current build and activates it straight away. The events
//! emitted tell the host what happened:
//!
//! - first install: `registered`, `ready`, `cached`
//! - new build over an older one: `registered`, `updateAvailable`, `ready`, `updated`
//! - same build again: `registered`, `ready`
//! - failure: `registered`, possibly `updateAvailable`, then `error`

use tracing::{info, warn};

use crate::error::{WorkerError, WorkerResult};
use crate::generation::EvictionReport;
use crate::lifecycle::LifecycleEvent;
use crate::precache::InstallReport;
use crate::worker::{Report, Worker};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistrationKind {
    FirstInstall,
    Update { previous: String },
    Unchanged,
}

#[derive(Debug)]
pub struct Registration {
    pub kind: RegistrationKind,
    pub install: InstallReport,
    pub eviction: EvictionReport,
}

impl Registration {
    pub fn generation(&self) -> &str {
        &self.eviction.retained
    }
}

/// Install and activate `worker`'s build. A failure is reported to the sink as an
/// `error` event and returned as [`WorkerError::Registration`]; the host carries on
/// without offline support.
pub async fn register(worker: &Worker) -> WorkerResult<Registration> {
    let config = worker.config();
    info!(script = %config.script_url, scope = %config.scope, "Registering offline layer");
    worker.emit(LifecycleEvent::Registered);

    match run(worker).await {
        Ok(registration) => Ok(registration),
        Err(e) => {
            warn!(error = %e, "Offline layer registration failed");
            let detail = e.to_string();
            worker.emit(LifecycleEvent::Error { detail: detail.clone() });
            Err(WorkerError::Registration(detail))
        }
    }
}

async fn run(worker: &Worker) -> WorkerResult<Registration> {
    let current = worker.manifest().generation().to_string();
    let kind = match worker.precache().generations().active().await? {
        None => RegistrationKind::FirstInstall,
        Some(previous) if previous == current => RegistrationKind::Unchanged,
        Some(previous) => RegistrationKind::Update { previous },
    };

    if let RegistrationKind::Update { previous } = &kind {
        info!(previous = %previous, current = %current, "New build found");
        worker.emit(LifecycleEvent::UpdateAvailable);
    }

    let install = match worker.init().await?.report {
        Some(Report::Install(report)) => report,
        _ => InstallReport::default(),
    };
    let eviction = match worker.teardown().await?.report {
        Some(Report::Activate(report)) => report,
        _ => EvictionReport::default(),
    };

    worker.emit(LifecycleEvent::Ready);
    match kind {
        RegistrationKind::FirstInstall => worker.emit(LifecycleEvent::Cached),
        RegistrationKind::Update { .. } => worker.emit(LifecycleEvent::Updated),
        RegistrationKind::Unchanged => {}
    }

    Ok(Registration {
        kind,
        install,
        eviction,
    })
}
