//! Offline layer for the map viewer.
//!
//! `sitecache-core` precaches the build's asset manifest, answers navigations with a
//! cached fallback document when the network is gone, and durably queues failed
//! mutating API calls for later replay.
//!
//! The platform surfaces are traits so the logic runs the same against a real origin
//! and against in-memory fakes:
//!
//! - [`storage::Storage`]: durable key/value store (`get`, `put`, `delete`, `list_keys`)
//! - [`net::Fetcher`]: the live network
//! - [`lifecycle::LifecycleSink`]: where lifecycle notifications go
//!
//! [`worker::Worker`] ties the pieces together and dispatches worker events.

pub mod config;
pub mod error;
pub mod fallback;
pub mod generation;
pub mod lifecycle;
pub mod manifest;
pub mod net;
pub mod precache;
pub mod queue;
pub mod registration;
pub mod router;
pub mod runtime;
pub mod storage;
pub mod utils;
pub mod worker;

pub use reqwest::{Method, Url};

pub use config::{BuildMode, Config};
pub use error::{StorageError, TransportError, WorkerError, WorkerResult};
pub use lifecycle::{LifecycleEvent, LifecycleSink, Notification};
pub use manifest::{AssetEntry, AssetManifest};
pub use net::{Fetcher, HttpFetcher, Request, RequestMode, Response, ResponseSource};
pub use precache::PrecacheStore;
pub use queue::{QueuedRequest, ReplayQueue};
pub use registration::{register, Registration, RegistrationKind};
pub use runtime::{BackgroundSync, ConnectivityMonitor};
pub use storage::{FileStorage, MemoryStorage, Storage};
pub use worker::{Connectivity, Effects, Report, Worker, WorkerEvent, WorkerState};
