//! Background replay queue for mutating requests that failed at the network layer.
//!
//! Entries are stored under `queue/<name>/<seq>` with a zero-padded sequence, so key
//! order is enqueue order. Each entry moves `pending → in-flight → replayed`, back to
//! `pending` when the replay fails at the network layer, or to `expired` once it is
//! older than the retention window.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use reqwest::{Method, Url};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{truncate_body, StorageError, WorkerError, WorkerResult};
use crate::lifecycle::LifecycleEvent;
use crate::net::{Fetcher, Request, RequestMode};
use crate::storage::{load_json, Storage};

const QUEUE_PREFIX: &str = "queue/";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueuedRequest {
    pub seq: u64,
    pub method: String,
    pub url: String,
    pub headers: Vec<(String, String)>,
    #[serde(with = "hex::serde")]
    pub body: Vec<u8>,
    pub enqueued_at: DateTime<Utc>,
}

impl QueuedRequest {
    fn capture(seq: u64, request: &Request, now: DateTime<Utc>) -> Self {
        Self {
            seq,
            method: request.method.as_str().to_string(),
            url: request.url.to_string(),
            headers: request.headers.clone(),
            body: request.body.clone(),
            enqueued_at: now,
        }
    }

    /// Rebuild the original request for replay
    pub fn to_request(&self) -> WorkerResult<Request> {
        let method = Method::from_bytes(self.method.as_bytes()).map_err(|e| WorkerError::ReplayFailure {
            seq: self.seq,
            reason: format!("invalid method {}: {}", self.method, e),
        })?;
        let url = Url::parse(&self.url).map_err(|e| WorkerError::ReplayFailure {
            seq: self.seq,
            reason: format!("invalid url {}: {}", self.url, e),
        })?;
        Ok(Request {
            method,
            url,
            headers: self.headers.clone(),
            body: self.body.clone(),
            mode: RequestMode::Subresource,
        })
    }

    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        now - self.enqueued_at
    }

    pub fn is_expired(&self, now: DateTime<Utc>, retention: Duration) -> bool {
        self.age(now) >= retention
    }
}

/// Where an entry ended up after a drain
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplayState {
    /// Still queued: its replay failed, or an earlier entry's did
    Pending,
    Replayed,
    Expired,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplayOutcome {
    pub seq: u64,
    pub url: String,
    pub state: ReplayState,
}

#[derive(Debug, Default)]
pub struct DrainReport {
    /// Another drain was already running; nothing was done
    pub skipped: bool,
    /// Sequence numbers sent to the network, in order
    pub attempted: Vec<u64>,
    pub outcomes: Vec<ReplayOutcome>,
    /// Unreadable records removed from the queue
    pub dropped: usize,
    /// The failure that stopped the drain, if any
    pub failure: Option<WorkerError>,
}

impl DrainReport {
    fn count(&self, state: ReplayState) -> usize {
        self.outcomes.iter().filter(|o| o.state == state).count()
    }

    pub fn replayed(&self) -> usize {
        self.count(ReplayState::Replayed)
    }

    pub fn expired(&self) -> usize {
        self.count(ReplayState::Expired)
    }

    pub fn pending(&self) -> usize {
        self.count(ReplayState::Pending)
    }

    pub fn is_noop(&self) -> bool {
        self.outcomes.is_empty() && self.attempted.is_empty() && self.dropped == 0
    }

    /// Lifecycle events for the entries that left the queue, in drain order
    pub fn notifications(&self) -> Vec<LifecycleEvent> {
        self.outcomes
            .iter()
            .filter_map(|outcome| match outcome.state {
                ReplayState::Replayed => Some(LifecycleEvent::RequestReplayed {
                    url: outcome.url.clone(),
                }),
                ReplayState::Expired => Some(LifecycleEvent::RequestExpired {
                    url: outcome.url.clone(),
                }),
                ReplayState::Pending => None,
            })
            .collect()
    }
}

pub struct ReplayQueue {
    storage: Arc<dyn Storage>,
    name: String,
    retention: Duration,
    /// Lowest sequence this queue will hand out next
    next_seq: Mutex<Option<u64>>,
    drain_lock: Mutex<()>,
}

impl ReplayQueue {
    pub fn new(storage: Arc<dyn Storage>, name: impl Into<String>, retention: Duration) -> Self {
        Self {
            storage,
            name: name.into(),
            retention,
            next_seq: Mutex::new(None),
            drain_lock: Mutex::new(()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn retention(&self) -> Duration {
        self.retention
    }

    fn prefix(&self) -> String {
        format!("{}{}/", QUEUE_PREFIX, self.name)
    }

    fn entry_key(&self, seq: u64) -> String {
        format!("{}{:020}", self.prefix(), seq)
    }

    fn seq_of(&self, key: &str) -> Option<u64> {
        key.strip_prefix(&self.prefix())?.parse().ok()
    }

    /// Persist a failed request. Returns the stored entry.
    ///
    /// Other queues may share the store (another process on the same directory), so
    /// the sequence is re-derived from the stored keys on every call and an existing
    /// entry is never overwritten.
    pub async fn enqueue(&self, request: &Request, now: DateTime<Utc>) -> WorkerResult<QueuedRequest> {
        let mut next_seq = self.next_seq.lock().await;
        let keys = self.storage.list_keys(&self.prefix()).await?;
        let listed = keys.iter().filter_map(|k| self.seq_of(k)).max().map_or(1, |max| max + 1);
        let mut seq = listed.max(next_seq.unwrap_or(1));

        let entry = loop {
            let entry = QueuedRequest::capture(seq, request, now);
            let bytes = serde_json::to_vec(&entry).map_err(StorageError::from)?;
            if self.storage.put_new(&self.entry_key(seq), bytes).await? {
                break entry;
            }
            debug!(queue = %self.name, seq = seq, "Sequence taken by another writer");
            seq += 1;
        };
        *next_seq = Some(seq + 1);

        info!(queue = %self.name, seq = seq, url = %entry.url, "Queued request for background replay");
        Ok(entry)
    }

    /// Queued entries in enqueue order. Unreadable records are skipped.
    pub async fn entries(&self) -> WorkerResult<Vec<QueuedRequest>> {
        let (entries, _) = self.load_all().await?;
        Ok(entries)
    }

    pub async fn len(&self) -> WorkerResult<usize> {
        Ok(self.storage.list_keys(&self.prefix()).await?.len())
    }

    pub async fn is_empty(&self) -> WorkerResult<bool> {
        Ok(self.len().await? == 0)
    }

    async fn load_all(&self) -> WorkerResult<(Vec<QueuedRequest>, Vec<String>)> {
        let mut entries = Vec::new();
        let mut unreadable = Vec::new();
        for key in self.storage.list_keys(&self.prefix()).await? {
            match load_json::<QueuedRequest>(self.storage.as_ref(), &key).await {
                Ok(Some(entry)) => entries.push(entry),
                Ok(None) => {}
                Err(e) => {
                    warn!(key = %key, error = %e, "Unreadable queue record");
                    unreadable.push(key);
                }
            }
        }
        Ok((entries, unreadable))
    }

    /// Replay queued requests in FIFO order.
    ///
    /// Expired entries are discarded first. Any HTTP response counts as a successful
    /// replay; a transport failure leaves the entry pending and ends the drain so later
    /// mutations are never applied ahead of earlier ones. If a drain is already
    /// running the call returns immediately with `skipped` set.
    pub async fn drain(&self, fetcher: &dyn Fetcher, now: DateTime<Utc>) -> WorkerResult<DrainReport> {
        let Ok(_guard) = self.drain_lock.try_lock() else {
            debug!(queue = %self.name, "Drain already in progress");
            return Ok(DrainReport {
                skipped: true,
                ..Default::default()
            });
        };

        let mut report = DrainReport::default();
        let (entries, unreadable) = self.load_all().await?;

        for key in unreadable {
            if self.storage.delete(&key).await? {
                report.dropped += 1;
            }
        }
        if entries.is_empty() {
            return Ok(report);
        }

        let (expired, live): (Vec<_>, Vec<_>) = entries
            .into_iter()
            .partition(|e| e.is_expired(now, self.retention));

        for entry in expired {
            self.storage.delete(&self.entry_key(entry.seq)).await?;
            let discard = WorkerError::ExpiryDiscard {
                seq: entry.seq,
                url: entry.url.clone(),
            };
            warn!(queue = %self.name, age_minutes = entry.age(now).num_minutes(), "{}", discard);
            report.outcomes.push(ReplayOutcome {
                seq: entry.seq,
                url: entry.url,
                state: ReplayState::Expired,
            });
        }

        let mut stopped = false;
        for entry in live {
            if stopped {
                report.outcomes.push(ReplayOutcome {
                    seq: entry.seq,
                    url: entry.url,
                    state: ReplayState::Pending,
                });
                continue;
            }

            let request = match entry.to_request() {
                Ok(request) => request,
                Err(e) => {
                    warn!(error = %e, "Dropping queued request that cannot be rebuilt");
                    self.storage.delete(&self.entry_key(entry.seq)).await?;
                    report.dropped += 1;
                    continue;
                }
            };

            debug!(queue = %self.name, seq = entry.seq, url = %entry.url, "Replaying queued request");
            report.attempted.push(entry.seq);

            match fetcher.fetch(&request).await {
                Ok(response) => {
                    if !response.is_success() {
                        warn!(
                            seq = entry.seq,
                            status = response.status,
                            body = %truncate_body(&response.body),
                            "Replayed request was rejected by the server"
                        );
                    }
                    self.storage.delete(&self.entry_key(entry.seq)).await?;
                    info!(queue = %self.name, seq = entry.seq, status = response.status, "Replayed queued request");
                    report.outcomes.push(ReplayOutcome {
                        seq: entry.seq,
                        url: entry.url,
                        state: ReplayState::Replayed,
                    });
                }
                Err(e) => {
                    let failure = WorkerError::ReplayFailure {
                        seq: entry.seq,
                        reason: e.reason,
                    };
                    warn!(queue = %self.name, "{}; will retry on next drain", failure);
                    report.failure = Some(failure);
                    report.outcomes.push(ReplayOutcome {
                        seq: entry.seq,
                        url: entry.url,
                        state: ReplayState::Pending,
                    });
                    stopped = true;
                }
            }
        }

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex as StdMutex;

    use async_trait::async_trait;

    use crate::error::TransportError;
    use crate::net::{Response, ResponseSource};
    use crate::storage::MemoryStorage;

    /// Records replay order; fails at the network layer while `offline` is set
    #[derive(Default)]
    struct RecordingApi {
        offline: AtomicBool,
        fail_body: StdMutex<Option<String>>,
        seen: StdMutex<Vec<String>>,
    }

    impl RecordingApi {
        fn seen_bodies(&self) -> Vec<String> {
            self.seen.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Fetcher for RecordingApi {
        async fn fetch(&self, request: &Request) -> Result<Response, TransportError> {
            let body = String::from_utf8_lossy(&request.body).into_owned();
            if self.offline.load(Ordering::SeqCst)
                || self.fail_body.lock().unwrap().as_deref() == Some(body.as_str())
            {
                return Err(TransportError::new(request.url.as_str(), "network unreachable"));
            }
            self.seen.lock().unwrap().push(body);
            Ok(Response::new(201, "", ResponseSource::Network))
        }
    }

    fn site_post(body: &str) -> Request {
        Request::post(Url::parse("https://api.example.org/v1/site").unwrap(), body)
            .with_header("content-type", "application/json")
            .with_header("authorization", "Bearer abc")
    }

    fn queue(storage: Arc<dyn Storage>) -> ReplayQueue {
        ReplayQueue::new(storage, "bgSyncQueue", Duration::hours(24))
    }

    #[tokio::test]
    async fn test_enqueue_preserves_request() {
        let storage = Arc::new(MemoryStorage::new());
        let queue = queue(storage.clone());
        let now = Utc::now();
        let request = site_post(r#"{"name":"Ridge"}"#);

        let entry = queue.enqueue(&request, now).await.unwrap();
        assert_eq!(entry.seq, 1);

        let stored = queue.entries().await.unwrap();
        assert_eq!(stored.len(), 1);
        let rebuilt = stored[0].to_request().unwrap();
        assert_eq!(rebuilt.method, Method::POST);
        assert_eq!(rebuilt.url, request.url);
        assert_eq!(rebuilt.headers, request.headers);
        assert_eq!(rebuilt.body, request.body);
        assert_eq!(stored[0].enqueued_at, now);
    }

    #[tokio::test]
    async fn test_sequence_recovered_after_restart() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let now = Utc::now();
        {
            let first = queue(storage.clone());
            first.enqueue(&site_post("a"), now).await.unwrap();
            first.enqueue(&site_post("b"), now).await.unwrap();
        }
        let second = queue(storage);
        let entry = second.enqueue(&site_post("c"), now).await.unwrap();
        assert_eq!(entry.seq, 3);
    }

    #[tokio::test]
    async fn test_queues_sharing_a_store_never_overwrite() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let daemon = queue(storage.clone());
        let cli = queue(storage.clone());
        let now = Utc::now();

        assert_eq!(daemon.enqueue(&site_post("A"), now).await.unwrap().seq, 1);
        assert_eq!(cli.enqueue(&site_post("B"), now).await.unwrap().seq, 2);
        assert_eq!(daemon.enqueue(&site_post("C"), now).await.unwrap().seq, 3);

        let bodies: Vec<Vec<u8>> = daemon.entries().await.unwrap().into_iter().map(|e| e.body).collect();
        assert_eq!(bodies, vec![b"A".to_vec(), b"B".to_vec(), b"C".to_vec()]);
    }

    #[tokio::test]
    async fn test_interleaved_enqueues_get_distinct_sequences() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let first = queue(storage.clone());
        let second = queue(storage.clone());
        let now = Utc::now();

        let a = async {
            for i in 0..10 {
                first.enqueue(&site_post(&format!("a{}", i)), now).await.unwrap();
            }
        };
        let b = async {
            for i in 0..10 {
                second.enqueue(&site_post(&format!("b{}", i)), now).await.unwrap();
            }
        };
        tokio::join!(a, b);

        let seqs: Vec<u64> = first.entries().await.unwrap().iter().map(|e| e.seq).collect();
        assert_eq!(seqs, (1..=20).collect::<Vec<u64>>());
    }

    #[tokio::test]
    async fn test_drain_report_notifications() {
        let storage = Arc::new(MemoryStorage::new());
        let queue = queue(storage);
        let t = Utc::now();
        queue.enqueue(&site_post("old"), t).await.unwrap();
        queue.enqueue(&site_post("fresh"), t + Duration::hours(23)).await.unwrap();
        queue.enqueue(&site_post("stuck"), t + Duration::hours(23)).await.unwrap();

        let api = RecordingApi::default();
        *api.fail_body.lock().unwrap() = Some("stuck".to_string());
        let report = queue.drain(&api, t + Duration::hours(24)).await.unwrap();

        let url = "https://api.example.org/v1/site".to_string();
        assert_eq!(
            report.notifications(),
            vec![
                LifecycleEvent::RequestExpired { url: url.clone() },
                LifecycleEvent::RequestReplayed { url },
            ]
        );
    }

    #[tokio::test]
    async fn test_drain_replays_in_fifo_order() {
        let storage = Arc::new(MemoryStorage::new());
        let queue = queue(storage);
        let now = Utc::now();
        for body in ["A", "B", "C"] {
            queue.enqueue(&site_post(body), now).await.unwrap();
        }

        let api = RecordingApi::default();
        let report = queue.drain(&api, now + Duration::minutes(5)).await.unwrap();

        assert_eq!(api.seen_bodies(), vec!["A", "B", "C"]);
        assert_eq!(report.attempted, vec![1, 2, 3]);
        assert_eq!(report.replayed(), 3);
        assert!(queue.is_empty().await.unwrap());
    }

    #[tokio::test]
    async fn test_drain_stops_at_first_transport_failure() {
        let storage = Arc::new(MemoryStorage::new());
        let queue = queue(storage);
        let now = Utc::now();
        for body in ["A", "B", "C"] {
            queue.enqueue(&site_post(body), now).await.unwrap();
        }

        let api = RecordingApi::default();
        *api.fail_body.lock().unwrap() = Some("B".to_string());
        let report = queue.drain(&api, now).await.unwrap();

        assert_eq!(api.seen_bodies(), vec!["A"]);
        assert_eq!(report.attempted, vec![1, 2]);
        assert_eq!(report.replayed(), 1);
        assert_eq!(report.pending(), 2);
        assert!(matches!(report.failure, Some(WorkerError::ReplayFailure { seq: 2, .. })));

        let remaining: Vec<u64> = queue.entries().await.unwrap().iter().map(|e| e.seq).collect();
        assert_eq!(remaining, vec![2, 3]);
    }

    #[tokio::test]
    async fn test_expiry_boundary() {
        let storage = Arc::new(MemoryStorage::new());
        let queue = queue(storage);
        let t = Utc::now();
        queue.enqueue(&site_post("late"), t).await.unwrap();

        // Still offline just before the window closes: retried, stays queued
        let api = RecordingApi::default();
        api.offline.store(true, Ordering::SeqCst);
        let report = queue
            .drain(&api, t + Duration::hours(24) - Duration::seconds(1))
            .await
            .unwrap();
        assert_eq!(report.attempted, vec![1]);
        assert_eq!(report.pending(), 1);

        // At exactly T + 24h it is discarded without a replay attempt
        api.offline.store(false, Ordering::SeqCst);
        let report = queue.drain(&api, t + Duration::hours(24)).await.unwrap();
        assert!(report.attempted.is_empty());
        assert_eq!(report.expired(), 1);
        assert!(api.seen_bodies().is_empty());
        assert!(queue.is_empty().await.unwrap());
    }

    #[tokio::test]
    async fn test_drain_empty_queue_is_noop() {
        let storage = Arc::new(MemoryStorage::new());
        let queue = queue(storage.clone());
        let before = storage.snapshot().await;

        let api = RecordingApi::default();
        let report = queue.drain(&api, Utc::now()).await.unwrap();

        assert!(report.is_noop());
        assert!(!report.skipped);
        assert!(api.seen_bodies().is_empty());
        assert_eq!(storage.snapshot().await, before);
    }

    #[tokio::test]
    async fn test_unreadable_record_dropped() {
        let storage = Arc::new(MemoryStorage::new());
        let queue = queue(storage.clone());
        storage
            .put("queue/bgSyncQueue/00000000000000000001", b"{broken".to_vec())
            .await
            .unwrap();

        let report = queue.drain(&RecordingApi::default(), Utc::now()).await.unwrap();
        assert_eq!(report.dropped, 1);
        assert!(queue.is_empty().await.unwrap());
    }

    #[tokio::test]
    async fn test_concurrent_drain_is_skipped() {
        let storage = Arc::new(MemoryStorage::new());
        let queue = queue(storage);
        let _held = queue.drain_lock.lock().await;
        let report = queue.drain(&RecordingApi::default(), Utc::now()).await.unwrap();
        assert!(report.skipped);
    }

    #[test]
    fn test_body_serialized_as_hex() {
        let entry = QueuedRequest {
            seq: 7,
            method: "POST".into(),
            url: "https://api.example.org/v1/site".into(),
            headers: vec![],
            body: vec![0xde, 0xad],
            enqueued_at: Utc::now(),
        };
        let json = serde_json::to_string(&entry).unwrap();
        assert!(json.contains("\"body\":\"dead\""));
        let back: QueuedRequest = serde_json::from_str(&json).unwrap();
        assert_eq!(back, entry);
    }
}
