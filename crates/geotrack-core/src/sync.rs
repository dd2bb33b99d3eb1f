//! Single-flight batch upload.
//!
//! At most one sync cycle runs at a time per engine. A cycle locks a batch,
//! uploads it, and then deletes it (2xx) or unlocks it (anything else). When
//! the transport fails the engine cannot know which rows were in flight, so
//! every lock is released.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use geotrack_store::Store;

use crate::config::SharedConfig;
use crate::events::{EventDispatcher, TrackerEvent};
use crate::http::{UploadRequest, Uploader};

/// The queue, shared between ingestion and sync.
pub type SharedStore = Arc<Mutex<Store>>;

/// Result of a call to [`SyncEngine::sync`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    /// Another cycle was already running.
    Busy,
    /// No upload URL is configured.
    NoEndpoint,
    /// Fewer unlocked records than `auto_sync_threshold`.
    BelowThreshold,
    NothingToSync,
    Synced { records: usize, batches: usize },
    /// The cycle stopped on an error response (status 0 when no response
    /// was received).
    Failed { status: u16 },
}

struct Inner {
    store: SharedStore,
    config: SharedConfig,
    events: EventDispatcher,
    uploader: Arc<dyn Uploader>,
    syncing: AtomicBool,
}

/// Clears the single-flight flag on every exit path.
struct FlightGuard<'a>(&'a AtomicBool);

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Uploads queued records.
#[derive(Clone)]
pub struct SyncEngine {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for SyncEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEngine")
            .field("syncing", &self.is_syncing())
            .finish_non_exhaustive()
    }
}

impl SyncEngine {
    pub fn new(
        store: SharedStore,
        config: SharedConfig,
        events: EventDispatcher,
        uploader: Arc<dyn Uploader>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                config,
                events,
                uploader,
                syncing: AtomicBool::new(false),
            }),
        }
    }

    pub fn is_syncing(&self) -> bool {
        self.inner.syncing.load(Ordering::Acquire)
    }

    /// Run a sync cycle unless one is already in progress.
    ///
    /// Batches keep going while the remaining unlocked count stays at or
    /// above the threshold (or above zero without a threshold).
    pub async fn sync(&self) -> SyncOutcome {
        if self
            .inner
            .syncing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("Sync already in progress");
            return SyncOutcome::Busy;
        }
        let _guard = FlightGuard(&self.inner.syncing);

        let outcome = self.run_cycle().await;
        debug!("Sync finished: {:?}", outcome);
        outcome
    }

    /// Start a sync in the background.
    pub fn spawn_sync(&self) -> JoinHandle<SyncOutcome> {
        let engine = self.clone();
        tokio::spawn(async move { engine.sync().await })
    }

    /// Sync whenever `network` flips to available, until cancelled.
    pub async fn watch_network(self, mut network: watch::Receiver<bool>, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                changed = network.changed() => {
                    if changed.is_err() {
                        return;
                    }
                    if *network.borrow_and_update() {
                        info!("Network available; syncing");
                        self.sync().await;
                    }
                }
            }
        }
    }

    async fn run_cycle(&self) -> SyncOutcome {
        let mut records = 0;
        let mut batches = 0;

        loop {
            let config = self.inner.config.read().await.clone();
            let threshold = u64::from(config.auto_sync_threshold);

            if batches == 0 && config.url.is_empty() {
                debug!("No upload URL configured; skipping sync");
                return SyncOutcome::NoEndpoint;
            }

            if batches == 0 {
                let unlocked = self.inner.store.lock().await.count(true);
                let unlocked = match unlocked {
                    Ok(n) => n,
                    Err(e) => return self.persistence_failure(e).await,
                };
                if threshold > 0 && unlocked < threshold {
                    debug!("{} unlocked record(s), below threshold {}", unlocked, threshold);
                    return SyncOutcome::BelowThreshold;
                }
            }

            let batch = self.inner.store.lock().await.select_and_lock(config.batch_limit());
            let batch = match batch {
                Ok(batch) => batch,
                Err(e) => return self.persistence_failure(e).await,
            };
            if batch.is_empty() {
                return if batches == 0 {
                    SyncOutcome::NothingToSync
                } else {
                    SyncOutcome::Synced { records, batches }
                };
            }
            let ids: Vec<i64> = batch.iter().map(|r| r.id).collect();

            let request = match UploadRequest::new(&config, &batch) {
                Ok(request) => request,
                Err(e) => return self.transport_failure(&e.to_string()).await,
            };

            let response = match self.inner.uploader.upload(request).await {
                Ok(response) => response,
                Err(e) => return self.transport_failure(&e.to_string()).await,
            };

            if !response.is_success() {
                warn!("Upload of {} record(s) failed with HTTP {}", ids.len(), response.status);
                let unlocked = self.inner.store.lock().await.unlock(&ids);
                match unlocked {
                    Ok(true) => {}
                    Ok(false) => warn!("Some of {} record(s) were not unlocked", ids.len()),
                    Err(e) => return self.persistence_failure(e).await,
                }
                self.inner.events.send(TrackerEvent::SyncResponse {
                    status: response.status,
                    success: false,
                    body: response.body,
                });
                return SyncOutcome::Failed {
                    status: response.status,
                };
            }

            let remaining = {
                let store = self.inner.store.lock().await;
                store.delete_all(&ids).and_then(|complete| {
                    if !complete {
                        warn!("Some of {} synced record(s) were already gone", ids.len());
                    }
                    store.count(true)
                })
            };
            let remaining = match remaining {
                Ok(n) => n,
                Err(e) => return self.persistence_failure(e).await,
            };

            info!("Synced {} record(s), HTTP {}", ids.len(), response.status);
            records += ids.len();
            batches += 1;
            self.inner.events.send(TrackerEvent::SyncResponse {
                status: response.status,
                success: true,
                body: response.body,
            });

            let more = if threshold == 0 {
                remaining > 0
            } else {
                remaining >= threshold
            };
            if !more {
                return SyncOutcome::Synced { records, batches };
            }
        }
    }

    async fn transport_failure(&self, message: &str) -> SyncOutcome {
        warn!("Upload failed: {}", message);
        self.release_all_locks().await;
        self.inner.events.send(TrackerEvent::SyncResponse {
            status: 0,
            success: false,
            body: message.to_string(),
        });
        SyncOutcome::Failed { status: 0 }
    }

    async fn persistence_failure(&self, err: geotrack_store::Error) -> SyncOutcome {
        error!("Queue error during sync: {}", err);
        self.release_all_locks().await;
        self.inner.events.send(TrackerEvent::SyncResponse {
            status: 0,
            success: false,
            body: err.to_string(),
        });
        SyncOutcome::Failed { status: 0 }
    }

    async fn release_all_locks(&self) {
        let released = self.inner.store.lock().await.unlock_all();
        match released {
            Ok(n) if n > 0 => info!("Released {} lock(s)", n),
            Ok(_) => {}
            Err(e) => error!("Failed to release locks: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{TrackingConfig, shared};
    use crate::events::EventReceiver;
    use crate::mock::MockUploader;
    use geotrack_types::{LocationRecord, RawFix};

    fn setup(config: TrackingConfig, records: usize) -> (SyncEngine, SharedStore, Arc<MockUploader>, EventReceiver) {
        let store = Store::open_in_memory().unwrap();
        for i in 0..records {
            let coords = RawFix::new(10.0 + i as f64 * 0.001, 20.0).coords().unwrap();
            store.insert(&LocationRecord::new(coords, 1_000 + i as i64)).unwrap();
        }
        let store = Arc::new(Mutex::new(store));
        let uploader = Arc::new(MockUploader::new());
        let events = EventDispatcher::default();
        let rx = events.subscribe();
        let config = shared(TrackingConfig {
            url: "http://localhost/locations".into(),
            ..config
        });
        let engine = SyncEngine::new(store.clone(), config, events, uploader.clone());
        (engine, store, uploader, rx)
    }

    fn responses(rx: &mut EventReceiver) -> Vec<(u16, bool)> {
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let TrackerEvent::SyncResponse { status, success, .. } = event {
                out.push((status, success));
            }
        }
        out
    }

    #[tokio::test]
    async fn test_sync_success_empties_queue() {
        let (engine, store, uploader, mut rx) = setup(TrackingConfig::default(), 3);

        let outcome = engine.sync().await;
        assert_eq!(outcome, SyncOutcome::Synced { records: 3, batches: 1 });
        assert_eq!(store.lock().await.count(false).unwrap(), 0);
        assert_eq!(responses(&mut rx), vec![(200, true)]);
        assert_eq!(uploader.upload_count(), 1);
        assert!(!engine.is_syncing());
    }

    #[tokio::test]
    async fn test_sync_server_error_unlocks_batch() {
        let (engine, store, uploader, mut rx) = setup(TrackingConfig::default(), 3);
        uploader.set_status(500);

        let outcome = engine.sync().await;
        assert_eq!(outcome, SyncOutcome::Failed { status: 500 });

        let counts = store.lock().await.counts().unwrap();
        assert_eq!(counts.total, 3);
        assert_eq!(counts.unlocked, 3);
        assert_eq!(responses(&mut rx), vec![(500, false)]);
    }

    #[tokio::test]
    async fn test_sync_transport_error_unlocks_everything() {
        let (engine, store, uploader, mut rx) = setup(TrackingConfig::default(), 2);
        uploader.set_should_fail(true);

        let outcome = engine.sync().await;
        assert_eq!(outcome, SyncOutcome::Failed { status: 0 });
        assert!(store.lock().await.counts().unwrap().all_unlocked());
        assert_eq!(responses(&mut rx), vec![(0, false)]);
        assert!(!engine.is_syncing());
    }

    #[tokio::test]
    async fn test_sync_batches_until_exhausted() {
        let (engine, store, uploader, mut rx) = setup(
            TrackingConfig {
                max_batch_size: 2,
                ..Default::default()
            },
            5,
        );

        let outcome = engine.sync().await;
        assert_eq!(outcome, SyncOutcome::Synced { records: 5, batches: 3 });
        assert_eq!(store.lock().await.count(false).unwrap(), 0);
        assert_eq!(uploader.upload_count(), 3);
        assert_eq!(responses(&mut rx).len(), 3);
    }

    #[tokio::test]
    async fn test_sync_stops_below_threshold_after_batch() {
        let (engine, store, _uploader, _rx) = setup(
            TrackingConfig {
                max_batch_size: 2,
                auto_sync_threshold: 2,
                ..Default::default()
            },
            5,
        );

        // 5 -> 3 -> 1 (below 2)
        let outcome = engine.sync().await;
        assert_eq!(outcome, SyncOutcome::Synced { records: 4, batches: 2 });
        assert_eq!(store.lock().await.count(false).unwrap(), 1);
    }

    #[tokio::test]
    async fn test_sync_below_threshold() {
        let (engine, store, uploader, _rx) = setup(
            TrackingConfig {
                auto_sync_threshold: 10,
                ..Default::default()
            },
            3,
        );
        assert_eq!(engine.sync().await, SyncOutcome::BelowThreshold);
        assert_eq!(uploader.upload_count(), 0);
        assert_eq!(store.lock().await.count(true).unwrap(), 3);
    }

    #[tokio::test]
    async fn test_sync_without_url_leaves_queue_alone() {
        let store = Store::open_in_memory().unwrap();
        let coords = RawFix::new(10.0, 20.0).coords().unwrap();
        store.insert(&LocationRecord::new(coords, 1_000)).unwrap();
        let store = Arc::new(Mutex::new(store));
        let uploader = Arc::new(MockUploader::new());
        let events = EventDispatcher::default();
        let mut rx = events.subscribe();
        let engine = SyncEngine::new(
            store.clone(),
            shared(TrackingConfig::default()),
            events,
            uploader.clone(),
        );

        assert_eq!(engine.sync().await, SyncOutcome::NoEndpoint);
        assert_eq!(uploader.upload_count(), 0);
        assert!(responses(&mut rx).is_empty());
        assert_eq!(store.lock().await.counts().unwrap().unlocked, 1);
        assert!(!engine.is_syncing());
    }

    #[tokio::test]
    async fn test_sync_nothing_to_sync() {
        let (engine, _store, uploader, mut rx) = setup(TrackingConfig::default(), 0);
        assert_eq!(engine.sync().await, SyncOutcome::NothingToSync);
        assert_eq!(uploader.upload_count(), 0);
        assert!(responses(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn test_sync_single_record_mode() {
        let (engine, _store, uploader, _rx) = setup(
            TrackingConfig {
                batch_sync: false,
                ..Default::default()
            },
            3,
        );
        let outcome = engine.sync().await;
        assert_eq!(outcome, SyncOutcome::Synced { records: 3, batches: 3 });

        let last = uploader.last_request().unwrap();
        assert!(last.body.get("locations").is_none());
        assert!(last.body.get("uuid").is_some());
    }

    #[tokio::test]
    async fn test_sync_is_single_flight() {
        let (engine, store, uploader, _rx) = setup(TrackingConfig::default(), 3);
        uploader.set_latency(std::time::Duration::from_millis(50));

        let first = engine.spawn_sync();
        tokio::task::yield_now().await;
        while !engine.is_syncing() {
            tokio::task::yield_now().await;
        }
        assert_eq!(engine.sync().await, SyncOutcome::Busy);

        assert_eq!(first.await.unwrap(), SyncOutcome::Synced { records: 3, batches: 1 });
        assert_eq!(uploader.upload_count(), 1);
        assert_eq!(store.lock().await.count(false).unwrap(), 0);
    }

    #[tokio::test]
    async fn test_watch_network_triggers_sync() {
        let (engine, store, _uploader, _rx) = setup(TrackingConfig::default(), 2);
        let (tx, rx) = watch::channel(false);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(engine.clone().watch_network(rx, cancel.clone()));

        tx.send(true).unwrap();
        for _ in 0..100 {
            if store.lock().await.count(false).unwrap() == 0 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        assert_eq!(store.lock().await.count(false).unwrap(), 0);

        cancel.cancel();
        handle.await.unwrap();
    }
}
