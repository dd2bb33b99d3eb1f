//! Ingestion pipeline.
//!
//! [`Tracker::accept`] takes a raw fix through validation, deduplication,
//! the odometer, the motion state machine and the queue, then kicks off an
//! automatic sync and a retention pass.

use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, error, warn};

use geotrack_types::{Activity, Coords, Extras, LocationRecord, RawFix, now_millis};

use crate::config::SharedConfig;
use crate::error::Result;
use crate::events::{DiscardReason, EventDispatcher, TrackerEvent};
use crate::http::Uploader;
use crate::motion::{MotionDetector, MotionHint};
use crate::sync::{SharedStore, SyncEngine};

/// Coordinates closer than this (in degrees) are the same position.
pub const COORDINATE_EPSILON: f64 = 1e-7;
/// Speeds and headings closer than this are the same.
pub const MOTION_EPSILON: f64 = 0.01;
/// Longer jumps between consecutive fixes are not added to the odometer.
pub const MAX_ODOMETER_STEP_M: f64 = 1000.0;

/// What happened to a fix passed to [`Tracker::accept`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcceptOutcome {
    /// Queued under this uuid.
    Accepted { uuid: String },
    Discarded(DiscardReason),
}

impl AcceptOutcome {
    pub fn uuid(&self) -> Option<&str> {
        match self {
            AcceptOutcome::Accepted { uuid } => Some(uuid),
            AcceptOutcome::Discarded(_) => None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct LastFix {
    timestamp: i64,
    coords: Coords,
}

impl LastFix {
    /// Same-timestamp fixes must also agree on speed and heading.
    fn is_identical(&self, timestamp: i64, coords: &Coords) -> bool {
        let same_position = (self.coords.latitude - coords.latitude).abs() < COORDINATE_EPSILON
            && (self.coords.longitude - coords.longitude).abs() < COORDINATE_EPSILON;
        if self.timestamp != timestamp {
            return same_position;
        }
        same_position
            && close(self.coords.speed, coords.speed)
            && close(self.coords.heading, coords.heading)
    }
}

fn close(a: Option<f64>, b: Option<f64>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => (a - b).abs() < MOTION_EPSILON,
        (None, None) => true,
        _ => false,
    }
}

/// The ingestion entry point, wired to the queue, motion detector and sync
/// engine.
#[derive(Debug)]
pub struct Tracker {
    store: SharedStore,
    config: SharedConfig,
    events: EventDispatcher,
    motion: MotionDetector,
    sync: SyncEngine,
    /// Also serializes concurrent `accept` calls.
    last_fix: Mutex<Option<LastFix>>,
}

impl Tracker {
    pub fn new(
        store: SharedStore,
        config: SharedConfig,
        events: EventDispatcher,
        motion: MotionDetector,
        sync: SyncEngine,
    ) -> Self {
        Self {
            store,
            config,
            events,
            motion,
            sync,
            last_fix: Mutex::new(None),
        }
    }

    /// Wire a tracker with its own motion detector and sync engine.
    pub fn with_uploader(
        store: SharedStore,
        config: SharedConfig,
        events: EventDispatcher,
        uploader: Arc<dyn Uploader>,
    ) -> Self {
        let motion = MotionDetector::new(config.clone(), events.clone());
        let sync = SyncEngine::new(store.clone(), config.clone(), events.clone(), uploader);
        Self::new(store, config, events, motion, sync)
    }

    pub fn config(&self) -> &SharedConfig {
        &self.config
    }

    pub fn store(&self) -> &SharedStore {
        &self.store
    }

    pub fn events(&self) -> &EventDispatcher {
        &self.events
    }

    pub fn motion(&self) -> &MotionDetector {
        &self.motion
    }

    pub fn sync_engine(&self) -> &SyncEngine {
        &self.sync
    }

    /// Run one fix through the pipeline.
    ///
    /// Validation and queue write failures are returned; the fix is lost in
    /// both cases. Sync and retention problems are only logged.
    pub async fn accept(&self, fix: RawFix) -> Result<AcceptOutcome> {
        let coords = fix.coords().inspect_err(|e| debug!("Rejected fix: {}", e))?;
        let timestamp = fix.timestamp.unwrap_or_else(now_millis);

        let mut last = self.last_fix.lock().await;

        let (enabled, allow_identical) = {
            let config = self.config.read().await;
            (config.enabled, config.allow_identical_locations)
        };
        if !enabled {
            debug!("Tracking disabled; dropping fix");
            return Ok(self.discard(DiscardReason::Disabled));
        }

        // Committed to the config only once the record is stored.
        let mut odometer_step = 0.0;
        if let Some(prev) = last.as_ref() {
            if !allow_identical && prev.is_identical(timestamp, &coords) {
                debug!("Identical location; dropping fix");
                return Ok(self.discard(DiscardReason::Identical));
            }
            let distance = prev.coords.distance_to(&coords);
            let noise = (prev.coords.accuracy + coords.accuracy) / 2.0;
            if distance >= noise && distance < MAX_ODOMETER_STEP_M {
                odometer_step = distance / 1000.0;
            }
        }

        let hint = fix.activity.map(|a| MotionHint::from_activity(a.kind));
        self.motion.on_fix(&coords, hint).await;

        let record = {
            let config = self.config.read().await;
            let mut record = LocationRecord::new(coords, timestamp);
            record.is_moving = config.is_moving;
            record.odometer = config.odometer + odometer_step;
            record.activity = Some(Activity::resolve(fix.activity, coords.speed));
            record.battery = fix.battery;
            record.extras = merge_extras(&config.extras, fix.extras);
            record
        };

        let inserted = self.store.lock().await.insert(&record);
        let uuid = inserted.inspect_err(|e| error!("Failed to persist location: {}", e))?;
        if odometer_step > 0.0 {
            self.config.write().await.odometer += odometer_step;
        }
        *last = Some(LastFix { timestamp, coords });
        drop(last);

        debug!("Queued location {}", uuid);
        let mut record = record;
        record.uuid = uuid.clone();
        self.events.send(TrackerEvent::Location { record });

        self.maybe_sync().await;
        self.apply_retention().await;

        Ok(AcceptOutcome::Accepted { uuid })
    }

    /// Force the motion state.
    pub async fn change_pace(&self, is_moving: bool) {
        self.motion.change_pace(is_moving).await;
    }

    /// Feed an activity hint to the motion detector.
    pub async fn on_hint(&self, hint: MotionHint) {
        self.motion.on_hint(hint).await;
    }

    /// Enable or disable tracking outside the schedule.
    pub async fn set_enabled(&self, enabled: bool) {
        let changed = {
            let mut config = self.config.write().await;
            let changed = config.enabled != enabled;
            config.enabled = enabled;
            changed
        };
        if changed {
            self.events.send(TrackerEvent::EnabledChange { enabled });
        }
    }

    /// Prune and shrink the queue per the retention options.
    ///
    /// Failures are logged and otherwise ignored.
    pub async fn apply_retention(&self) {
        let (max_days, max_records) = {
            let config = self.config.read().await;
            (config.max_days_to_persist, config.max_records_to_persist)
        };
        let store = self.store.lock().await;
        if max_days > 0 {
            if let Err(e) = store.prune(max_days) {
                warn!("Failed to prune queue: {}", e);
            }
        }
        if max_records > 0 {
            if let Err(e) = store.shrink(max_records) {
                warn!("Failed to shrink queue: {}", e);
            }
        }
    }

    async fn maybe_sync(&self) {
        let unlocked = self.store.lock().await.count(true);
        let unlocked = match unlocked {
            Ok(n) => n,
            Err(e) => {
                warn!("Failed to count queue: {}", e);
                return;
            }
        };
        if self.config.read().await.should_auto_sync(unlocked) {
            self.sync.spawn_sync();
        }
    }

    fn discard(&self, reason: DiscardReason) -> AcceptOutcome {
        self.events.send(TrackerEvent::Discarded { reason });
        AcceptOutcome::Discarded(reason)
    }
}

/// Config extras overlaid with the fix's own extras.
fn merge_extras(defaults: &Extras, fix: Option<Extras>) -> Option<Extras> {
    let mut merged = defaults.clone();
    if let Some(fix) = fix {
        merged.extend(fix);
    }
    if merged.is_empty() { None } else { Some(merged) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{TrackingConfig, shared};
    use crate::mock::MockUploader;
    use geotrack_store::Store;
    use geotrack_types::{ActivityType, geo};
    use serde_json::json;

    fn tracker(config: TrackingConfig) -> (Tracker, Arc<MockUploader>) {
        let store: SharedStore = Arc::new(Mutex::new(Store::open_in_memory().unwrap()));
        let config = shared(TrackingConfig {
            enabled: true,
            max_days_to_persist: 0,
            ..config
        });
        let events = EventDispatcher::default();
        let uploader = Arc::new(MockUploader::new());
        (Tracker::with_uploader(store, config, events, uploader.clone()), uploader)
    }

    /// Let spawned sync tasks run to completion.
    async fn settle() {
        for _ in 0..50 {
            tokio::task::yield_now().await;
        }
    }

    async fn queued(tracker: &Tracker) -> u64 {
        tracker.store().lock().await.count(false).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_accept_queues_fix() {
        let (tracker, _) = tracker(TrackingConfig::default());
        let mut rx = tracker.events().subscribe();

        let outcome = tracker
            .accept(RawFix::new(48.85, 2.35).with_accuracy(5.0).with_timestamp(1_000))
            .await
            .unwrap();
        let uuid = outcome.uuid().unwrap().to_string();
        assert_eq!(queued(&tracker).await, 1);

        let stored = tracker.store().lock().await.get(&uuid).unwrap().unwrap();
        assert_eq!(stored.timestamp, 1_000);
        assert_eq!(stored.activity.unwrap().kind, ActivityType::Still);

        let mut saw_location = false;
        while let Ok(event) = rx.try_recv() {
            if let TrackerEvent::Location { record } = event {
                assert_eq!(record.uuid, uuid);
                saw_location = true;
            }
        }
        assert!(saw_location);
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_coordinates_rejected() {
        let (tracker, _) = tracker(TrackingConfig::default());
        let fix = RawFix {
            latitude: Some(1.0),
            ..Default::default()
        };
        let err = tracker.accept(fix).await.unwrap_err();
        assert!(matches!(err, crate::Error::Validation(_)));
        assert_eq!(queued(&tracker).await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disabled_tracker_drops_fix() {
        let (tracker, _) = tracker(TrackingConfig::default());
        tracker.set_enabled(false).await;
        let outcome = tracker.accept(RawFix::new(1.0, 1.0)).await.unwrap();
        assert_eq!(outcome, AcceptOutcome::Discarded(DiscardReason::Disabled));
        assert_eq!(queued(&tracker).await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_identical_fix_discarded() {
        let (tracker, _) = tracker(TrackingConfig::default());
        let fix = RawFix::new(10.0, 20.0).with_accuracy(5.0).with_timestamp(1_000);
        tracker.accept(fix.clone()).await.unwrap();
        let odometer = tracker.config().read().await.odometer;

        // Different timestamp, same position
        let again = fix.clone().with_timestamp(2_000);
        let outcome = tracker.accept(again).await.unwrap();
        assert_eq!(outcome, AcceptOutcome::Discarded(DiscardReason::Identical));
        assert_eq!(queued(&tracker).await, 1);
        assert_eq!(tracker.config().read().await.odometer, odometer);
    }

    #[tokio::test(start_paused = true)]
    async fn test_same_timestamp_different_speed_is_not_identical() {
        let (tracker, _) = tracker(TrackingConfig::default());
        let fix = RawFix::new(10.0, 20.0).with_timestamp(1_000).with_speed(1.0);
        tracker.accept(fix.clone()).await.unwrap();

        let faster = fix.clone().with_speed(2.0);
        assert!(tracker.accept(faster).await.unwrap().uuid().is_some());

        let same = fix.with_speed(2.005);
        assert_eq!(
            tracker.accept(same).await.unwrap(),
            AcceptOutcome::Discarded(DiscardReason::Identical)
        );
        assert_eq!(queued(&tracker).await, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_identical_allowed() {
        let (tracker, _) = tracker(TrackingConfig {
            allow_identical_locations: true,
            ..Default::default()
        });
        let fix = RawFix::new(10.0, 20.0).with_timestamp(1_000);
        tracker.accept(fix.clone()).await.unwrap();
        tracker.accept(fix).await.unwrap();
        assert_eq!(queued(&tracker).await, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_odometer_counts_real_movement() {
        let (tracker, _) = tracker(TrackingConfig::default());
        tracker
            .accept(RawFix::new(45.0, 7.0).with_accuracy(10.0).with_timestamp(1_000))
            .await
            .unwrap();

        let (lat, lon) = geo::destination(45.0, 7.0, 0.0, 50.0);
        tracker
            .accept(RawFix::new(lat, lon).with_accuracy(10.0).with_timestamp(2_000))
            .await
            .unwrap();
        let odometer = tracker.config().read().await.odometer;
        assert!((odometer - 0.05).abs() < 1e-6, "odometer {odometer}");
    }

    #[tokio::test(start_paused = true)]
    async fn test_odometer_ignores_jitter_and_jumps() {
        let (tracker, _) = tracker(TrackingConfig::default());
        tracker
            .accept(RawFix::new(45.0, 7.0).with_accuracy(10.0).with_timestamp(1_000))
            .await
            .unwrap();

        let (lat, lon) = geo::destination(45.0, 7.0, 90.0, 5.0);
        tracker
            .accept(RawFix::new(lat, lon).with_accuracy(10.0).with_timestamp(2_000))
            .await
            .unwrap();
        assert_eq!(tracker.config().read().await.odometer, 0.0);

        let (lat, lon) = geo::destination(lat, lon, 90.0, 5_000.0);
        tracker
            .accept(RawFix::new(lat, lon).with_accuracy(10.0).with_timestamp(3_000))
            .await
            .unwrap();
        assert_eq!(tracker.config().read().await.odometer, 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_write_does_not_advance_odometer() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue.db");
        let store: SharedStore = Arc::new(Mutex::new(Store::open(&path).unwrap()));
        let config = shared(TrackingConfig {
            enabled: true,
            max_days_to_persist: 0,
            ..Default::default()
        });
        let tracker = Tracker::with_uploader(
            store,
            config,
            EventDispatcher::default(),
            Arc::new(MockUploader::new()),
        );

        tracker
            .accept(RawFix::new(45.0, 7.0).with_accuracy(10.0).with_timestamp(1_000))
            .await
            .unwrap();

        // Hide the table from a second connection so the next write fails
        let side = rusqlite::Connection::open(&path).unwrap();
        side.execute_batch("ALTER TABLE locations RENAME TO locations_hidden")
            .unwrap();

        let (lat, lon) = geo::destination(45.0, 7.0, 0.0, 50.0);
        let err = tracker
            .accept(RawFix::new(lat, lon).with_accuracy(10.0).with_timestamp(2_000))
            .await
            .unwrap_err();
        assert!(matches!(err, crate::Error::Persistence(_)));
        assert_eq!(tracker.config().read().await.odometer, 0.0);

        side.execute_batch("ALTER TABLE locations_hidden RENAME TO locations")
            .unwrap();

        let (lat, lon) = geo::destination(lat, lon, 0.0, 50.0);
        let uuid = tracker
            .accept(RawFix::new(lat, lon).with_accuracy(10.0).with_timestamp(3_000))
            .await
            .unwrap()
            .uuid()
            .unwrap()
            .to_string();

        let odometer = tracker.config().read().await.odometer;
        assert!((odometer - 0.1).abs() < 1e-6, "odometer {odometer}");
        let record = tracker.store().lock().await.get(&uuid).unwrap().unwrap();
        assert!((record.odometer - 0.1).abs() < 1e-6);
        assert_eq!(queued(&tracker).await, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_on_hint_reaches_motion_detector() {
        let (tracker, _) = tracker(TrackingConfig::default());
        let mut rx = tracker.events().subscribe();

        tracker.on_hint(MotionHint::Moving(ActivityType::OnFoot)).await;
        assert!(tracker.motion().is_moving().await);
        assert!(matches!(
            rx.try_recv().unwrap(),
            TrackerEvent::MotionChange { is_moving: true, .. }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_record_snapshot_fields() {
        let (tracker, _) = tracker(TrackingConfig {
            extras: serde_json::from_value(json!({"app": "demo", "trip": 1})).unwrap(),
            ..Default::default()
        });
        let mut fix_extras = Extras::new();
        fix_extras.insert("trip".into(), json!(2));
        let fix = RawFix {
            extras: Some(fix_extras),
            ..RawFix::new(10.0, 10.0).with_accuracy(5.0).with_speed(20.0)
        };

        let uuid = tracker.accept(fix).await.unwrap().uuid().unwrap().to_string();
        let record = tracker.store().lock().await.get(&uuid).unwrap().unwrap();

        assert!(record.is_moving);
        assert_eq!(record.activity.unwrap().kind, ActivityType::InVehicle);
        let extras = record.extras.unwrap();
        assert_eq!(extras["app"], "demo");
        assert_eq!(extras["trip"], 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_accept_triggers_auto_sync() {
        let (tracker, uploader) = tracker(TrackingConfig {
            url: "http://localhost/locations".into(),
            ..Default::default()
        });
        tracker.accept(RawFix::new(1.0, 1.0)).await.unwrap();

        settle().await;
        assert_eq!(uploader.upload_count(), 1);
        assert_eq!(queued(&tracker).await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_auto_sync_respects_threshold() {
        let (tracker, uploader) = tracker(TrackingConfig {
            url: "http://localhost/locations".into(),
            auto_sync_threshold: 3,
            ..Default::default()
        });
        for i in 0..2 {
            tracker.accept(RawFix::new(1.0 + f64::from(i), 1.0)).await.unwrap();
        }
        settle().await;
        assert_eq!(uploader.upload_count(), 0);
        assert_eq!(queued(&tracker).await, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retention_shrinks_queue() {
        let (tracker, _) = tracker(TrackingConfig {
            max_records_to_persist: 2,
            ..Default::default()
        });
        for i in 0..5 {
            tracker.accept(RawFix::new(f64::from(i), 1.0)).await.unwrap();
        }
        assert_eq!(queued(&tracker).await, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retention_prunes_old_records() {
        let (tracker, _) = tracker(TrackingConfig::default());
        tracker.config().write().await.max_days_to_persist = 1;

        let old = now_millis() - 3 * 86_400_000;
        tracker.accept(RawFix::new(1.0, 1.0).with_timestamp(old)).await.unwrap();
        tracker.accept(RawFix::new(2.0, 1.0)).await.unwrap();
        assert_eq!(queued(&tracker).await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_enabled_emits_once() {
        let (tracker, _) = tracker(TrackingConfig::default());
        let mut rx = tracker.events().subscribe();
        tracker.set_enabled(false).await;
        tracker.set_enabled(false).await;

        let changes: Vec<_> = std::iter::from_fn(|| rx.try_recv().ok())
            .filter(|e| matches!(e, TrackerEvent::EnabledChange { .. }))
            .collect();
        assert_eq!(changes.len(), 1);
    }
}
