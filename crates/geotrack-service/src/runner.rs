//! The tracking agent loop.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::sync::broadcast::error::TryRecvError;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, error, info, warn};

use geotrack_core::{
    AcceptOutcome, MotionHintSource, NetworkMonitor, PositionSource, SyncOutcome, TrackerEvent,
};

use crate::state::AppState;

/// Counters for a finished run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub accepted: usize,
    pub discarded: usize,
    pub rejected: usize,
    pub final_sync: Option<SyncOutcome>,
}

/// Drives a position source through the pipeline alongside the scheduler,
/// periodic sync and connectivity watcher.
pub struct Runner {
    state: Arc<AppState>,
    /// Taken by the first run.
    hints: Mutex<Option<Box<dyn MotionHintSource>>>,
}

impl Runner {
    pub fn new(state: Arc<AppState>) -> Self {
        Self {
            state,
            hints: Mutex::new(None),
        }
    }

    /// Feed activity hints from `hints` to the motion detector while running.
    pub fn with_hints<H: MotionHintSource + 'static>(self, hints: H) -> Self {
        Self {
            hints: Mutex::new(Some(Box::new(hints))),
            ..self
        }
    }

    /// Run until the source is exhausted or shutdown is requested.
    ///
    /// Tracking is enabled up front when no schedule is configured;
    /// otherwise the schedule decides.
    pub async fn run<S: PositionSource>(&self, mut source: S) -> RunSummary {
        let state = &self.state;
        let tasks = self.spawn_background().await;

        if state.config().read().await.schedule.is_empty() {
            state.tracker.set_enabled(true).await;
        }

        let mut events = state.events().subscribe();
        let mut summary = RunSummary::default();

        loop {
            let fix = tokio::select! {
                _ = state.shutdown.cancelled() => {
                    info!("Shutdown requested");
                    break;
                }
                fix = source.next_fix() => fix,
            };
            let Some(fix) = fix else {
                info!("Position source exhausted");
                break;
            };

            match state.tracker.accept(fix).await {
                Ok(AcceptOutcome::Accepted { uuid }) => {
                    debug!("Accepted {}", uuid);
                    summary.accepted += 1;
                }
                Ok(AcceptOutcome::Discarded(reason)) => {
                    debug!("Discarded fix: {:?}", reason);
                    summary.discarded += 1;
                }
                Err(e) => {
                    warn!("Fix rejected: {}", e);
                    summary.rejected += 1;
                }
            }

            forward_distance_filter(&mut events, &mut source);
        }

        // Let an in-flight auto sync finish before the final flush.
        while state.tracker.sync_engine().is_syncing() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        if !state.config().read().await.url.is_empty() {
            summary.final_sync = Some(state.tracker.sync_engine().sync().await);
        }

        state.shutdown.cancel();
        state.tracker.motion().shutdown().await;
        for result in futures::future::join_all(tasks).await {
            if let Err(e) = result {
                error!("Background task failed: {}", e);
            }
        }

        info!(
            "Run finished: {} accepted, {} discarded, {} rejected",
            summary.accepted, summary.discarded, summary.rejected
        );
        summary
    }

    async fn spawn_background(&self) -> Vec<JoinHandle<()>> {
        let state = &self.state;
        let mut tasks = Vec::new();

        let runner = state.schedule_runner().await;
        tasks.push(tokio::spawn(runner.run(state.shutdown.clone())));

        let engine = state.tracker.sync_engine().clone();
        tasks.push(tokio::spawn(
            engine.watch_network(state.network.subscribe(), state.shutdown.clone()),
        ));

        if state.service.sync_interval_secs > 0 {
            let period = Duration::from_secs(state.service.sync_interval_secs);
            let engine = state.tracker.sync_engine().clone();
            let shutdown = state.shutdown.clone();
            tasks.push(tokio::spawn(async move {
                let mut timer = interval(period);
                timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
                // The first tick completes immediately
                timer.tick().await;
                loop {
                    tokio::select! {
                        _ = shutdown.cancelled() => return,
                        _ = timer.tick() => {
                            let outcome = engine.sync().await;
                            debug!("Periodic sync: {:?}", outcome);
                        }
                    }
                }
            }));
        }

        let hints = self.hints.lock().await.take();
        if let Some(mut hints) = hints {
            let state = Arc::clone(state);
            tasks.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = state.shutdown.cancelled() => return,
                        hint = hints.next_hint() => match hint {
                            Some(hint) => state.tracker.on_hint(hint).await,
                            None => {
                                debug!("Motion hint source exhausted");
                                return;
                            }
                        },
                    }
                }
            }));
        }

        let mut events = state.events().subscribe();
        let shutdown = state.shutdown.clone();
        tasks.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    event = events.recv() => match event {
                        Ok(event) => log_event(&event),
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                            warn!("Event log lagged by {} events", n);
                        }
                        Err(_) => return,
                    },
                }
            }
        }));

        tasks
    }
}

fn forward_distance_filter<S: PositionSource>(
    events: &mut tokio::sync::broadcast::Receiver<TrackerEvent>,
    source: &mut S,
) {
    loop {
        match events.try_recv() {
            Ok(TrackerEvent::DistanceFilterChange { distance_filter }) => {
                source.set_distance_filter(distance_filter);
            }
            Ok(_) | Err(TryRecvError::Lagged(_)) => {}
            Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => return,
        }
    }
}

fn log_event(event: &TrackerEvent) {
    match serde_json::to_string(event) {
        Ok(json) => debug!(target: "geotrack::events", "{}", json),
        Err(e) => warn!("Failed to encode event: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use geotrack_core::MotionHint;
    use geotrack_core::mock::{MockUploader, ScriptedHintSource, ScriptedPositionSource};
    use geotrack_types::ActivityType;
    use geotrack_store::Store;
    use geotrack_types::RawFix;

    fn state(config: Config, uploader: Arc<MockUploader>) -> Arc<AppState> {
        AppState::with_uploader(Store::open_in_memory().unwrap(), config, uploader)
    }

    fn fixes(n: usize) -> Vec<RawFix> {
        (0..n)
            .map(|i| {
                RawFix::new(48.0 + i as f64 * 0.001, 11.0)
                    .with_accuracy(5.0)
                    .with_speed(12.0)
                    .with_timestamp(1_700_000_000_000 + i as i64 * 1_000)
            })
            .collect()
    }

    #[tokio::test]
    async fn test_run_without_url_keeps_records() {
        let mut config = Config::default();
        config.tracking.max_days_to_persist = 0;
        let state = state(config, Arc::new(MockUploader::new()));

        let summary = Runner::new(Arc::clone(&state)).run(ScriptedPositionSource::new(fixes(4))).await;
        assert_eq!(summary.accepted, 4);
        assert_eq!(summary.final_sync, None);
        assert_eq!(state.tracker.store().lock().await.count(false).unwrap(), 4);
        assert!(state.shutdown.is_cancelled());
    }

    #[tokio::test]
    async fn test_run_flushes_at_end() {
        let mut config = Config::default();
        config.tracking.url = "http://localhost/locations".into();
        config.tracking.auto_sync = false;
        config.tracking.max_days_to_persist = 0;
        let uploader = Arc::new(MockUploader::new());
        let state = state(config, Arc::clone(&uploader));

        let summary = Runner::new(Arc::clone(&state)).run(ScriptedPositionSource::new(fixes(3))).await;
        assert_eq!(
            summary.final_sync,
            Some(SyncOutcome::Synced { records: 3, batches: 1 })
        );
        assert_eq!(uploader.upload_count(), 1);
        assert_eq!(state.tracker.store().lock().await.count(false).unwrap(), 0);
    }

    #[tokio::test]
    async fn test_run_counts_rejected_and_duplicates() {
        let mut config = Config::default();
        config.tracking.max_days_to_persist = 0;
        let state = state(config, Arc::new(MockUploader::new()));

        let good = RawFix::new(1.0, 1.0).with_timestamp(1_000);
        let source = ScriptedPositionSource::new([
            good.clone(),
            good.with_timestamp(2_000),
            RawFix::default(),
        ]);
        let summary = Runner::new(state).run(source).await;
        assert_eq!(summary.accepted, 1);
        assert_eq!(summary.discarded, 1);
        assert_eq!(summary.rejected, 1);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let state = state(Config::default(), Arc::new(MockUploader::new()));
        state.shutdown.cancel();

        let source = ScriptedPositionSource::new(fixes(5)).with_interval(Duration::from_secs(3600));
        let summary = Runner::new(state).run(source).await;
        assert_eq!(summary.accepted, 0);
    }

    #[tokio::test]
    async fn test_run_consumes_motion_hints() {
        let mut config = Config::default();
        config.tracking.max_days_to_persist = 0;
        let state = state(config, Arc::new(MockUploader::new()));
        let mut events = state.events().subscribe();

        // Too inaccurate to wake the detector on its own
        let fix = RawFix::new(48.0, 11.0).with_accuracy(500.0);
        let source = ScriptedPositionSource::new([fix]).with_interval(Duration::from_millis(50));
        let hints = ScriptedHintSource::new([MotionHint::Moving(ActivityType::Walking)]);

        let summary = Runner::new(Arc::clone(&state)).with_hints(hints).run(source).await;
        assert_eq!(summary.accepted, 1);

        let mut saw_moving = false;
        while let Ok(event) = events.try_recv() {
            saw_moving |= matches!(event, TrackerEvent::MotionChange { is_moving: true, .. });
        }
        assert!(saw_moving);
        assert!(state.config().read().await.is_moving);
    }

    #[tokio::test]
    async fn test_distance_filter_forwarded_to_source() {
        let mut config = Config::default();
        config.tracking.distance_filter = 50.0;
        let state = state(config, Arc::new(MockUploader::new()));

        let mut events = state.events().subscribe();
        let mut source = ScriptedPositionSource::new(Vec::new());
        state
            .events()
            .send(TrackerEvent::DistanceFilterChange { distance_filter: 150.0 });
        forward_distance_filter(&mut events, &mut source);
        assert_eq!(source.distance_filters(), &[150.0]);
    }
}
