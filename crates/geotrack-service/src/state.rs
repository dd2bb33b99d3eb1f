//! Application state shared by the agent's tasks.

use std::sync::Arc;

use time::OffsetDateTime;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use geotrack_core::{
    EventDispatcher, HttpUploader, NetworkSignal, Schedule, ScheduleRunner, SharedConfig, Tracker,
    UploadError, Uploader, shared,
};
use geotrack_store::Store;

use crate::config::{Config, ServiceConfig};

/// Result of a retention pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PruneReport {
    pub removed: u64,
    pub remaining: u64,
}

impl PruneReport {
    /// Rows written by another process between the two counts are not
    /// reported as removed.
    pub fn new(before: u64, after: u64) -> Self {
        Self {
            removed: before.saturating_sub(after),
            remaining: after,
        }
    }
}

/// Shared agent state.
pub struct AppState {
    /// The ingestion pipeline, which owns the queue, motion detector and
    /// sync engine.
    pub tracker: Tracker,
    pub service: ServiceConfig,
    /// Connectivity signal driving opportunistic syncs.
    pub network: NetworkSignal,
    /// Cancelled to stop every background task.
    pub shutdown: CancellationToken,
    pub started_at: OffsetDateTime,
}

impl AppState {
    /// Create state that uploads over HTTP.
    ///
    /// Connection attempts time out after the configured `http_timeout`.
    pub fn new(store: Store, config: Config) -> Result<Arc<Self>, UploadError> {
        let uploader = HttpUploader::with_connect_timeout(config.tracking.http_timeout_duration())?;
        Ok(Self::with_uploader(store, config, Arc::new(uploader)))
    }

    /// Create state with a custom uploader.
    pub fn with_uploader(store: Store, config: Config, uploader: Arc<dyn Uploader>) -> Arc<Self> {
        let events = EventDispatcher::new(config.service.event_buffer);
        let tracker = Tracker::with_uploader(
            Arc::new(Mutex::new(store)),
            shared(config.tracking),
            events,
            uploader,
        );
        Arc::new(Self {
            tracker,
            service: config.service,
            network: NetworkSignal::default(),
            shutdown: CancellationToken::new(),
            started_at: OffsetDateTime::now_utc(),
        })
    }

    pub fn config(&self) -> &SharedConfig {
        self.tracker.config()
    }

    pub fn events(&self) -> &EventDispatcher {
        self.tracker.events()
    }

    /// Apply the retention policy and report how many rows went away.
    pub async fn prune(&self) -> Result<PruneReport, geotrack_store::Error> {
        let before = self.tracker.store().lock().await.count(false)?;
        self.tracker.apply_retention().await;
        let after = self.tracker.store().lock().await.count(false)?;
        Ok(PruneReport::new(before, after))
    }

    /// Build a schedule runner from the configured schedule strings.
    ///
    /// Invalid entries are logged and skipped.
    pub async fn schedule_runner(&self) -> ScheduleRunner {
        let specs = self.config().read().await.schedule.clone();
        let (schedule, errors) = Schedule::parse_all(&specs);
        for error in errors {
            warn!("{}", error);
        }
        ScheduleRunner::new(schedule, self.config().clone(), self.events().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use geotrack_core::mock::MockUploader;
    use geotrack_core::{AcceptOutcome, TrackerEvent};
    use geotrack_types::RawFix;

    fn state(config: Config) -> Arc<AppState> {
        let store = Store::open_in_memory().unwrap();
        AppState::with_uploader(store, config, Arc::new(MockUploader::new()))
    }

    #[tokio::test]
    async fn test_app_state_uses_tracking_config() {
        let mut config = Config::default();
        config.tracking.distance_filter = 42.0;
        let state = state(config);

        assert_eq!(state.config().read().await.distance_filter, 42.0);
        assert!(!state.shutdown.is_cancelled());
        assert!(state.network.is_available());
    }

    #[tokio::test]
    async fn test_app_state_with_http_uploader() {
        let mut config = Config::default();
        config.tracking.http_timeout = 5;
        let state = AppState::new(Store::open_in_memory().unwrap(), config).unwrap();
        assert_eq!(state.config().read().await.http_timeout, 5);
    }

    #[tokio::test]
    async fn test_app_state_events_reach_subscribers() {
        let mut config = Config::default();
        config.tracking.enabled = true;
        let state = state(config);
        let mut rx = state.events().subscribe();

        let outcome = state.tracker.accept(RawFix::new(1.0, 2.0)).await.unwrap();
        assert!(matches!(outcome, AcceptOutcome::Accepted { .. }));

        let mut saw_location = false;
        while let Ok(event) = rx.try_recv() {
            saw_location |= matches!(event, TrackerEvent::Location { .. });
        }
        assert!(saw_location);
    }

    #[tokio::test]
    async fn test_prune_reports_removed_rows() {
        let mut config = Config::default();
        config.tracking.enabled = true;
        config.tracking.max_days_to_persist = 0;
        let state = state(config);
        for i in 0..4 {
            state
                .tracker
                .accept(RawFix::new(f64::from(i), 1.0))
                .await
                .unwrap();
        }

        state.config().write().await.max_records_to_persist = 1;
        let report = state.prune().await.unwrap();
        assert_eq!(report, PruneReport { removed: 3, remaining: 1 });
    }

    #[test]
    fn test_prune_report_never_underflows() {
        let report = PruneReport::new(2, 5);
        assert_eq!(report.removed, 0);
        assert_eq!(report.remaining, 5);
    }

    #[tokio::test]
    async fn test_schedule_runner_skips_invalid_entries() {
        let mut config = Config::default();
        config.tracking.schedule = vec!["1-5 09:00-17:00".into(), "garbage".into()];
        let state = state(config);

        // One valid window means there is always a next transition
        let runner = state.schedule_runner().await;
        assert!(runner.next().await.is_some());
    }
}
