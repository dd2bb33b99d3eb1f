//! Background task that applies schedule transitions.

use std::sync::Arc;
use std::time::Duration;

use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::SharedConfig;
use crate::events::{EventDispatcher, TrackerEvent};
use crate::schedule::{Schedule, Transition};

/// Source of wall-clock time for schedule evaluation.
pub type Clock = Arc<dyn Fn() -> OffsetDateTime + Send + Sync>;

/// Local time when the offset is known, UTC otherwise.
pub fn local_now() -> OffsetDateTime {
    OffsetDateTime::now_local().unwrap_or_else(|_| OffsetDateTime::now_utc())
}

/// Sleeps until each computed transition and flips `enabled` in the config.
pub struct ScheduleRunner {
    schedule: Schedule,
    config: SharedConfig,
    events: EventDispatcher,
    clock: Clock,
}

impl ScheduleRunner {
    pub fn new(schedule: Schedule, config: SharedConfig, events: EventDispatcher) -> Self {
        Self {
            schedule,
            config,
            events,
            clock: Arc::new(local_now),
        }
    }

    /// Replace the wall clock.
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    /// Compute the next transition from the current config state.
    pub async fn next(&self) -> Option<Transition> {
        let enabled = self.config.read().await.enabled;
        self.schedule.next_transition((self.clock)(), enabled)
    }

    /// Apply a transition immediately.
    pub async fn apply(&self, transition: &Transition) {
        {
            let mut config = self.config.write().await;
            config.enabled = transition.enabled;
        }
        info!(
            "Schedule {} tracking (mode: {})",
            if transition.enabled { "enabled" } else { "disabled" },
            transition.tracking_mode
        );
        self.events.send(TrackerEvent::ScheduleTransition {
            enabled: transition.enabled,
            tracking_mode: transition.tracking_mode,
        });
    }

    /// Run until `cancel` fires or the schedule has nothing left to do.
    pub async fn run(self, cancel: CancellationToken) {
        if self.schedule.is_empty() {
            info!("No schedule configured");
            return;
        }

        info!("Starting scheduler with {} window(s)", self.schedule.windows().len());

        loop {
            let Some(transition) = self.next().await else {
                warn!("Scheduler stopped: no upcoming schedule window");
                return;
            };

            let wait = transition.fire_at - (self.clock)();
            let wait = Duration::try_from(wait).unwrap_or(Duration::ZERO);
            debug!("Next schedule transition in {:?}", wait);

            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Scheduler cancelled");
                    return;
                }
                _ = tokio::time::sleep(wait) => {}
            }

            self.apply(&transition).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{TrackingConfig, shared};
    use time::macros::datetime;

    /// Wall clock that follows tokio's paused clock.
    fn tokio_clock(start: OffsetDateTime) -> Clock {
        let origin = tokio::time::Instant::now();
        Arc::new(move || start + (tokio::time::Instant::now() - origin))
    }

    fn runner(specs: &[&str], enabled: bool, start: OffsetDateTime) -> (ScheduleRunner, SharedConfig, EventDispatcher) {
        let (schedule, errors) = Schedule::parse_all(specs);
        assert!(errors.is_empty());
        let config = shared(TrackingConfig {
            enabled,
            ..Default::default()
        });
        let events = EventDispatcher::default();
        let runner = ScheduleRunner::new(schedule, config.clone(), events.clone())
            .with_clock(tokio_clock(start));
        (runner, config, events)
    }

    #[tokio::test(start_paused = true)]
    async fn test_next_uses_config_state() {
        let (runner, config, _) = runner(&["1-5 09:00-17:00"], true, datetime!(2024-06-05 10:00 UTC));
        let t = runner.next().await.unwrap();
        assert!(!t.enabled);

        config.write().await.enabled = false;
        let t = runner.next().await.unwrap();
        assert!(t.enabled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_enables_then_disables() {
        let (runner, config, events) = runner(&["1-5 09:00-17:00"], false, datetime!(2024-06-05 08:00 UTC));
        let mut rx = events.subscribe();
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(runner.run(cancel.clone()));

        match rx.recv().await.unwrap() {
            TrackerEvent::ScheduleTransition { enabled, .. } => assert!(enabled),
            other => panic!("unexpected event {other:?}"),
        }
        assert!(config.read().await.enabled);

        match rx.recv().await.unwrap() {
            TrackerEvent::ScheduleTransition { enabled, .. } => assert!(!enabled),
            other => panic!("unexpected event {other:?}"),
        }
        assert!(!config.read().await.enabled);

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_cancel_before_transition() {
        let (runner, config, _) = runner(&["1-5 09:00-17:00"], false, datetime!(2024-06-05 18:00 UTC));
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(runner.run(cancel.clone()));

        tokio::time::sleep(Duration::from_secs(60)).await;
        cancel.cancel();
        handle.await.unwrap();
        assert!(!config.read().await.enabled);
    }

    #[tokio::test]
    async fn test_run_empty_schedule_returns() {
        let config = shared(TrackingConfig::default());
        let runner = ScheduleRunner::new(Schedule::default(), config, EventDispatcher::default());
        runner.run(CancellationToken::new()).await;
    }
}
