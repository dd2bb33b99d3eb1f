//! Motion state machine.
//!
//! The detector starts STATIONARY (or whatever `is_moving` the config was
//! loaded with). A qualifying fix or a moving hint switches it to MOVING.
//! While moving, every fix re-arms a stop timer at its position. Once a
//! "still" hint starts stop detection, fixes only re-arm the timer when they
//! leave the stationary radius around the armed position. When the timer
//! fires the detector switches back to STATIONARY.

use std::sync::Arc;

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use geotrack_types::{ActivityType, Coords};

use crate::config::{MAX_ELASTIC_ACCURACY, SharedConfig, TrackingConfig};
use crate::events::{EventDispatcher, TrackerEvent};

/// Activity signal from a motion-hint provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MotionHint {
    Moving(ActivityType),
    Still,
}

impl MotionHint {
    pub fn from_activity(activity: ActivityType) -> Self {
        if activity.is_still() {
            MotionHint::Still
        } else {
            MotionHint::Moving(activity)
        }
    }

    pub fn is_still(self) -> bool {
        self == MotionHint::Still
    }
}

#[derive(Debug, Default)]
struct State {
    /// Position the pending stop timer was armed at.
    armed_at: Option<Coords>,
    timer: Option<CancellationToken>,
    /// Bumped on every arm/cancel so a stale timer cannot fire.
    generation: u64,
    last_hint: Option<MotionHint>,
    /// A still hint arrived while moving; fixes inside the radius no
    /// longer postpone the stop.
    stop_detection: bool,
    last_location: Option<Coords>,
    /// Last published effective distance filter.
    distance_filter: Option<f64>,
}

impl State {
    fn cancel_timer(&mut self) {
        if let Some(token) = self.timer.take() {
            token.cancel();
        }
        self.armed_at = None;
        self.generation += 1;
    }
}

struct Inner {
    config: SharedConfig,
    events: EventDispatcher,
    state: Mutex<State>,
}

/// Tracks MOVING/STATIONARY and owns the stop timer.
///
/// Cloning yields another handle to the same detector.
#[derive(Clone)]
pub struct MotionDetector {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for MotionDetector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MotionDetector").finish_non_exhaustive()
    }
}

impl MotionDetector {
    pub fn new(config: SharedConfig, events: EventDispatcher) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                events,
                state: Mutex::new(State::default()),
            }),
        }
    }

    /// Current motion state.
    pub async fn is_moving(&self) -> bool {
        self.inner.config.read().await.is_moving
    }

    /// Whether a stop timer is pending.
    pub async fn is_stop_pending(&self) -> bool {
        self.inner.state.lock().await.timer.is_some()
    }

    /// Effective distance filter last published to the position source.
    pub async fn distance_filter(&self) -> f64 {
        let published = self.inner.state.lock().await.distance_filter;
        match published {
            Some(value) => value,
            None => self.inner.config.read().await.distance_filter,
        }
    }

    /// Feed an accepted fix, with the activity hint it carried if any.
    pub async fn on_fix(&self, coords: &Coords, hint: Option<MotionHint>) {
        let mut state = self.inner.state.lock().await;
        let config = self.inner.config.read().await.clone();

        if hint.is_some() {
            state.last_hint = hint;
        }
        let hint = state.last_hint;
        state.last_location = Some(*coords);

        if config.disable_stop_detection {
            self.update_distance_filter(&mut state, &config, coords);
            return;
        }

        if !config.is_moving {
            let qualifies = coords.accuracy <= config.desired_accuracy && !hint.is_some_and(MotionHint::is_still);
            if !qualifies {
                debug!("Fix does not wake the tracker (accuracy {:.1} m)", coords.accuracy);
                return;
            }
            self.transition(&mut state, true).await;
            let config = self.inner.config.read().await.clone();
            self.arm(&mut state, &config, Some(*coords));
            self.update_distance_filter(&mut state, &config, coords);
            return;
        }

        if !hint.is_some_and(MotionHint::is_still) {
            state.stop_detection = false;
            self.arm(&mut state, &config, Some(*coords));
        } else if !state.stop_detection {
            if self.begin_stop_detection(&mut state, &config).await {
                return;
            }
        } else {
            match state.armed_at {
                Some(armed_at) => {
                    let moved = armed_at.distance_to(coords) - armed_at.accuracy - coords.accuracy;
                    if moved > config.effective_stationary_radius() {
                        debug!("Left stationary radius ({:.1} m); re-arming stop timer", moved);
                        self.arm(&mut state, &config, Some(*coords));
                    }
                }
                None => self.arm(&mut state, &config, Some(*coords)),
            }
        }

        self.update_distance_filter(&mut state, &config, coords);
    }

    /// Feed an activity hint from the motion-hint provider.
    pub async fn on_hint(&self, hint: MotionHint) {
        let mut state = self.inner.state.lock().await;
        let config = self.inner.config.read().await.clone();
        let previous = state.last_hint.replace(hint);
        if previous == Some(hint) {
            return;
        }
        debug!("Motion hint: {:?}", hint);

        if config.disable_stop_detection {
            if config.is_moving == hint.is_still() {
                self.transition(&mut state, !hint.is_still()).await;
            }
            return;
        }

        match (hint, config.is_moving) {
            (MotionHint::Moving(_), false) => {
                self.transition(&mut state, true).await;
                let config = self.inner.config.read().await.clone();
                let location = state.last_location;
                self.arm(&mut state, &config, location);
            }
            (MotionHint::Moving(_), true) => {
                state.stop_detection = false;
                let location = state.last_location;
                self.arm(&mut state, &config, location);
            }
            (MotionHint::Still, true) => {
                self.begin_stop_detection(&mut state, &config).await;
            }
            (MotionHint::Still, false) => {}
        }
    }

    /// Force the motion state.
    pub async fn change_pace(&self, is_moving: bool) {
        let mut state = self.inner.state.lock().await;
        let currently = self.inner.config.read().await.is_moving;
        if currently == is_moving {
            return;
        }
        self.transition(&mut state, is_moving).await;
        if is_moving {
            let config = self.inner.config.read().await.clone();
            let location = state.last_location;
            self.arm(&mut state, &config, location);
        }
    }

    /// Cancel any pending stop timer.
    pub async fn shutdown(&self) {
        self.inner.state.lock().await.cancel_timer();
    }

    /// Returns true when the detector went stationary immediately.
    async fn begin_stop_detection(&self, state: &mut State, config: &TrackingConfig) -> bool {
        if config.stop_timeout == 0 {
            self.transition(state, false).await;
            self.on_stationary().await;
            return true;
        }
        state.stop_detection = true;
        let location = state.last_location;
        self.arm(state, config, location);
        false
    }

    fn arm(&self, state: &mut State, config: &TrackingConfig, at: Option<Coords>) {
        state.cancel_timer();
        state.armed_at = at;
        let generation = state.generation;
        let token = CancellationToken::new();
        state.timer = Some(token.clone());

        let duration = config.stop_timeout_duration();
        debug!("Stop timer armed for {:?}", duration);

        let detector = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(duration) => detector.on_timer(generation).await,
            }
        });
    }

    async fn on_timer(&self, generation: u64) {
        let mut state = self.inner.state.lock().await;
        if state.generation != generation {
            return;
        }
        state.timer = None;
        info!("Stop timeout expired");
        if self.inner.config.read().await.is_moving {
            self.transition(&mut state, false).await;
            self.on_stationary().await;
        }
    }

    async fn on_stationary(&self) {
        let mut config = self.inner.config.write().await;
        if config.stop_on_stationary && config.enabled {
            config.enabled = false;
            drop(config);
            info!("Stopped on stationary");
            self.inner.events.send(TrackerEvent::EnabledChange { enabled: false });
        }
    }

    async fn transition(&self, state: &mut State, is_moving: bool) {
        let base_filter = {
            let mut config = self.inner.config.write().await;
            config.is_moving = is_moving;
            config.distance_filter
        };
        state.stop_detection = false;
        if !is_moving {
            state.cancel_timer();
            self.publish_distance_filter(state, base_filter);
        }
        info!("Motion change: is_moving={}", is_moving);
        self.inner.events.send(TrackerEvent::MotionChange {
            is_moving,
            location: state.last_location,
        });
    }

    fn update_distance_filter(&self, state: &mut State, config: &TrackingConfig, coords: &Coords) {
        if !config.is_moving {
            self.publish_distance_filter(state, config.distance_filter);
            return;
        }
        if config.disable_elasticity || config.distance_filter <= 0.0 {
            self.publish_distance_filter(state, config.distance_filter);
            return;
        }
        if coords.accuracy > MAX_ELASTIC_ACCURACY {
            return;
        }
        if let Some(speed) = coords.speed {
            self.publish_distance_filter(state, config.calculate_distance_filter(speed));
        }
    }

    fn publish_distance_filter(&self, state: &mut State, value: f64) {
        if state.distance_filter == Some(value) {
            return;
        }
        state.distance_filter = Some(value);
        debug!("Distance filter: {:.1} m", value);
        self.inner
            .events
            .send(TrackerEvent::DistanceFilterChange { distance_filter: value });
    }
}
