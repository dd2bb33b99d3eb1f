//! Tracking configuration shared by every pipeline stage.
//!
//! One [`TrackingConfig`] lives behind a [`SharedConfig`] for the lifetime of
//! the tracker. Ingestion owns `is_moving` and `odometer`, the schedule runner
//! owns `enabled`; everything else is written only by the embedding
//! application.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use geotrack_types::Extras;

/// Minimum effective stationary radius in meters.
pub const MIN_STATIONARY_RADIUS: f64 = 25.0;
/// Shortest stop timeout the motion timer will use.
pub const MIN_STOP_TIMEOUT: Duration = Duration::from_secs(60);
/// Longest stop timeout the motion timer will use.
pub const MAX_STOP_TIMEOUT: Duration = Duration::from_secs(300);
/// Fixes less accurate than this never drive elasticity.
pub const MAX_ELASTIC_ACCURACY: f64 = 100.0;

/// Configuration handle shared between tracker components.
pub type SharedConfig = Arc<RwLock<TrackingConfig>>;

/// Wrap a configuration for sharing.
pub fn shared(config: TrackingConfig) -> SharedConfig {
    Arc::new(RwLock::new(config))
}

/// HTTP method used for uploads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    #[default]
    Post,
    Put,
}

impl HttpMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
        }
    }
}

impl std::fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Process-wide tracking options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackingConfig {
    /// Minimum travel in meters before the position source emits a new fix.
    pub distance_filter: f64,
    /// Radius in meters that must be left before a pending stop is cancelled.
    pub stationary_radius: f64,
    pub elasticity_multiplier: f64,
    pub disable_elasticity: bool,
    /// Minutes without movement before the tracker declares itself stationary.
    pub stop_timeout: u32,
    pub disable_stop_detection: bool,
    /// Disable tracking when the device becomes stationary.
    pub stop_on_stationary: bool,
    /// Worst accuracy in meters for a fix that can wake the tracker.
    pub desired_accuracy: f64,
    pub allow_identical_locations: bool,

    pub url: String,
    pub method: HttpMethod,
    pub headers: BTreeMap<String, String>,
    /// Merged as top-level keys into every upload body.
    pub params: Extras,
    /// Merged into every record's `extras`.
    pub extras: Extras,
    pub auto_sync: bool,
    /// Unlocked records required before an automatic sync (0 = always).
    pub auto_sync_threshold: u32,
    pub batch_sync: bool,
    pub max_batch_size: u32,
    /// Upload timeout in seconds.
    pub http_timeout: u64,

    /// Retention by age in days (0 = keep forever).
    pub max_days_to_persist: u32,
    /// Retention by count (0 = unbounded).
    pub max_records_to_persist: u64,

    pub schedule: Vec<String>,

    pub enabled: bool,
    pub is_moving: bool,
    /// Accumulated distance in kilometers.
    pub odometer: f64,
}

impl Default for TrackingConfig {
    fn default() -> Self {
        Self {
            distance_filter: 10.0,
            stationary_radius: 25.0,
            elasticity_multiplier: 1.0,
            disable_elasticity: false,
            stop_timeout: 5,
            disable_stop_detection: false,
            stop_on_stationary: false,
            desired_accuracy: 100.0,
            allow_identical_locations: false,
            url: String::new(),
            method: HttpMethod::Post,
            headers: BTreeMap::new(),
            params: Extras::new(),
            extras: Extras::new(),
            auto_sync: true,
            auto_sync_threshold: 0,
            batch_sync: true,
            max_batch_size: 250,
            http_timeout: 30,
            max_days_to_persist: 1,
            max_records_to_persist: 10_000,
            schedule: Vec::new(),
            enabled: false,
            is_moving: false,
            odometer: 0.0,
        }
    }
}

impl TrackingConfig {
    /// Restore every option to its default.
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Stationary radius with the 25 m floor applied.
    pub fn effective_stationary_radius(&self) -> f64 {
        self.stationary_radius.max(MIN_STATIONARY_RADIUS)
    }

    /// Stop-timer duration, clamped to 1-5 minutes.
    pub fn stop_timeout_duration(&self) -> Duration {
        Duration::from_secs(u64::from(self.stop_timeout) * 60).clamp(MIN_STOP_TIMEOUT, MAX_STOP_TIMEOUT)
    }

    /// Distance filter widened for the given speed in m/s.
    ///
    /// ```
    /// use geotrack_core::TrackingConfig;
    ///
    /// let config = TrackingConfig { distance_filter: 50.0, ..Default::default() };
    /// assert_eq!(config.calculate_distance_filter(36.0), 400.0);
    /// assert_eq!(config.calculate_distance_filter(0.0), 50.0);
    /// ```
    pub fn calculate_distance_filter(&self, speed: f64) -> f64 {
        if speed <= 0.0 || !speed.is_finite() || self.disable_elasticity {
            return self.distance_filter;
        }
        let speed_factor = (speed / 5.0 + 0.5).floor().max(0.0);
        self.distance_filter + self.distance_filter * self.elasticity_multiplier * speed_factor
    }

    /// Records to take per sync request.
    pub fn batch_limit(&self) -> usize {
        if self.batch_sync {
            self.max_batch_size as usize
        } else {
            1
        }
    }

    /// Upload timeout as a duration.
    pub fn http_timeout_duration(&self) -> Duration {
        Duration::from_secs(self.http_timeout)
    }

    /// Whether a freshly persisted record should start a sync.
    pub fn should_auto_sync(&self, unlocked: u64) -> bool {
        self.enabled
            && self.auto_sync
            && !self.url.is_empty()
            && (self.auto_sync_threshold == 0 || unlocked >= u64::from(self.auto_sync_threshold))
    }

    /// Validate the options, reporting each problem with its field path.
    pub fn validate(&self, prefix: &str) -> Vec<FieldError> {
        let mut errors = Vec::new();
        let mut push = |field: &str, message: String| {
            errors.push(FieldError {
                field: format!("{}.{}", prefix, field),
                message,
            });
        };

        if !self.distance_filter.is_finite() || self.distance_filter < 0.0 {
            push(
                "distance_filter",
                format!("must be a non-negative number, got {}", self.distance_filter),
            );
        }
        if !self.stationary_radius.is_finite() || self.stationary_radius < 0.0 {
            push(
                "stationary_radius",
                format!("must be a non-negative number, got {}", self.stationary_radius),
            );
        }
        if !self.elasticity_multiplier.is_finite() || self.elasticity_multiplier < 0.0 {
            push(
                "elasticity_multiplier",
                format!("must be a non-negative number, got {}", self.elasticity_multiplier),
            );
        }
        if !self.desired_accuracy.is_finite() || self.desired_accuracy <= 0.0 {
            push(
                "desired_accuracy",
                format!("must be positive, got {}", self.desired_accuracy),
            );
        }
        if self.max_batch_size == 0 {
            push("max_batch_size", "must be at least 1".to_string());
        }
        if self.http_timeout == 0 {
            push("http_timeout", "must be at least 1 second".to_string());
        }
        if !self.url.is_empty() && !self.url.starts_with("http://") && !self.url.starts_with("https://") {
            push(
                "url",
                format!("must start with http:// or https://, got '{}'", self.url),
            );
        }
        for name in self.headers.keys() {
            if name.is_empty() || name.chars().any(|c| c.is_whitespace() || c == ':') {
                push("headers", format!("invalid header name '{}'", name));
            }
        }
        if let Some(key) = self.params.keys().find(|k| k.as_str() == "locations") {
            push(
                "params",
                format!("'{}' is reserved for the batch payload", key),
            );
        }
        for (i, spec) in self.schedule.iter().enumerate() {
            if let Err(e) = crate::schedule::ScheduleWindow::parse(spec) {
                push(&format!("schedule[{}]", i), e.reason);
            }
        }

        errors
    }
}

/// A single configuration problem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldError {
    /// The field path (e.g., `tracking.max_batch_size`).
    pub field: String,
    /// Description of the validation failure.
    pub message: String,
}

impl std::fmt::Display for FieldError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}
