//! Core types for position fixes and queued location records.

use core::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use time::OffsetDateTime;

use crate::error::{ValidationError, ValidationResult};
use crate::geo;

/// Free-form key/value payload attached to records.
pub type Extras = Map<String, Value>;

/// Current wall-clock time as epoch milliseconds.
#[must_use]
pub fn now_millis() -> i64 {
    (OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
}

/// Physical activity reported by a motion provider or inferred from speed.
///
/// This enum is marked `#[non_exhaustive]` so providers can report
/// new activity kinds without breaking downstream matches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum ActivityType {
    Still,
    InVehicle,
    OnBicycle,
    OnFoot,
    Walking,
    Running,
    #[default]
    #[serde(other)]
    Unknown,
}

impl ActivityType {
    /// Infer an activity from ground speed in m/s.
    ///
    /// ```
    /// use geotrack_types::ActivityType;
    ///
    /// assert_eq!(ActivityType::from_speed(20.0), ActivityType::InVehicle);
    /// assert_eq!(ActivityType::from_speed(1.0), ActivityType::Walking);
    /// assert_eq!(ActivityType::from_speed(0.0), ActivityType::Still);
    /// ```
    #[must_use]
    pub fn from_speed(speed: f64) -> Self {
        if speed > 15.0 {
            ActivityType::InVehicle
        } else if speed > 5.0 {
            ActivityType::OnBicycle
        } else if speed > 2.0 {
            ActivityType::Running
        } else if speed > 0.5 {
            ActivityType::Walking
        } else {
            ActivityType::Still
        }
    }

    /// Returns true for [`ActivityType::Still`].
    #[must_use]
    pub fn is_still(self) -> bool {
        self == ActivityType::Still
    }

    /// Wire name of the activity.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            ActivityType::Still => "still",
            ActivityType::InVehicle => "in_vehicle",
            ActivityType::OnBicycle => "on_bicycle",
            ActivityType::OnFoot => "on_foot",
            ActivityType::Walking => "walking",
            ActivityType::Running => "running",
            ActivityType::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ActivityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Activity snapshot stored with a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Activity {
    #[serde(rename = "type")]
    pub kind: ActivityType,
    /// Confidence in percent (0-100).
    pub confidence: u8,
}

impl Activity {
    /// Confidence assigned when the activity is inferred from speed alone.
    pub const SPEED_CONFIDENCE: u8 = 50;
    /// Confidence assigned when a "still" hint is overridden by speed.
    pub const OVERRIDE_CONFIDENCE: u8 = 75;

    pub fn new(kind: ActivityType, confidence: u8) -> Self {
        Self {
            kind,
            confidence: confidence.min(100),
        }
    }

    /// Pick the activity to record for a fix.
    ///
    /// A provider hint wins unless it says "still" while the fix reports
    /// more than 0.5 m/s, in which case speed decides. Without a hint the
    /// activity is inferred from speed.
    #[must_use]
    pub fn resolve(hint: Option<Activity>, speed: Option<f64>) -> Self {
        let speed = speed.unwrap_or(0.0);
        match hint {
            Some(hint) if hint.kind.is_still() && speed > 0.5 => {
                Activity::new(ActivityType::from_speed(speed), Self::OVERRIDE_CONFIDENCE)
            }
            Some(hint) => hint,
            None => Activity::new(ActivityType::from_speed(speed), Self::SPEED_CONFIDENCE),
        }
    }
}

/// Battery snapshot stored with a record.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Battery {
    /// Charge level in the range 0.0-1.0.
    pub level: f64,
    pub is_charging: bool,
}

/// What the tracker does while a schedule window is active.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackingMode {
    /// Continuous location tracking.
    #[default]
    Location,
    /// Geofence-only monitoring.
    Geofence,
}

impl fmt::Display for TrackingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrackingMode::Location => f.write_str("location"),
            TrackingMode::Geofence => f.write_str("geofence"),
        }
    }
}

/// A raw position sample as delivered by a position source.
///
/// Coordinates are optional so that a malformed sample can be represented
/// and rejected by validation rather than failing to deserialize.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RawFix {
    /// Epoch milliseconds; "now" when absent.
    pub timestamp: Option<i64>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    /// Horizontal accuracy radius in meters.
    pub accuracy: f64,
    /// Ground speed in m/s.
    pub speed: Option<f64>,
    /// Course over ground in degrees.
    pub heading: Option<f64>,
    pub altitude: Option<f64>,
    pub altitude_accuracy: Option<f64>,
    /// Activity reported by the provider alongside this fix.
    pub activity: Option<Activity>,
    pub battery: Option<Battery>,
    pub extras: Option<Extras>,
}

impl RawFix {
    /// A fix at the given position with a timestamp of "now".
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            timestamp: Some(now_millis()),
            latitude: Some(latitude),
            longitude: Some(longitude),
            ..Default::default()
        }
    }

    pub fn with_timestamp(mut self, timestamp: i64) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    pub fn with_accuracy(mut self, accuracy: f64) -> Self {
        self.accuracy = accuracy;
        self
    }

    pub fn with_speed(mut self, speed: f64) -> Self {
        self.speed = Some(speed);
        self
    }

    pub fn with_heading(mut self, heading: f64) -> Self {
        self.heading = Some(heading);
        self
    }

    pub fn with_activity(mut self, kind: ActivityType, confidence: u8) -> Self {
        self.activity = Some(Activity::new(kind, confidence));
        self
    }

    pub fn with_battery(mut self, level: f64, is_charging: bool) -> Self {
        self.battery = Some(Battery { level, is_charging });
        self
    }

    pub fn with_extra(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.extras
            .get_or_insert_with(Extras::new)
            .insert(key.to_string(), value.into());
        self
    }

    /// Validate the sample and convert it into wire coordinates.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError`] when coordinates are missing, out of
    /// range, or accuracy is negative.
    pub fn coords(&self) -> ValidationResult<Coords> {
        let (Some(latitude), Some(longitude)) = (self.latitude, self.longitude) else {
            return Err(ValidationError::MissingCoordinates);
        };
        if !latitude.is_finite() || !(-90.0..=90.0).contains(&latitude) {
            return Err(ValidationError::InvalidLatitude(latitude));
        }
        if !longitude.is_finite() || !(-180.0..=180.0).contains(&longitude) {
            return Err(ValidationError::InvalidLongitude(longitude));
        }
        if !self.accuracy.is_finite() || self.accuracy < 0.0 {
            return Err(ValidationError::InvalidAccuracy(self.accuracy));
        }

        Ok(Coords {
            latitude,
            longitude,
            accuracy: self.accuracy,
            speed: self.speed.filter(|s| s.is_finite() && *s >= 0.0),
            heading: self.heading.filter(|h| h.is_finite() && *h >= 0.0),
            altitude: self.altitude,
            altitude_accuracy: self.altitude_accuracy,
        })
    }
}

/// Coordinate block of a location record.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coords {
    pub latitude: f64,
    pub longitude: f64,
    pub accuracy: f64,
    pub speed: Option<f64>,
    pub heading: Option<f64>,
    pub altitude: Option<f64>,
    pub altitude_accuracy: Option<f64>,
}

impl Coords {
    /// Great-circle distance to another coordinate in meters.
    #[must_use]
    pub fn distance_to(&self, other: &Coords) -> f64 {
        geo::distance_meters(self.latitude, self.longitude, other.latitude, other.longitude)
    }
}

/// One queued location event.
///
/// Serializes to the upload wire shape; `id` and `locked` are storage
/// bookkeeping and never leave the device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationRecord {
    /// Storage-assigned row id (0 until inserted).
    #[serde(skip)]
    pub id: i64,
    pub uuid: String,
    /// Epoch milliseconds of the fix.
    pub timestamp: i64,
    pub is_moving: bool,
    /// Odometer snapshot in kilometers.
    pub odometer: f64,
    pub coords: Coords,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub activity: Option<Activity>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub battery: Option<Battery>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extras: Option<Extras>,
    /// Owned by an in-flight sync cycle.
    #[serde(skip)]
    pub locked: bool,
}

impl LocationRecord {
    /// New unlocked record with a fresh v4 uuid.
    pub fn new(coords: Coords, timestamp: i64) -> Self {
        Self {
            id: 0,
            uuid: uuid::Uuid::new_v4().to_string(),
            timestamp,
            is_moving: false,
            odometer: 0.0,
            coords,
            activity: None,
            battery: None,
            extras: None,
            locked: false,
        }
    }
}
