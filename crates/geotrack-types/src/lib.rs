//! Platform-agnostic types for the geotrack location pipeline.
//!
//! This crate holds the data that flows between the position source, the
//! persistent queue and the upload endpoint:
//!
//! - [`RawFix`]: a raw sample from a position provider
//! - [`LocationRecord`]: the queued event and its JSON wire shape
//! - Activity and battery snapshots
//! - Geodesic helpers in [`geo`]
//!
//! # Example
//!
//! ```
//! use geotrack_types::{RawFix, LocationRecord};
//!
//! let fix = RawFix::new(52.52, 13.405).with_accuracy(8.0).with_speed(1.2);
//! let coords = fix.coords()?;
//! let record = LocationRecord::new(coords, 1_700_000_000_000);
//! assert_eq!(record.coords.accuracy, 8.0);
//! # Ok::<(), geotrack_types::ValidationError>(())
//! ```

pub mod error;
pub mod geo;
pub mod types;

pub use error::{ValidationError, ValidationResult};
pub use types::{
    Activity, ActivityType, Battery, Coords, Extras, LocationRecord, RawFix, TrackingMode,
    now_millis,
};
