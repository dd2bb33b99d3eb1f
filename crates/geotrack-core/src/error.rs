//! Error types for geotrack-core.
//!
//! Ingestion and queue failures are returned to the caller. Upload failures
//! never cross the sync engine boundary: they surface as a
//! [`TrackerEvent::SyncResponse`](crate::TrackerEvent::SyncResponse) and as
//! unlocked rows in the queue.
//!
//! | Error | Retried | Effect |
//! |-------|---------|--------|
//! | [`Error::Validation`] | No | Fix dropped |
//! | [`Error::Persistence`] | No | Fix lost, logged |
//! | [`UploadError::Network`] | Next trigger | All locks released |
//! | Non-2xx response | Next trigger | Batch unlocked |
//! | [`ScheduleError`](crate::schedule::ScheduleError) | No | Window skipped |

use std::time::Duration;

use thiserror::Error;

use geotrack_types::ValidationError;

use crate::schedule::ScheduleError;

/// Errors returned by the tracker.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new error variants
/// in future versions without breaking downstream code.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// The incoming fix was malformed.
    #[error("Invalid fix: {0}")]
    Validation(#[from] ValidationError),

    /// The queue could not be read or written.
    #[error("Persistence error: {0}")]
    Persistence(#[from] geotrack_store::Error),

    /// A schedule string could not be parsed.
    #[error(transparent)]
    Schedule(#[from] ScheduleError),

    /// Invalid configuration provided.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Result type alias using geotrack-core's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Failures of a single upload attempt.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum UploadError {
    /// Connection failure or other transport problem.
    #[error("Network error: {0}")]
    Network(String),

    /// No response within the configured timeout.
    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    /// The batch could not be encoded.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The request could not be built (bad URL, header, or method).
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

impl From<reqwest::Error> for UploadError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_builder() {
            UploadError::InvalidRequest(err.to_string())
        } else {
            UploadError::Network(err.to_string())
        }
    }
}
