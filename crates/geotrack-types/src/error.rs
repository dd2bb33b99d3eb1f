//! Validation errors for incoming position fixes.

use thiserror::Error;

/// Errors raised when a raw fix cannot become a location record.
///
/// These are never retried: the offending fix is dropped.
#[derive(Debug, Clone, PartialEq, Error)]
#[non_exhaustive]
pub enum ValidationError {
    /// The fix carried no latitude or no longitude.
    #[error("Fix has no coordinates")]
    MissingCoordinates,

    /// Latitude outside [-90, 90] or not a finite number.
    #[error("Invalid latitude: {0}")]
    InvalidLatitude(f64),

    /// Longitude outside [-180, 180] or not a finite number.
    #[error("Invalid longitude: {0}")]
    InvalidLongitude(f64),

    /// Negative or non-finite horizontal accuracy.
    #[error("Invalid accuracy: {0}")]
    InvalidAccuracy(f64),
}

/// Result type alias for fix validation.
pub type ValidationResult<T> = std::result::Result<T, ValidationError>;
