//! Geodesic helpers on a spherical earth.

/// Mean earth radius in meters (IUGG).
pub const EARTH_RADIUS_M: f64 = 6_371_008.8;

/// Haversine distance between two points in meters.
#[must_use]
pub fn distance_meters(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let phi1 = lat1.to_radians();
    let phi2 = lat2.to_radians();
    let d_phi = (lat2 - lat1).to_radians();
    let d_lambda = (lon2 - lon1).to_radians();

    let a = (d_phi / 2.0).sin().powi(2) + phi1.cos() * phi2.cos() * (d_lambda / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_M * a.sqrt().min(1.0).asin()
}

/// Point reached by travelling `meters` from a start along `bearing` degrees.
///
/// Returns `(latitude, longitude)` with longitude normalized to [-180, 180].
#[must_use]
pub fn destination(lat: f64, lon: f64, bearing: f64, meters: f64) -> (f64, f64) {
    let delta = meters / EARTH_RADIUS_M;
    let theta = bearing.to_radians();
    let phi1 = lat.to_radians();
    let lambda1 = lon.to_radians();

    let phi2 = (phi1.sin() * delta.cos() + phi1.cos() * delta.sin() * theta.cos()).asin();
    let lambda2 = lambda1
        + (theta.sin() * delta.sin() * phi1.cos()).atan2(delta.cos() - phi1.sin() * phi2.sin());

    let lon2 = (lambda2.to_degrees() + 540.0) % 360.0 - 180.0;
    (phi2.to_degrees(), lon2)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_distance_zero_for_same_point() {
        assert_eq!(distance_meters(52.52, 13.405, 52.52, 13.405), 0.0);
    }

    #[test]
    fn test_distance_one_degree_latitude() {
        // One degree of latitude is ~111.2 km on the mean sphere
        let d = distance_meters(0.0, 0.0, 1.0, 0.0);
        assert!((d - 111_195.0).abs() < 10.0, "got {d}");
    }

    #[test]
    fn test_distance_across_antimeridian() {
        let d = distance_meters(0.0, 179.9995, 0.0, -179.9995);
        assert!((d - 111.2).abs() < 1.0, "got {d}");
    }

    #[test]
    fn test_destination_north() {
        let (lat, lon) = destination(10.0, 20.0, 0.0, 50.0);
        assert!(lat > 10.0);
        assert!((lon - 20.0).abs() < 1e-9);
        assert!((distance_meters(10.0, 20.0, lat, lon) - 50.0).abs() < 1e-6);
    }

    proptest! {
        #[test]
        fn prop_distance_symmetric(
            lat1 in -89.0f64..89.0, lon1 in -179.0f64..179.0,
            lat2 in -89.0f64..89.0, lon2 in -179.0f64..179.0,
        ) {
            let a = distance_meters(lat1, lon1, lat2, lon2);
            let b = distance_meters(lat2, lon2, lat1, lon1);
            prop_assert!((a - b).abs() < 1e-6);
            prop_assert!(a >= 0.0);
        }

        #[test]
        fn prop_destination_round_trips_distance(
            lat in -80.0f64..80.0, lon in -179.0f64..179.0,
            bearing in 0.0f64..360.0, meters in 0.0f64..5_000.0,
        ) {
            let (lat2, lon2) = destination(lat, lon, bearing, meters);
            prop_assert!((distance_meters(lat, lon, lat2, lon2) - meters).abs() < 1e-3);
        }
    }
}
