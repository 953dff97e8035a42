//! Distance Engine - great-circle geometry and coordinate validation.
//!
//! Stateless. Everything here is a pure function of its arguments.

use geo::{HaversineDistance, Point};
use serde::{Deserialize, Serialize};

use crate::error::{Result, TrackerError};

/// Mean Earth radius used by the haversine formula (meters).
pub const EARTH_MEAN_RADIUS_M: f64 = 6_371_008.8;

/// Stored coordinates keep this many decimal digits (~0.11 m).
pub const COORDINATE_DECIMALS: i32 = 6;

const COORDINATE_SCALE: f64 = 1_000_000.0;

/// A WGS84 position in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinate {
    pub latitude: f64,
    pub longitude: f64,
}

impl Coordinate {
    /// Builds a coordinate without checking it.
    pub const fn new(latitude: f64, longitude: f64) -> Self {
        Self { latitude, longitude }
    }

    /// Builds a coordinate, rejecting out-of-range or non-finite values.
    pub fn try_new(latitude: f64, longitude: f64) -> Result<Self> {
        if validate_coordinate(latitude, longitude) {
            Ok(Self::new(latitude, longitude))
        } else {
            Err(TrackerError::coordinate(latitude, longitude))
        }
    }

    /// Returns the coordinate snapped to the stored precision.
    pub fn rounded(self) -> Self {
        Self::new(
            round_coordinate(self.latitude),
            round_coordinate(self.longitude),
        )
    }

    /// Great-circle distance to `other` in meters.
    pub fn distance_to(&self, other: &Coordinate) -> f64 {
        distance_m(*self, *other)
    }

    fn to_point(self) -> Point<f64> {
        // geo points are (x = longitude, y = latitude)
        Point::new(self.longitude, self.latitude)
    }
}

/// Great-circle (haversine) distance between two coordinates, in meters.
pub fn distance_m(a: Coordinate, b: Coordinate) -> f64 {
    a.to_point().haversine_distance(&b.to_point())
}

/// Returns `true` when `(latitude, longitude)` is a finite, in-range position.
pub fn validate_coordinate(latitude: f64, longitude: f64) -> bool {
    latitude.is_finite()
        && longitude.is_finite()
        && (-90.0..=90.0).contains(&latitude)
        && (-180.0..=180.0).contains(&longitude)
}

/// Snaps a degree value to [`COORDINATE_DECIMALS`] digits, half away from zero.
pub fn round_coordinate(value: f64) -> f64 {
    (value * COORDINATE_SCALE).round() / COORDINATE_SCALE
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use proptest::prelude::*;

    #[test]
    fn test_zero_distance() {
        let taipei = Coordinate::new(25.0330, 121.5654);
        assert_abs_diff_eq!(distance_m(taipei, taipei), 0.0, epsilon = 1e-9);
    }

    #[test]
    fn test_one_degree_of_latitude() {
        // One degree along a meridian is R * pi / 180
        let a = Coordinate::new(0.0, 0.0);
        let b = Coordinate::new(1.0, 0.0);
        let expected = EARTH_MEAN_RADIUS_M * std::f64::consts::PI / 180.0;
        assert_abs_diff_eq!(distance_m(a, b), expected, epsilon = 1e-6);
    }

    #[test]
    fn test_known_city_pair() {
        // Taipei 101 to Taipei Main Station is roughly 5 km
        let tower = Coordinate::new(25.0330, 121.5654);
        let station = Coordinate::new(25.0478, 121.5170);
        let d = distance_m(tower, station);
        assert!(d > 4_800.0 && d < 5_500.0, "got {d}");
    }

    #[test]
    fn test_validate_coordinate_bounds() {
        assert!(validate_coordinate(90.0, 180.0));
        assert!(validate_coordinate(-90.0, -180.0));
        assert!(validate_coordinate(0.0, 0.0));

        assert!(!validate_coordinate(90.000001, 0.0));
        assert!(!validate_coordinate(0.0, -180.5));
        assert!(!validate_coordinate(f64::NAN, 0.0));
        assert!(!validate_coordinate(0.0, f64::INFINITY));
    }

    #[test]
    fn test_try_new_reports_values() {
        let err = Coordinate::try_new(91.0, 10.0).unwrap_err();
        assert_eq!(err, TrackerError::coordinate(91.0, 10.0));
    }

    #[test]
    fn test_round_coordinate() {
        assert_eq!(round_coordinate(25.03300049), 25.033);
        assert_eq!(round_coordinate(121.5654444), 121.565444);
        assert_eq!(round_coordinate(-25.0330004), -25.033);
        // Already at precision: unchanged
        assert_eq!(round_coordinate(25.0330), 25.0330);
    }

    proptest! {
        #[test]
        fn prop_distance_is_symmetric(
            lat1 in -90.0f64..=90.0, lon1 in -180.0f64..=180.0,
            lat2 in -90.0f64..=90.0, lon2 in -180.0f64..=180.0,
        ) {
            let a = Coordinate::new(lat1, lon1);
            let b = Coordinate::new(lat2, lon2);
            let ab = distance_m(a, b);
            let ba = distance_m(b, a);
            prop_assert!((ab - ba).abs() < 1e-6);
            prop_assert!(ab >= 0.0);
            // Never more than half the circumference
            prop_assert!(ab <= EARTH_MEAN_RADIUS_M * std::f64::consts::PI + 1e-3);
        }

        #[test]
        fn prop_rounding_moves_less_than_a_decimeter(
            lat in -90.0f64..=90.0, lon in -180.0f64..=180.0,
        ) {
            let raw = Coordinate::new(lat, lon);
            prop_assert!(distance_m(raw, raw.rounded()) < 0.1);
            prop_assert!(validate_coordinate(raw.rounded().latitude, raw.rounded().longitude));
        }
    }
}
