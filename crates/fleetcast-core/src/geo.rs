//! Geographic coordinates and position interpolation.

use serde::{Deserialize, Serialize};

/// Mean Earth radius in kilometres.
const EARTH_RADIUS_KM: f64 = 6371.0;

/// A WGS-84 latitude/longitude pair.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinate {
    pub lat: f64,
    pub lng: f64,
}

impl Coordinate {
    #[must_use]
    pub const fn new(lat: f64, lng: f64) -> Self {
        Self { lat, lng }
    }

    /// Haversine great-circle distance in kilometres.
    #[must_use]
    pub fn distance_km(self, other: Coordinate) -> f64 {
        let d_lat = (other.lat - self.lat).to_radians();
        let d_lng = (other.lng - self.lng).to_radians();

        let a = (d_lat / 2.0).sin().powi(2)
            + self.lat.to_radians().cos() * other.lat.to_radians().cos() * (d_lng / 2.0).sin().powi(2);

        2.0 * EARTH_RADIUS_KM * a.sqrt().atan2((1.0 - a).sqrt())
    }
}

impl From<[f64; 2]> for Coordinate {
    fn from([lat, lng]: [f64; 2]) -> Self {
        Self { lat, lng }
    }
}

impl std::fmt::Display for Coordinate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({:.6}, {:.6})", self.lat, self.lng)
    }
}

/// Linearly interpolate between `a` and `b`.
///
/// Latitude and longitude are interpolated independently with no spherical
/// correction; route segments are short enough for this to be invisible.
#[inline]
#[must_use]
pub fn interpolate(a: Coordinate, b: Coordinate, t: f64) -> Coordinate {
    Coordinate {
        lat: a.lat + (b.lat - a.lat) * t,
        lng: a.lng + (b.lng - a.lng) * t,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EPS: f64 = 1e-12;

    fn close(a: Coordinate, b: Coordinate) -> bool {
        (a.lat - b.lat).abs() < EPS && (a.lng - b.lng).abs() < EPS
    }

    #[test]
    fn test_interpolate_endpoints() {
        let a = Coordinate::new(14.4426, 79.9865);
        let b = Coordinate::new(13.0827, 80.2707);

        assert!(close(interpolate(a, b, 0.0), a));
        assert!(close(interpolate(a, b, 1.0), b));
    }

    #[test]
    fn test_interpolate_midpoint() {
        let a = Coordinate::new(0.0, 0.0);
        let b = Coordinate::new(2.0, -4.0);

        assert_eq!(interpolate(a, b, 0.5), Coordinate::new(1.0, -2.0));
        assert_eq!(interpolate(a, b, 0.25), Coordinate::new(0.5, -1.0));
    }

    #[test]
    fn test_distance_km() {
        let chennai = Coordinate::new(13.0827, 80.2707);
        let tirupati = Coordinate::new(13.6288, 79.4192);

        let d = chennai.distance_km(tirupati);
        assert!((d - 110.0).abs() < 5.0, "got {d}");
        assert_eq!(chennai.distance_km(chennai), 0.0);
    }
}
