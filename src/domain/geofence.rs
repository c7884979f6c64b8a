//! Circular geofence containment using the haversine great-circle distance

use crate::domain::types::GeoPoint;
use std::f64::consts::PI;

/// Mean Earth radius in meters
pub const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Degrees to radians as `degrees * π / 180`.
///
/// Must not be swapped for `f64::to_radians`: fence decisions have to be
/// bit-identical to other producers of the same formula.
#[inline]
fn to_radians(degrees: f64) -> f64 {
    degrees * PI / 180.0
}

/// Great-circle distance between two points in meters
pub fn haversine_distance_m(from: GeoPoint, to: GeoPoint) -> f64 {
    let d_lat = to_radians(to.latitude - from.latitude);
    let d_lon = to_radians(to.longitude - from.longitude);

    let a = (d_lat / 2.0).sin() * (d_lat / 2.0).sin()
        + to_radians(from.latitude).cos()
            * to_radians(to.latitude).cos()
            * (d_lon / 2.0).sin()
            * (d_lon / 2.0).sin();

    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());

    EARTH_RADIUS_M * c
}

/// True iff `point` lies within `radius_m` meters of `center` (boundary inclusive)
pub fn contains(center: GeoPoint, radius_m: f64, point: GeoPoint) -> bool {
    haversine_distance_m(center, point) <= radius_m
}

/// Process-wide circular fence, fixed at startup
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Geofence {
    center: GeoPoint,
    radius_m: f64,
}

impl Geofence {
    pub fn new(center: GeoPoint, radius_m: f64) -> Self {
        Self { center, radius_m }
    }

    pub fn center(&self) -> GeoPoint {
        self.center
    }

    pub fn radius_m(&self) -> f64 {
        self.radius_m
    }

    pub fn contains(&self, point: GeoPoint) -> bool {
        contains(self.center, self.radius_m, point)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn monas() -> GeoPoint {
        GeoPoint::new(-6.1751, 106.8270)
    }

    #[test]
    fn test_distance_zero_for_same_point() {
        assert_eq!(haversine_distance_m(monas(), monas()), 0.0);
    }

    #[test]
    fn test_distance_one_degree_latitude() {
        // One degree of arc on a 6371 km sphere is ~111.195 km
        let d = haversine_distance_m(GeoPoint::new(0.0, 0.0), GeoPoint::new(1.0, 0.0));
        assert!((d - 111_194.93).abs() < 1.0, "got {d}");
    }

    #[test]
    fn test_distance_is_symmetric() {
        let a = GeoPoint::new(-6.50, 106.80);
        let d1 = haversine_distance_m(monas(), a);
        let d2 = haversine_distance_m(a, monas());
        assert!((d1 - d2).abs() < 1e-6);
    }

    #[test]
    fn test_far_point_outside_default_fence() {
        let fence = Geofence::new(monas(), 50.0);
        assert!(!fence.contains(GeoPoint::new(-6.50, 106.80)));
    }

    #[test]
    fn test_nearby_point_inside_default_fence() {
        // ~0.0003 degrees of latitude is ~33 m
        let fence = Geofence::new(monas(), 50.0);
        assert!(fence.contains(GeoPoint::new(-6.1754, 106.8270)));
        assert!(!fence.contains(GeoPoint::new(-6.1760, 106.8270)));
    }

    #[test]
    fn test_zero_radius_contains_only_center() {
        assert!(contains(monas(), 0.0, monas()));
        assert!(!contains(monas(), 0.0, GeoPoint::new(-6.1752, 106.8270)));
    }

    proptest! {
        #[test]
        fn prop_center_always_inside(
            lat in -90.0f64..=90.0,
            lon in -180.0f64..=180.0,
            radius in 0.0f64..100_000.0,
        ) {
            let center = GeoPoint::new(lat, lon);
            prop_assert!(contains(center, radius, center));
        }

        #[test]
        fn prop_contains_matches_distance(
            lat in -89.0f64..89.0,
            lon in -179.0f64..179.0,
            dlat in -0.01f64..0.01,
            dlon in -0.01f64..0.01,
            radius in 0.0f64..2_000.0,
        ) {
            let center = GeoPoint::new(lat, lon);
            let point = GeoPoint::new(lat + dlat, lon + dlon);
            let d = haversine_distance_m(center, point);
            prop_assert_eq!(contains(center, radius, point), d <= radius);
        }
    }
}
