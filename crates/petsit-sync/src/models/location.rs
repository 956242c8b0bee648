//! Sitter presence and distance helpers

use serde::{Deserialize, Serialize};

/// Mean Earth radius used by the server's nearby search
const EARTH_RADIUS_KM: f64 = 6371.0;

/// WGS84 position in decimal degrees
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    pub latitude: f64,
    pub longitude: f64,
}

impl Coordinates {
    pub const fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.latitude.is_finite()
            && self.longitude.is_finite()
            && (-90.0..=90.0).contains(&self.latitude)
            && (-180.0..=180.0).contains(&self.longitude)
    }

    /// Great-circle distance in kilometres
    pub fn distance_km(&self, other: &Self) -> f64 {
        haversine_km(*self, *other)
    }
}

/// Haversine great-circle distance in kilometres
pub fn haversine_km(a: Coordinates, b: Coordinates) -> f64 {
    let d_lat = (b.latitude - a.latitude).to_radians();
    let d_lon = (b.longitude - a.longitude).to_radians();
    let h = (d_lat / 2.0).sin().powi(2)
        + a.latitude.to_radians().cos() * b.latitude.to_radians().cos() * (d_lon / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_KM * h.sqrt().atan2((1.0 - h).sqrt())
}

/// Payload of a `sitter_locations` record; the record id is the sitter's user id
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SitterLocation {
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default)]
    pub address: Option<String>,
    pub online: bool,
    #[serde(default)]
    pub name: Option<String>,
}

impl SitterLocation {
    pub const fn coordinates(&self) -> Coordinates {
        Coordinates::new(self.latitude, self.longitude)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn distance_between_identical_points_is_zero() {
        let manila = Coordinates::new(14.5995, 120.9842);
        assert!(manila.distance_km(&manila).abs() < f64::EPSILON);
    }

    #[test]
    fn one_degree_of_latitude_is_about_111_km() {
        let distance = haversine_km(Coordinates::new(0.0, 0.0), Coordinates::new(1.0, 0.0));
        assert!((distance - 111.19).abs() < 0.01, "{distance}");
    }

    #[test]
    fn coordinates_validate_ranges() {
        assert!(Coordinates::new(14.6, 121.0).is_valid());
        assert!(!Coordinates::new(91.0, 0.0).is_valid());
        assert!(!Coordinates::new(0.0, f64::NAN).is_valid());
    }
}
