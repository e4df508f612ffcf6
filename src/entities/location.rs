use chrono::{DateTime, Utc};
use geo_types::Point;
use serde::{Deserialize, Serialize};

const EARTH_RADIUS_KM: f64 = 6371.0;

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    pub latitude: f64,
    pub longitude: f64,
}

impl Coordinates {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }

    /// Great-circle distance in kilometres.
    pub fn distance_km(&self, other: &Coordinates) -> f64 {
        haversine_km((*self).into(), (*other).into())
    }
}

impl From<Coordinates> for Point<f64> {
    fn from(coordinates: Coordinates) -> Self {
        Point::new(coordinates.longitude, coordinates.latitude)
    }
}

impl From<Point<f64>> for Coordinates {
    fn from(point: Point<f64>) -> Self {
        Self {
            latitude: point.y(),
            longitude: point.x(),
        }
    }
}

pub fn haversine_km(from: Point<f64>, to: Point<f64>) -> f64 {
    let d_lat = (to.y() - from.y()).to_radians();
    let d_lng = (to.x() - from.x()).to_radians();

    let a = (d_lat / 2.0).sin().powi(2)
        + from.y().to_radians().cos() * to.y().to_radians().cos() * (d_lng / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());

    EARTH_RADIUS_KM * c
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct DriverLocation {
    pub coordinates: Coordinates,
    pub recorded_at: DateTime<Utc>,
}

impl DriverLocation {
    pub fn new(coordinates: Coordinates) -> Self {
        Self {
            coordinates,
            recorded_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_point_is_zero_km() {
        let pune = Coordinates::new(18.5204, 73.8567);
        assert!(pune.distance_km(&pune).abs() < 1e-9);
    }

    #[test]
    fn one_degree_of_latitude_is_about_111_km() {
        let a = Coordinates::new(0.0, 0.0);
        let b = Coordinates::new(1.0, 0.0);

        let distance = a.distance_km(&b);
        assert!((distance - 111.19).abs() < 0.1, "got {}", distance);
    }

    #[test]
    fn point_conversion_keeps_axes() {
        let coordinates = Coordinates::new(18.5, 73.8);
        let point: Point<f64> = coordinates.into();

        assert_eq!(point.x(), 73.8);
        assert_eq!(point.y(), 18.5);
        assert_eq!(Coordinates::from(point), coordinates);
    }
}
