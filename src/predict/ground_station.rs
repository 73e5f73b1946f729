use crate::predict::error::PredictError;

/// Fixed receiving site. Latitude/longitude in degrees, altitude in meters.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct StationLocation {
    pub latitude_deg: f64,
    pub longitude_deg: f64,
    pub altitude_m: f64,
}

impl StationLocation {
    pub fn new(latitude_deg: f64, longitude_deg: f64, altitude_m: f64) -> Result<Self, PredictError> {
        if !(-90.0..=90.0).contains(&latitude_deg) {
            return Err(PredictError::InvalidStation(format!(
                "latitude {latitude_deg} outside [-90, 90]"
            )));
        }
        if !(-180.0..=180.0).contains(&longitude_deg) {
            return Err(PredictError::InvalidStation(format!(
                "longitude {longitude_deg} outside [-180, 180]"
            )));
        }
        Ok(Self {
            latitude_deg,
            longitude_deg,
            altitude_m,
        })
    }

    /// Parses `"lat, lon"` as written in the station config.
    pub fn from_coordinates(coordinates: &str, altitude_m: f64) -> Result<Self, PredictError> {
        let parts: Vec<_> = coordinates.split(',').map(|s| s.trim()).collect();
        if parts.len() != 2 {
            return Err(PredictError::InvalidStation(format!(
                "expected \"lat, lon\", got {coordinates:?}"
            )));
        }
        let parse = |s: &str| {
            s.parse::<f64>()
                .map_err(|e| PredictError::InvalidStation(format!("{s:?}: {e}")))
        };
        Self::new(parse(parts[0])?, parse(parts[1])?, altitude_m)
    }

    pub fn lat_rad(&self) -> f64 {
        self.latitude_deg.to_radians()
    }

    pub fn lon_rad(&self) -> f64 {
        self.longitude_deg.to_radians()
    }

    pub fn position_ecef_km(&self) -> [f64; 3] {
        // WGS-84
        let a = 6378.137;
        let e2 = 0.00669437999014;
        let (sin_lat, cos_lat) = self.lat_rad().sin_cos();
        let (sin_lon, cos_lon) = self.lon_rad().sin_cos();
        let n = a / (1.0 - e2 * sin_lat * sin_lat).sqrt();
        let alt_km = self.altitude_m / 1000.0;
        [
            (n + alt_km) * cos_lat * cos_lon,
            (n + alt_km) * cos_lat * sin_lon,
            (n * (1.0 - e2) + alt_km) * sin_lat,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_coordinate_string() {
        let station = StationLocation::from_coordinates("52.37, 4.89", 12.0).unwrap();
        assert_eq!(station.latitude_deg, 52.37);
        assert_eq!(station.longitude_deg, 4.89);
        assert_eq!(station.altitude_m, 12.0);
    }

    #[test]
    fn rejects_out_of_range() {
        assert!(StationLocation::new(91.0, 0.0, 0.0).is_err());
        assert!(StationLocation::new(0.0, -180.5, 0.0).is_err());
        assert!(StationLocation::from_coordinates("52.0", 0.0).is_err());
        assert!(StationLocation::from_coordinates("north, 4.0", 0.0).is_err());
    }

    #[test]
    fn ecef_radius_is_earthlike() {
        let station = StationLocation::new(45.0, 10.0, 0.0).unwrap();
        let p = station.position_ecef_km();
        let r = (p[0] * p[0] + p[1] * p[1] + p[2] * p[2]).sqrt();
        assert!((6356.0..6379.0).contains(&r), "radius {r}");
    }
}
