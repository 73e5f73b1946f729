use chrono::{DateTime, Utc};
use sgp4::{Constants, Elements};

use crate::predict::error::PredictError;
use crate::predict::ground_station::StationLocation;
use crate::predict::types::OrbitalElements;

/// Topocentric position of a satellite as seen from the station.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LookAngles {
    pub azimuth_deg: f64,
    pub elevation_deg: f64,
    pub range_km: f64,
}

/// Pure propagation boundary used by the pass finder.
pub trait Propagator {
    fn propagate(
        &self,
        station: &StationLocation,
        time: DateTime<Utc>,
    ) -> Result<LookAngles, PredictError>;
}

pub struct Sgp4Propagator {
    elements: Elements,
    constants: Constants,
}

impl Sgp4Propagator {
    pub fn new(tle: &OrbitalElements) -> Result<Self, PredictError> {
        let name = tle.name.clone().unwrap_or_else(|| "unnamed".to_string());
        let invalid = |message: String| PredictError::InvalidElements {
            name: name.clone(),
            message,
        };
        let elements = Elements::from_tle(
            tle.name.clone(),
            tle.line1.as_bytes(),
            tle.line2.as_bytes(),
        )
        .map_err(|e| invalid(e.to_string()))?;
        let constants = Constants::from_elements(&elements).map_err(|e| invalid(e.to_string()))?;
        Ok(Self {
            elements,
            constants,
        })
    }
}

impl Propagator for Sgp4Propagator {
    fn propagate(
        &self,
        station: &StationLocation,
        time: DateTime<Utc>,
    ) -> Result<LookAngles, PredictError> {
        let naive = time.naive_utc();
        let minutes = self
            .elements
            .datetime_to_minutes_since_epoch(&naive)
            .map_err(|e| PredictError::Propagation(e.to_string()))?;
        let prediction = self
            .constants
            .propagate(minutes)
            .map_err(|e| PredictError::Propagation(e.to_string()))?;
        let sidereal = sgp4::iau_epoch_to_sidereal_time(sgp4::julian_years_since_j2000(&naive));

        let sat_ecef = teme_to_ecef_position(prediction.position, sidereal);
        let sta_ecef = station.position_ecef_km();
        let dr = [
            sat_ecef[0] - sta_ecef[0],
            sat_ecef[1] - sta_ecef[1],
            sat_ecef[2] - sta_ecef[2],
        ];
        let range_km = (dr[0] * dr[0] + dr[1] * dr[1] + dr[2] * dr[2]).sqrt();

        let (east, north, up) = ecef_to_enu(dr, station.lat_rad(), station.lon_rad());
        let azimuth_deg = east.atan2(north).to_degrees().rem_euclid(360.0);
        let elevation_deg = if range_km > 0.0 {
            (up / range_km).clamp(-1.0, 1.0).asin().to_degrees()
        } else {
            90.0
        };

        Ok(LookAngles {
            azimuth_deg,
            elevation_deg,
            range_km,
        })
    }
}

fn teme_to_ecef_position(pos_teme: [f64; 3], gmst: f64) -> [f64; 3] {
    let (sin_gmst, cos_gmst) = gmst.sin_cos();
    [
        pos_teme[0] * cos_gmst + pos_teme[1] * sin_gmst,
        -pos_teme[0] * sin_gmst + pos_teme[1] * cos_gmst,
        pos_teme[2],
    ]
}

fn ecef_to_enu(dr: [f64; 3], lat_rad: f64, lon_rad: f64) -> (f64, f64, f64) {
    let (sin_lat, cos_lat) = lat_rad.sin_cos();
    let (sin_lon, cos_lon) = lon_rad.sin_cos();

    let east = -sin_lon * dr[0] + cos_lon * dr[1];
    let north = -sin_lat * cos_lon * dr[0] - sin_lat * sin_lon * dr[1] + cos_lat * dr[2];
    let up = cos_lat * cos_lon * dr[0] + cos_lat * sin_lon * dr[1] + sin_lat * dr[2];
    (east, north, up)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enu_of_local_zenith_is_up() {
        let station = StationLocation::new(30.0, -60.0, 0.0).unwrap();
        let p = station.position_ecef_km();
        let norm = (p[0] * p[0] + p[1] * p[1] + p[2] * p[2]).sqrt();
        // Geodetic vs geocentric latitude differ slightly; "up" still dominates.
        let (e, n, u) = ecef_to_enu(
            [p[0] / norm * 500.0, p[1] / norm * 500.0, p[2] / norm * 500.0],
            station.lat_rad(),
            station.lon_rad(),
        );
        assert!(u > 499.0);
        assert!(e.abs() < 1.0);
        assert!(n.abs() < 10.0);
    }

    #[test]
    fn rejects_garbage_elements() {
        let tle = OrbitalElements {
            name: Some("BROKEN".into()),
            line1: "1 not a tle".into(),
            line2: "2 still not a tle".into(),
        };
        match Sgp4Propagator::new(&tle) {
            Err(PredictError::InvalidElements { name, .. }) => assert_eq!(name, "BROKEN"),
            Err(other) => panic!("unexpected error {other}"),
            Ok(_) => panic!("garbage elements accepted"),
        }
    }
}
