use std::path::PathBuf;

use chrono::{DateTime, Utc};

use crate::predict::error::PredictError;
use crate::predict::ground_station::StationLocation;
use crate::predict::pass_finder::{filter_high_quality_passes, PassPredictor, PredictOptions};
use crate::predict::tle_loader::TleLoader;
use crate::predict::types::{Pass, SatelliteProfile};

/// Everything needed to run a prediction from scratch: reloads the TLE folder
/// on every call so refreshed elements are picked up.
#[derive(Debug, Clone)]
pub struct PassSource {
    pub station: StationLocation,
    pub options: PredictOptions,
    pub tle_folder: PathBuf,
    pub satellites: Vec<SatelliteProfile>,
    pub high_quality_min_elevation: Option<f64>,
}

impl PassSource {
    pub fn predict(&self, now: DateTime<Utc>) -> Result<Vec<Pass>, PredictError> {
        let mut loader = TleLoader::new(self.tle_folder.clone());
        loader.load_all()?;
        let matched = loader.match_profiles(&self.satellites);
        let passes = PassPredictor::new(self.station, self.options).predict(matched, now);
        Ok(match self.high_quality_min_elevation {
            Some(min) => filter_high_quality_passes(&passes, min),
            None => passes,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::predict::SignalType;
    use chrono::TimeZone;

    const ISS: &str = "ISS (ZARYA)
1 25544U 98067A   20194.88612269 -.00002218  00000-0 -31515-4 0  9992
2 25544  51.6461 221.2784 0001413  89.1723 280.4612 15.49507896236008
";

    #[test]
    fn predicts_from_folder() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("stations.tle"), ISS).unwrap();
        let iss = SatelliteProfile {
            name: "ISS".into(),
            norad_id: 25544,
            frequency_hz: 145_800_000,
            signal: SignalType::Sstv,
            demod: None,
            enabled: true,
            event_based: true,
        };
        let mut source = PassSource {
            station: StationLocation::new(52.0, 4.4, 0.0).unwrap(),
            options: PredictOptions::default(),
            tle_folder: dir.path().to_path_buf(),
            satellites: vec![iss],
            high_quality_min_elevation: None,
        };
        let now = Utc.with_ymd_and_hms(2020, 7, 13, 0, 0, 0).unwrap();
        let all = source.predict(now).unwrap();
        assert!(!all.is_empty());

        source.high_quality_min_elevation = Some(90.1);
        assert!(source.predict(now).unwrap().is_empty());

        source.tle_folder = dir.path().join("missing");
        assert!(matches!(
            source.predict(now),
            Err(PredictError::DirectoryNotFound(_))
        ));
    }
}
