use chrono::{DateTime, Duration, Utc};

use crate::predict::error::PredictError;
use crate::predict::ground_station::StationLocation;
use crate::predict::propagation::{Propagator, Sgp4Propagator};
use crate::predict::types::{OrbitalElements, Pass, SatelliteProfile};

pub const DEFAULT_STEP_SECONDS: i64 = 30;
// How far past the horizon an open pass is followed to find its real LOS.
const MAX_OVERRUN_SECONDS: i64 = 3600;
const GOLDEN_TOLERANCE_SECONDS: f64 = 0.5;

#[derive(Debug, Clone, Copy)]
pub struct PredictOptions {
    pub hours_ahead: f64,
    pub min_elevation: f64,
    pub step_seconds: i64,
}

impl Default for PredictOptions {
    fn default() -> Self {
        Self {
            hours_ahead: 24.0,
            min_elevation: 10.0,
            step_seconds: DEFAULT_STEP_SECONDS,
        }
    }
}

/// Stateless pass prediction for one station.
pub struct PassPredictor {
    station: StationLocation,
    options: PredictOptions,
}

impl PassPredictor {
    pub fn new(station: StationLocation, options: PredictOptions) -> Self {
        Self { station, options }
    }

    /// Predict passes for every enabled satellite. A satellite whose elements
    /// do not parse or propagate is skipped with a warning.
    pub fn predict<'a, I>(&self, satellites: I, now: DateTime<Utc>) -> Vec<Pass>
    where
        I: IntoIterator<Item = (&'a SatelliteProfile, &'a OrbitalElements)>,
    {
        let mut passes = Vec::new();
        for (profile, elements) in satellites {
            if !profile.enabled {
                continue;
            }
            let result = Sgp4Propagator::new(elements)
                .and_then(|propagator| self.predict_with(profile, &propagator, now));
            match result {
                Ok(found) => {
                    log::debug!("{}: {} passes", profile.name, found.len());
                    passes.extend(found);
                }
                Err(e) => log::warn!("Skipping {}: {}", profile.name, e),
            }
        }
        sort_passes(&mut passes);
        passes
    }

    pub fn predict_with<P: Propagator>(
        &self,
        profile: &SatelliteProfile,
        propagator: &P,
        now: DateTime<Utc>,
    ) -> Result<Vec<Pass>, PredictError> {
        let horizon_seconds = (self.options.hours_ahead * 3600.0).round() as i64;
        predict_passes(
            propagator,
            &self.station,
            &profile.name,
            profile.norad_id,
            now,
            now + Duration::seconds(horizon_seconds),
            self.options.min_elevation,
            self.options.step_seconds,
        )
    }
}

/// Ascending AOS, ties by satellite name.
pub fn sort_passes(passes: &mut [Pass]) {
    passes.sort_by(|a, b| a.aos.cmp(&b.aos).then_with(|| a.satellite.cmp(&b.satellite)));
}

pub fn filter_high_quality_passes(passes: &[Pass], min_elevation: f64) -> Vec<Pass> {
    passes
        .iter()
        .filter(|p| p.max_elevation_deg >= min_elevation)
        .cloned()
        .collect()
}

/// Find all passes of one satellite whose AOS falls in `[start, end]`.
#[allow(clippy::too_many_arguments)]
pub fn predict_passes<P: Propagator>(
    propagator: &P,
    station: &StationLocation,
    satellite_name: &str,
    norad_id: u32,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    min_elevation: f64,
    step_seconds: i64,
) -> Result<Vec<Pass>, PredictError> {
    let step = step_seconds.max(1);
    let finder = Finder {
        propagator,
        station,
        min_elevation,
    };
    let start_s = start.timestamp();
    let end_s = end.timestamp();

    let mut passes = Vec::new();
    let mut t = start_s;
    let mut above = finder.elevation(t)? >= min_elevation;
    let mut aos = if above {
        Some(finder.aos_before(t, step)?)
    } else {
        None
    };
    let mut coarse_max: Option<(i64, f64)> = None;

    while t < end_s || aos.is_some() {
        if t > end_s + MAX_OVERRUN_SECONDS {
            log::debug!("{satellite_name}: dropping pass still open past the horizon");
            break;
        }
        let next = t + step;
        let el = finder.elevation(next)?;
        let next_above = el >= min_elevation;

        if next_above && !above {
            let rise = finder.refine(t, next, true)?;
            if rise > end_s {
                break;
            }
            aos = Some(rise);
            coarse_max = None;
        } else if !next_above && above {
            if let Some(rise) = aos.take() {
                let set = finder.refine(t, next, false)?;
                passes.push(finder.build_pass(satellite_name, norad_id, rise, set, coarse_max, step)?);
            }
            coarse_max = None;
        }
        if next_above && coarse_max.map_or(true, |(_, m)| el > m) {
            coarse_max = Some((next, el));
        }

        above = next_above;
        t = next;
    }

    Ok(passes)
}

struct Finder<'a, P> {
    propagator: &'a P,
    station: &'a StationLocation,
    min_elevation: f64,
}

impl<P: Propagator> Finder<'_, P> {
    fn at(&self, seconds: f64) -> DateTime<Utc> {
        let whole = seconds.floor();
        let nanos = ((seconds - whole) * 1e9) as u32;
        DateTime::from_timestamp(whole as i64, nanos).unwrap_or_default()
    }

    fn elevation(&self, t: i64) -> Result<f64, PredictError> {
        self.elevation_f(t as f64)
    }

    fn elevation_f(&self, t: f64) -> Result<f64, PredictError> {
        Ok(self.propagator.propagate(self.station, self.at(t))?.elevation_deg)
    }

    fn above(&self, t: i64) -> Result<bool, PredictError> {
        Ok(self.elevation(t)? >= self.min_elevation)
    }

    /// Walk backwards from a time already inside a pass to its AOS.
    fn aos_before(&self, t: i64, step: i64) -> Result<i64, PredictError> {
        let mut hi = t;
        while t - hi < MAX_OVERRUN_SECONDS {
            let lo = hi - step;
            if !self.above(lo)? {
                return self.refine(lo, hi, true);
            }
            hi = lo;
        }
        Ok(hi)
    }

    /// Integer-second bisection. `lo` is on the old side of the crossing, `hi`
    /// on the new side; returns the first second on the new side.
    fn refine(&self, mut lo: i64, mut hi: i64, rising: bool) -> Result<i64, PredictError> {
        while hi - lo > 1 {
            let mid = lo + (hi - lo) / 2;
            if self.above(mid)? == rising {
                hi = mid;
            } else {
                lo = mid;
            }
        }
        Ok(hi)
    }

    /// Golden-section search for the elevation maximum inside `[lo, hi]`.
    fn culmination(&self, mut lo: f64, mut hi: f64) -> Result<(f64, f64), PredictError> {
        let inv_phi = (5f64.sqrt() - 1.0) / 2.0;
        let mut x1 = hi - inv_phi * (hi - lo);
        let mut x2 = lo + inv_phi * (hi - lo);
        let mut f1 = self.elevation_f(x1)?;
        let mut f2 = self.elevation_f(x2)?;
        while hi - lo > GOLDEN_TOLERANCE_SECONDS {
            if f1 < f2 {
                lo = x1;
                x1 = x2;
                f1 = f2;
                x2 = lo + inv_phi * (hi - lo);
                f2 = self.elevation_f(x2)?;
            } else {
                hi = x2;
                x2 = x1;
                f2 = f1;
                x1 = hi - inv_phi * (hi - lo);
                f1 = self.elevation_f(x1)?;
            }
        }
        let t = ((lo + hi) / 2.0).round();
        Ok((t, self.elevation_f(t)?))
    }

    fn build_pass(
        &self,
        satellite_name: &str,
        norad_id: u32,
        aos: i64,
        los: i64,
        coarse_max: Option<(i64, f64)>,
        step: i64,
    ) -> Result<Pass, PredictError> {
        let (lo, hi) = match coarse_max {
            Some((t, _)) => ((t - step).max(aos), (t + step).min(los)),
            None => (aos, los),
        };
        let (mut max_t, mut max_el) = self.culmination(lo as f64, hi as f64)?;
        if let Some((t, el)) = coarse_max {
            if el > max_el {
                max_t = t as f64;
                max_el = el;
            }
        }

        let aos_time = self.at(aos as f64);
        let los_time = self.at(los as f64);
        let aos_look = self.propagator.propagate(self.station, aos_time)?;
        let los_look = self.propagator.propagate(self.station, los_time)?;

        Ok(Pass {
            satellite: satellite_name.to_string(),
            norad_id,
            aos: aos_time,
            los: los_time,
            max_elevation_deg: round2(max_el.clamp(0.0, 90.0)),
            max_elevation_time: self.at(max_t),
            aos_azimuth_deg: round2(aos_look.azimuth_deg),
            los_azimuth_deg: round2(los_look.azimuth_deg),
            duration_seconds: los - aos,
        })
    }
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::predict::propagation::LookAngles;
    use crate::predict::types::SignalType;
    use chrono::TimeZone;

    /// Elevation follows a raised sinusoid: peaks of `peak` degrees every
    /// `period` seconds, phase-shifted by `offset`.
    struct Sinusoid {
        period: f64,
        offset: f64,
        peak: f64,
        epoch: i64,
    }

    impl Propagator for Sinusoid {
        fn propagate(
            &self,
            _station: &StationLocation,
            time: DateTime<Utc>,
        ) -> Result<LookAngles, PredictError> {
            let t = (time.timestamp() - self.epoch) as f64
                + time.timestamp_subsec_nanos() as f64 / 1e9
                + self.offset;
            let phase = 2.0 * std::f64::consts::PI * t / self.period;
            Ok(LookAngles {
                azimuth_deg: 180.0,
                elevation_deg: self.peak * phase.sin() - 20.0,
                range_km: 1000.0,
            })
        }
    }

    struct Failing;

    impl Propagator for Failing {
        fn propagate(&self, _: &StationLocation, _: DateTime<Utc>) -> Result<LookAngles, PredictError> {
            Err(PredictError::Propagation("decayed".into()))
        }
    }

    fn epoch() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 1, 0, 0, 0).unwrap()
    }

    fn profile(name: &str, norad_id: u32) -> SatelliteProfile {
        SatelliteProfile {
            name: name.into(),
            norad_id,
            frequency_hz: 137_100_000,
            signal: SignalType::Apt,
            demod: None,
            enabled: true,
            event_based: false,
        }
    }

    fn predictor(min_elevation: f64, hours: f64) -> PassPredictor {
        PassPredictor::new(
            StationLocation::default(),
            PredictOptions {
                hours_ahead: hours,
                min_elevation,
                step_seconds: 30,
            },
        )
    }

    #[test]
    fn finds_sinusoid_passes() {
        let prop = Sinusoid {
            period: 6000.0,
            offset: 0.0,
            peak: 60.0,
            epoch: epoch().timestamp(),
        };
        let passes = predictor(10.0, 5.0)
            .predict_with(&profile("SIN", 1), &prop, epoch())
            .unwrap();
        // 5 hours / 100 minute period = 3 full cycles.
        assert_eq!(passes.len(), 3);
        for p in &passes {
            assert!(p.los > p.aos);
            assert_eq!(p.duration_seconds, (p.los - p.aos).num_seconds());
            // 60 sin(x) - 20 peaks at 40 degrees a quarter period in.
            assert!((p.max_elevation_deg - 40.0).abs() < 0.05, "{p:?}");
            let quarter = (p.max_elevation_time - epoch()).num_seconds().rem_euclid(6000);
            assert!((quarter - 1500).abs() <= 1, "culmination at {quarter}");
            // sin(x) = 0.5 -> 500 s and 2500 s into the cycle
            let rise = (p.aos - epoch()).num_seconds().rem_euclid(6000);
            let set = (p.los - epoch()).num_seconds().rem_euclid(6000);
            assert!((rise - 500).abs() <= 1, "aos at {rise}");
            assert!((set - 2500).abs() <= 1, "los at {set}");
        }
    }

    #[test]
    fn pass_open_at_start_reports_past_aos() {
        let prop = Sinusoid {
            period: 6000.0,
            offset: 0.0,
            peak: 60.0,
            epoch: epoch().timestamp(),
        };
        let start = epoch() + Duration::seconds(1000);
        let passes = predictor(10.0, 1.0)
            .predict_with(&profile("SIN", 1), &prop, start)
            .unwrap();
        assert_eq!(passes.len(), 1);
        assert!(passes[0].aos < start);
        assert!(passes[0].los > start);
    }

    #[test]
    fn open_pass_at_horizon_end_has_real_los() {
        let prop = Sinusoid {
            period: 6000.0,
            offset: 0.0,
            peak: 60.0,
            epoch: epoch().timestamp(),
        };
        // Horizon ends 1200 s in, mid-pass.
        let passes = predictor(10.0, 1200.0 / 3600.0)
            .predict_with(&profile("SIN", 1), &prop, epoch())
            .unwrap();
        assert_eq!(passes.len(), 1);
        let set = (passes[0].los - epoch()).num_seconds();
        assert!((set - 2500).abs() <= 1);
    }

    #[test]
    fn low_passes_are_not_reported() {
        let prop = Sinusoid {
            period: 6000.0,
            offset: 0.0,
            peak: 25.0,
            epoch: epoch().timestamp(),
        };
        let passes = predictor(10.0, 5.0)
            .predict_with(&profile("LOW", 2), &prop, epoch())
            .unwrap();
        assert!(passes.is_empty());
    }

    #[test]
    fn propagation_failure_is_an_error_for_that_satellite() {
        let result = predictor(10.0, 1.0).predict_with(&profile("DEAD", 3), &Failing, epoch());
        assert!(matches!(result, Err(PredictError::Propagation(_))));
    }

    #[test]
    fn sort_breaks_ties_by_name() {
        let mk = |name: &str, aos_offset: i64| Pass {
            satellite: name.into(),
            norad_id: 0,
            aos: epoch() + Duration::seconds(aos_offset),
            los: epoch() + Duration::seconds(aos_offset + 600),
            max_elevation_deg: 30.0,
            max_elevation_time: epoch() + Duration::seconds(aos_offset + 300),
            aos_azimuth_deg: 0.0,
            los_azimuth_deg: 0.0,
            duration_seconds: 600,
        };
        let mut passes = vec![mk("NOAA 19", 100), mk("METEOR-M2 3", 100), mk("NOAA 15", 50)];
        sort_passes(&mut passes);
        let names: Vec<_> = passes.iter().map(|p| p.satellite.as_str()).collect();
        assert_eq!(names, ["NOAA 15", "METEOR-M2 3", "NOAA 19"]);
    }

    #[test]
    fn high_quality_filter_keeps_order() {
        let mk = |name: &str, el: f64| Pass {
            satellite: name.into(),
            norad_id: 0,
            aos: epoch(),
            los: epoch() + Duration::seconds(600),
            max_elevation_deg: el,
            max_elevation_time: epoch() + Duration::seconds(300),
            aos_azimuth_deg: 0.0,
            los_azimuth_deg: 0.0,
            duration_seconds: 600,
        };
        let passes = vec![mk("a", 12.0), mk("b", 35.0), mk("c", 30.0), mk("d", 29.99)];
        let kept = filter_high_quality_passes(&passes, 30.0);
        let names: Vec<_> = kept.iter().map(|p| p.satellite.as_str()).collect();
        assert_eq!(names, ["b", "c"]);
    }

    const ISS_LINE1: &str = "1 25544U 98067A   20194.88612269 -.00002218  00000-0 -31515-4 0  9992";
    const ISS_LINE2: &str = "2 25544  51.6461 221.2784 0001413  89.1723 280.4612 15.49507896236008";

    #[test]
    fn sgp4_passes_are_sorted_and_consistent() {
        let station = StationLocation::new(52.0, 5.0, 0.0).unwrap();
        let predictor = PassPredictor::new(
            station,
            PredictOptions {
                hours_ahead: 24.0,
                min_elevation: 0.0,
                step_seconds: 30,
            },
        );
        let iss = SatelliteProfile {
            name: "ISS (ZARYA)".into(),
            norad_id: 25544,
            frequency_hz: 145_800_000,
            signal: SignalType::Sstv,
            demod: None,
            enabled: true,
            event_based: true,
        };
        let tle = OrbitalElements {
            name: Some("ISS (ZARYA)".into()),
            line1: ISS_LINE1.into(),
            line2: ISS_LINE2.into(),
        };
        let broken = profile("BROKEN", 99999);
        let broken_tle = OrbitalElements {
            name: Some("BROKEN".into()),
            line1: "1 garbage".into(),
            line2: "2 garbage".into(),
        };
        let start = Utc.with_ymd_and_hms(2020, 7, 13, 0, 0, 0).unwrap();
        let passes = predictor.predict([(&broken, &broken_tle), (&iss, &tle)], start);

        assert!(!passes.is_empty());
        assert!(passes.windows(2).all(|w| w[0].aos <= w[1].aos));
        for p in &passes {
            assert_eq!(p.satellite, "ISS (ZARYA)");
            assert!(p.los > p.aos);
            assert_eq!(p.duration_seconds, (p.los - p.aos).num_seconds());
            assert!((0.0..=90.0).contains(&p.max_elevation_deg));
            assert!(p.max_elevation_time >= p.aos && p.max_elevation_time <= p.los);
            // LEO passes last minutes, not hours.
            assert!(p.duration_seconds < 20 * 60, "{p:?}");
        }
    }
}
