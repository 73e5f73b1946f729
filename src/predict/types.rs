use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Transmission format; decides the decoder and the default demodulation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalType {
    Apt,
    Lrpt,
    Sstv,
}

impl SignalType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalType::Apt => "apt",
            SignalType::Lrpt => "lrpt",
            SignalType::Sstv => "sstv",
        }
    }

    pub fn default_demod(&self) -> DemodParams {
        match self {
            SignalType::Apt => DemodParams {
                bandwidth_hz: 40_000,
                sample_rate: 48_000,
            },
            SignalType::Lrpt => DemodParams {
                bandwidth_hz: 150_000,
                sample_rate: 1_024_000,
            },
            SignalType::Sstv => DemodParams {
                bandwidth_hz: 12_500,
                sample_rate: 48_000,
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DemodParams {
    pub bandwidth_hz: u32,
    pub sample_rate: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SatelliteProfile {
    pub name: String,
    pub norad_id: u32,
    pub frequency_hz: u64,
    pub signal: SignalType,
    #[serde(default)]
    pub demod: Option<DemodParams>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Irregular transmitters (ISS SSTV): monitored by scanning instead of
    /// scheduled pass captures.
    #[serde(default)]
    pub event_based: bool,
}

fn default_true() -> bool {
    true
}

impl SatelliteProfile {
    pub fn demod(&self) -> DemodParams {
        self.demod.unwrap_or_else(|| self.signal.default_demod())
    }
}

/// Satellite name plus the two TLE lines. Parsed only by the propagator.
#[derive(Debug, Clone, PartialEq)]
pub struct OrbitalElements {
    pub name: Option<String>,
    pub line1: String,
    pub line2: String,
}

/// A predicted visibility window above the minimum elevation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Pass {
    pub satellite: String,
    pub norad_id: u32,
    pub aos: DateTime<Utc>,
    pub los: DateTime<Utc>,
    pub max_elevation_deg: f64,
    pub max_elevation_time: DateTime<Utc>,
    pub aos_azimuth_deg: f64,
    pub los_azimuth_deg: f64,
    pub duration_seconds: i64,
}

impl Pass {
    pub fn overlaps(&self, norad_id: u32, aos: DateTime<Utc>, los: DateTime<Utc>) -> bool {
        self.norad_id == norad_id && self.aos < los && aos < self.los
    }
}
