use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::gain::GainConfig;
use crate::predict::{PredictOptions, SatelliteProfile, SignalType, StationLocation};
use crate::receiver::SpectrumConfig;
use crate::relay::LinkSettings;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub station: StationConfig,
    #[serde(default)]
    pub topology: Topology,
    #[serde(default)]
    pub sdr: SdrConfig,
    #[serde(default)]
    pub gain_control: GainControlConfig,
    #[serde(default)]
    pub predict: PredictConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub relay: RelayConfig,
    #[serde(default)]
    pub decoder: DecoderConfig,
    #[serde(default)]
    pub satellites: Vec<SatelliteProfile>,
    #[serde(default)]
    pub web: WebConfig,
}

/// Where the radio lives relative to the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Topology {
    /// Scheduler and radio on this host.
    #[default]
    Full,
    /// This host only owns the radio and serves it over the relay link.
    SdrRelay,
    /// This host schedules; the radio is reached through a relay.
    Server,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StationConfig {
    pub name: Option<String>,
    pub coordinates: String,
    #[serde(default)]
    pub altitude_m: f64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SdrConfig {
    pub gain: f64,
    /// Shell template; see `ProcessDevice`.
    pub capture_command: String,
    pub chunk_size: usize,
    pub buffer_depth: usize,
    pub spectrum: SpectrumConfig,
}

impl Default for SdrConfig {
    fn default() -> Self {
        Self {
            gain: 30.0,
            capture_command:
                "rtl_fm -f {frequency} -s {bandwidth} -r {sample_rate} -g {gain} -".to_string(),
            chunk_size: 16 * 1024,
            buffer_depth: 256,
            spectrum: SpectrumConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct GainControlConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(flatten)]
    pub limits: GainConfig,
}

impl Default for GainControlConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            limits: GainConfig::default(),
        }
    }
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PredictConfig {
    pub tle_folder: PathBuf,
    pub hours_ahead: f64,
    pub min_elevation: f64,
    /// When set, only passes culminating at least this high are scheduled.
    pub high_quality_min_elevation: Option<f64>,
    #[serde(with = "duration")]
    pub refresh: Duration,
    #[serde(with = "duration")]
    pub step: Duration,
}

impl Default for PredictConfig {
    fn default() -> Self {
        Self {
            tle_folder: PathBuf::from("tle"),
            hours_ahead: 24.0,
            min_elevation: 10.0,
            high_quality_min_elevation: None,
            refresh: Duration::from_secs(6 * 3600),
            step: Duration::from_secs(30),
        }
    }
}

impl PredictConfig {
    pub fn options(&self) -> PredictOptions {
        PredictOptions {
            hours_ahead: self.hours_ahead,
            min_elevation: self.min_elevation,
            step_seconds: self.step.as_secs().max(1) as i64,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    #[serde(with = "duration")]
    pub lead_time: Duration,
    #[serde(with = "duration")]
    pub guard: Duration,
    /// Passes whose AOS is older than this are skipped, not joined late.
    #[serde(with = "duration")]
    pub grace: Duration,
    #[serde(with = "duration")]
    pub los_tolerance: Duration,
    #[serde(with = "duration")]
    pub tick: Duration,
    pub max_retries: u32,
    pub recordings_dir: PathBuf,
    pub history: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            lead_time: Duration::from_secs(120),
            guard: Duration::from_secs(30),
            grace: Duration::from_secs(60),
            los_tolerance: Duration::from_secs(10),
            tick: Duration::from_secs(1),
            max_retries: 1,
            recordings_dir: PathBuf::from("recordings"),
            history: 50,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Listen address for the `sdr-relay` topology.
    pub bind: Option<String>,
    /// `tcp://host:port` of the relay, for the `server` topology.
    pub url: Option<String>,
    pub link: LinkSettings,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DecoderConfig {
    /// Per signal type shell template with `{input}`, `{output}`,
    /// `{satellite}` and `{signal}` placeholders.
    pub commands: HashMap<SignalType, String>,
    pub output_dir: PathBuf,
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            commands: HashMap::new(),
            output_dir: PathBuf::from("images"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebConfig {
    #[serde(default = "default_bind")]
    pub bind: Option<String>,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> Option<String> {
    Some("0.0.0.0:8080".to_string())
}

impl Config {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Config = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn station_location(&self) -> Result<StationLocation, ConfigError> {
        StationLocation::from_coordinates(&self.station.coordinates, self.station.altitude_m)
            .map_err(|e| ConfigError::Invalid(e.to_string()))
    }

    fn validate(&self) -> Result<(), ConfigError> {
        self.station_location()?;

        match self.topology {
            Topology::Server if self.relay.url.is_none() => {
                return Err(invalid("topology `server` needs relay.url"));
            }
            Topology::SdrRelay if self.relay.bind.is_none() => {
                return Err(invalid("topology `sdr-relay` needs relay.bind"));
            }
            Topology::Full | Topology::SdrRelay if self.sdr.capture_command.trim().is_empty() => {
                return Err(invalid("sdr.capture_command is empty"));
            }
            _ => {}
        }
        if let Some(url) = &self.relay.url {
            crate::relay::endpoint_address(url).map_err(|e| invalid(&e.to_string()))?;
        }

        let gain = &self.gain_control.limits;
        if gain.min_gain > gain.max_gain {
            return Err(invalid("gain_control.min_gain exceeds max_gain"));
        }
        if gain.target_min >= gain.target_max {
            return Err(invalid("gain_control.target_min must be below target_max"));
        }
        if gain.samples_needed == 0 {
            return Err(invalid("gain_control.samples_needed must be positive"));
        }
        if self.scheduler.tick.is_zero() {
            return Err(invalid("scheduler.tick must be positive"));
        }
        if !(0.0..=90.0).contains(&self.predict.min_elevation) {
            return Err(invalid("predict.min_elevation must be within 0..90"));
        }

        let mut seen = HashSet::new();
        for sat in &self.satellites {
            if !seen.insert(sat.norad_id) {
                return Err(ConfigError::Invalid(format!(
                    "satellite {} listed twice (NORAD {})",
                    sat.name, sat.norad_id
                )));
            }
        }
        Ok(())
    }
}

fn invalid(message: &str) -> ConfigError {
    ConfigError::Invalid(message.to_string())
}

/// `humantime` strings ("90s", "2m 30s") for `Duration` fields.
pub mod duration {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&humantime::format_duration(*value).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
station:
  name: rooftop
  coordinates: "52.0116, 4.3571"
  altitude_m: 12
topology: server
sdr:
  gain: 28
relay:
  url: tcp://pi.local:7373
  link:
    heartbeat_interval: 1s
    resume_window: 45s
scheduler:
  lead_time: 3m
  grace: 90s
decoder:
  commands:
    apt: "noaa-apt {input} -o {output}"
satellites:
  - name: NOAA 19
    norad_id: 33591
    frequency_hz: 137100000
    signal: apt
  - name: ISS
    norad_id: 25544
    frequency_hz: 145800000
    signal: sstv
    event_based: true
"#;

    #[test]
    fn parses_full_config() {
        let config = Config::parse(SAMPLE).unwrap();
        assert_eq!(config.topology, Topology::Server);
        assert_eq!(config.station.name.as_deref(), Some("rooftop"));
        assert_eq!(config.sdr.gain, 28.0);
        assert_eq!(config.relay.link.heartbeat_interval, Duration::from_secs(1));
        assert_eq!(config.relay.link.resume_window, Duration::from_secs(45));
        assert_eq!(config.relay.link.max_missed_heartbeats, 3);
        assert_eq!(config.scheduler.lead_time, Duration::from_secs(180));
        assert_eq!(config.scheduler.grace, Duration::from_secs(90));
        assert_eq!(config.scheduler.tick, Duration::from_secs(1));
        assert!(config.decoder.commands.contains_key(&SignalType::Apt));
        assert_eq!(config.satellites.len(), 2);
        assert!(config.satellites[1].event_based);
        assert!(config.gain_control.enabled);
        assert_eq!(config.gain_control.limits.target_max, -55.0);
        let station = config.station_location().unwrap();
        assert!((station.latitude_deg - 52.0116).abs() < 1e-9);
    }

    #[test]
    fn example_config_is_valid() {
        let config = Config::parse(include_str!("../config.example.yaml")).unwrap();
        assert_eq!(config.topology, Topology::Full);
        assert_eq!(config.satellites.len(), 4);
        assert_eq!(config.decoder.commands.len(), 2);
        assert_eq!(config.predict.refresh, Duration::from_secs(6 * 3600));
    }

    #[test]
    fn gain_overrides_are_flattened() {
        let yaml = r#"
station: { coordinates: "10, 20" }
gain_control:
  enabled: false
  target_min: -90
  step: 2
"#;
        let config = Config::parse(yaml).unwrap();
        assert!(!config.gain_control.enabled);
        assert_eq!(config.gain_control.limits.target_min, -90.0);
        assert_eq!(config.gain_control.limits.step, 2.0);
        assert_eq!(config.gain_control.limits.max_gain, 50.0);
    }

    #[test]
    fn rejects_invalid_configs() {
        let bad_station = "station: { coordinates: \"95, 10\" }";
        assert!(matches!(Config::parse(bad_station), Err(ConfigError::Invalid(_))));

        let no_url = "station: { coordinates: \"1, 2\" }\ntopology: server";
        assert!(matches!(Config::parse(no_url), Err(ConfigError::Invalid(_))));

        let bad_duration = "station: { coordinates: \"1, 2\" }\nscheduler: { grace: soon }";
        assert!(matches!(Config::parse(bad_duration), Err(ConfigError::Yaml(_))));

        let duplicate = r#"
station: { coordinates: "1, 2" }
satellites:
  - { name: A, norad_id: 1, frequency_hz: 1, signal: apt }
  - { name: B, norad_id: 1, frequency_hz: 2, signal: lrpt }
"#;
        assert!(matches!(Config::parse(duplicate), Err(ConfigError::Invalid(_))));
    }
}
