//! Noise-floor driven receiver gain control.
//!
//! The controller collects the median power of each spectrum snapshot, and
//! once `samples_needed` medians are buffered compares their mean against the
//! target band. It then either settles (disabling itself), steps the gain, or
//! gives up when the gain range is exhausted.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GainConfig {
    pub target_min: f64,
    pub target_max: f64,
    pub samples_needed: usize,
    pub step: f64,
    pub min_gain: f64,
    pub max_gain: f64,
}

impl Default for GainConfig {
    fn default() -> Self {
        Self {
            target_min: -80.0,
            target_max: -55.0,
            samples_needed: 10,
            step: 5.0,
            min_gain: 0.0,
            max_gain: 50.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum GainDecision {
    Waiting,
    InRange { gain: f64 },
    Adjusted { old: f64, new: f64 },
    /// Target band unreachable within `[min_gain, max_gain]`.
    LimitReached { gain: f64 },
}

#[derive(Debug, Clone)]
pub struct AutoGainController {
    config: GainConfig,
    current_gain: f64,
    enabled: bool,
    samples: Vec<f64>,
}

impl AutoGainController {
    pub fn new(config: GainConfig, initial_gain: f64) -> Self {
        Self {
            current_gain: initial_gain.clamp(config.min_gain, config.max_gain),
            config,
            enabled: true,
            samples: Vec::with_capacity(config.samples_needed),
        }
    }

    pub fn current_gain(&self) -> f64 {
        self.current_gain
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn buffered(&self) -> usize {
        self.samples.len()
    }

    pub fn enable(&mut self) {
        self.enabled = true;
        self.samples.clear();
    }

    pub fn disable(&mut self) {
        self.enabled = false;
        self.samples.clear();
    }

    /// Re-arm the loop keeping the current gain.
    pub fn reset(&mut self) {
        self.enable();
    }

    /// Manual override; stops the loop.
    pub fn set_gain(&mut self, gain: f64) {
        self.current_gain = gain.clamp(self.config.min_gain, self.config.max_gain);
        self.disable();
    }

    pub fn feed(&mut self, bins: &[f32]) -> GainDecision {
        if !self.enabled {
            return GainDecision::Waiting;
        }
        let Some(median) = median(bins) else {
            return GainDecision::Waiting;
        };
        self.samples.push(median);
        if self.samples.len() < self.config.samples_needed {
            return GainDecision::Waiting;
        }

        let average = self.samples.iter().sum::<f64>() / self.samples.len() as f64;
        self.samples.clear();

        let proposed = if average > self.config.target_max {
            self.current_gain - self.config.step
        } else if average < self.config.target_min {
            self.current_gain + self.config.step
        } else {
            log::info!(
                "Noise floor {:.1} dB within target at gain {}",
                average,
                self.current_gain
            );
            self.enabled = false;
            return GainDecision::InRange {
                gain: self.current_gain,
            };
        };

        let clamped = proposed.clamp(self.config.min_gain, self.config.max_gain);
        if clamped == self.current_gain {
            log::warn!(
                "Noise floor {:.1} dB outside [{}, {}] but gain is pinned at {}",
                average,
                self.config.target_min,
                self.config.target_max,
                self.current_gain
            );
            self.enabled = false;
            return GainDecision::LimitReached {
                gain: self.current_gain,
            };
        }

        let old = self.current_gain;
        self.current_gain = clamped;
        log::info!("Noise floor {:.1} dB, gain {} -> {}", average, old, clamped);
        GainDecision::Adjusted { old, new: clamped }
    }
}

/// Median of the finite readings; `None` when there are none.
fn median(bins: &[f32]) -> Option<f64> {
    let mut values: Vec<f64> = bins
        .iter()
        .filter(|v| v.is_finite())
        .map(|&v| v as f64)
        .collect();
    if values.is_empty() {
        return None;
    }
    values.sort_by(|a, b| a.total_cmp(b));
    let mid = values.len() / 2;
    Some(if values.len() % 2 == 0 {
        (values[mid - 1] + values[mid]) / 2.0
    } else {
        values[mid]
    })
}
