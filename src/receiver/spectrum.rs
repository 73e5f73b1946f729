use std::collections::VecDeque;
use std::sync::Arc;

use num_complex::Complex32;
use rustfft::{Fft, FftPlanner};
use serde::{Deserialize, Serialize};

/// Layout of the raw bytes the capture command produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SampleFormat {
    /// Interleaved unsigned 8-bit I/Q (`rtl_sdr`).
    Cu8,
    /// Signed 16-bit little endian real samples (`rtl_fm`).
    #[default]
    S16le,
}

impl SampleFormat {
    fn bytes_per_sample(&self) -> usize {
        2
    }

    fn decode(&self, b: [u8; 2]) -> Complex32 {
        match self {
            SampleFormat::Cu8 => Complex32::new(
                (b[0] as f32 - 127.5) / 127.5,
                (b[1] as f32 - 127.5) / 127.5,
            ),
            SampleFormat::S16le => Complex32::new(i16::from_le_bytes(b) as f32 / 32768.0, 0.0),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpectrumConfig {
    pub format: SampleFormat,
    pub fft_size: usize,
    /// Samples between consecutive snapshots.
    pub snapshot_interval: usize,
}

impl Default for SpectrumConfig {
    fn default() -> Self {
        Self {
            format: SampleFormat::S16le,
            fft_size: 1024,
            snapshot_interval: 48_000,
        }
    }
}

/// Turns a raw byte stream into periodic power spectra (dBFS per bin).
pub struct SpectrumAnalyzer {
    config: SpectrumConfig,
    fft: Arc<dyn Fft<f32>>,
    window: Vec<f32>,
    recent: VecDeque<Complex32>,
    remainder: Vec<u8>,
    since_last: usize,
}

impl SpectrumAnalyzer {
    pub fn new(config: SpectrumConfig) -> Self {
        let size = config.fft_size.max(2);
        let fft = FftPlanner::<f32>::new().plan_fft_forward(size);
        let window = (0..size)
            .map(|i| {
                0.5 - 0.5 * (2.0 * std::f32::consts::PI * i as f32 / (size - 1) as f32).cos()
            })
            .collect();
        Self {
            config: SpectrumConfig {
                fft_size: size,
                ..config
            },
            fft,
            window,
            recent: VecDeque::with_capacity(size),
            remainder: Vec::new(),
            since_last: 0,
        }
    }

    pub fn push(&mut self, bytes: &[u8]) -> Vec<Vec<f32>> {
        let width = self.config.format.bytes_per_sample();
        let mut data = std::mem::take(&mut self.remainder);
        data.extend_from_slice(bytes);

        let mut snapshots = Vec::new();
        let whole = data.len() - data.len() % width;
        for pair in data[..whole].chunks_exact(width) {
            if self.recent.len() == self.config.fft_size {
                self.recent.pop_front();
            }
            self.recent.push_back(self.config.format.decode([pair[0], pair[1]]));
            self.since_last += 1;
            if self.since_last >= self.config.snapshot_interval
                && self.recent.len() == self.config.fft_size
            {
                snapshots.push(self.snapshot());
                self.since_last = 0;
            }
        }
        self.remainder = data[whole..].to_vec();
        snapshots
    }

    fn snapshot(&self) -> Vec<f32> {
        let mut buf: Vec<Complex32> = self
            .recent
            .iter()
            .zip(&self.window)
            .map(|(s, w)| *s * *w)
            .collect();
        self.fft.process(&mut buf);

        let gain: f32 = self.window.iter().sum();
        let norm = gain * gain;
        let bins = match self.config.format {
            // Real input: upper half mirrors the lower.
            SampleFormat::S16le => &buf[..buf.len() / 2],
            SampleFormat::Cu8 => &buf[..],
        };
        bins.iter()
            .map(|c| 10.0 * (c.norm_sqr() / norm + 1e-20).log10())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn s16(samples: &[i16]) -> Vec<u8> {
        samples.iter().flat_map(|s| s.to_le_bytes()).collect()
    }

    #[test]
    fn snapshot_every_interval() {
        let mut analyzer = SpectrumAnalyzer::new(SpectrumConfig {
            format: SampleFormat::S16le,
            fft_size: 64,
            snapshot_interval: 100,
        });
        let bytes = s16(&vec![0i16; 350]);
        let snaps = analyzer.push(&bytes);
        assert_eq!(snaps.len(), 3);
        assert_eq!(snaps[0].len(), 32);
    }

    #[test]
    fn split_samples_are_carried_over() {
        let mut analyzer = SpectrumAnalyzer::new(SpectrumConfig {
            format: SampleFormat::S16le,
            fft_size: 4,
            snapshot_interval: 4,
        });
        let bytes = s16(&[1000, -1000, 1000, -1000]);
        assert!(analyzer.push(&bytes[..3]).is_empty());
        assert_eq!(analyzer.push(&bytes[3..]).len(), 1);
    }

    #[test]
    fn louder_input_reads_higher() {
        let config = SpectrumConfig {
            format: SampleFormat::Cu8,
            fft_size: 256,
            snapshot_interval: 256,
        };
        // Deterministic pseudo-noise around mid-scale.
        let noise = |amp: f32| -> Vec<u8> {
            let mut state = 12345u32;
            (0..512)
                .map(|_| {
                    state = state.wrapping_mul(1_103_515_245).wrapping_add(12345);
                    let r = ((state >> 16) & 0xff) as f32 / 255.0 - 0.5;
                    (127.5 + r * amp).round() as u8
                })
                .collect()
        };
        let median = |v: &[f32]| {
            let mut v = v.to_vec();
            v.sort_by(|a, b| a.total_cmp(b));
            v[v.len() / 2]
        };
        let quiet = SpectrumAnalyzer::new(config).push(&noise(8.0));
        let loud = SpectrumAnalyzer::new(config).push(&noise(200.0));
        assert_eq!(quiet.len(), 1);
        assert_eq!(loud.len(), 1);
        assert!(median(&loud[0]) > median(&quiet[0]) + 20.0);
    }
}
