//! Exclusive access to a radio, local or behind the relay link.

mod device;
mod error;
mod ingest;
mod local;
mod spectrum;

use std::path::Path;

use serde::{Deserialize, Serialize};

pub use device::{ProcessDevice, SampleChunk, SampleDevice, SampleFeed};
pub use error::HardwareFault;
pub use ingest::{CaptureStats, SampleIngest};
pub use local::LocalReceiver;
pub use spectrum::SpectrumConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tuning {
    pub frequency_hz: u64,
    pub bandwidth_hz: u32,
    pub sample_rate: u32,
}

/// Receiver capability handed to the scheduler.
///
/// Every method returns without waiting on I/O; remote implementations queue
/// work and surface its failures through later `poll` calls.
pub trait Receiver: Send {
    /// Take the radio, tune it and start writing samples to `sink`.
    fn acquire(&mut self, tuning: &Tuning, gain: f64, sink: &Path) -> Result<(), HardwareFault>;
    fn set_gain(&mut self, gain: f64) -> Result<(), HardwareFault>;
    /// Drain buffered samples into the sink; returns spectrum snapshots
    /// produced since the last call.
    fn poll(&mut self) -> Result<Vec<Vec<f32>>, HardwareFault>;
    /// Stop capturing and give the radio back. Never fails; `None` when
    /// nothing was acquired or the sink could not be finalized.
    fn release(&mut self) -> Option<CaptureStats>;
}

impl<R: Receiver + ?Sized> Receiver for Box<R> {
    fn acquire(&mut self, tuning: &Tuning, gain: f64, sink: &Path) -> Result<(), HardwareFault> {
        (**self).acquire(tuning, gain, sink)
    }

    fn set_gain(&mut self, gain: f64) -> Result<(), HardwareFault> {
        (**self).set_gain(gain)
    }

    fn poll(&mut self) -> Result<Vec<Vec<f32>>, HardwareFault> {
        (**self).poll()
    }

    fn release(&mut self) -> Option<CaptureStats> {
        (**self).release()
    }
}
