use std::path::Path;

use tokio::sync::mpsc::error::TryRecvError;

use crate::receiver::device::{SampleDevice, SampleFeed};
use crate::receiver::ingest::{CaptureStats, SampleIngest};
use crate::receiver::spectrum::SpectrumConfig;
use crate::receiver::{HardwareFault, Receiver, Tuning};

struct Active {
    tuning: Tuning,
    feed: SampleFeed,
    ingest: SampleIngest,
}

/// Receiver backed by a device attached to this host (`full` topology).
pub struct LocalReceiver<D> {
    device: D,
    spectrum: SpectrumConfig,
    depth: usize,
    active: Option<Active>,
}

impl<D: SampleDevice> LocalReceiver<D> {
    pub fn new(device: D, spectrum: SpectrumConfig, depth: usize) -> Self {
        Self {
            device,
            spectrum,
            depth,
            active: None,
        }
    }
}

impl<D: SampleDevice> Receiver for LocalReceiver<D> {
    fn acquire(&mut self, tuning: &Tuning, gain: f64, sink: &Path) -> Result<(), HardwareFault> {
        if self.active.is_some() {
            log::warn!("Acquire while a capture is active, releasing it first");
            self.release();
        }
        let ingest = SampleIngest::create(sink, self.spectrum)?;
        let feed = self.device.start(tuning, gain, self.depth)?;
        self.active = Some(Active {
            tuning: *tuning,
            feed,
            ingest,
        });
        Ok(())
    }

    fn set_gain(&mut self, gain: f64) -> Result<(), HardwareFault> {
        let Some(active) = &mut self.active else {
            return Err(HardwareFault::NotAcquired);
        };
        // Capture commands take gain on the command line; restart in place.
        self.device.stop();
        active.feed = self.device.start(&active.tuning, gain, self.depth)?;
        active.ingest.restart_sequence();
        Ok(())
    }

    fn poll(&mut self) -> Result<Vec<Vec<f32>>, HardwareFault> {
        let Some(active) = &mut self.active else {
            return Ok(Vec::new());
        };
        let mut snapshots = Vec::new();
        loop {
            match active.feed.try_recv() {
                Ok(chunk) => snapshots.extend(active.ingest.ingest(&chunk)?),
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }
        self.device.check()?;
        Ok(snapshots)
    }

    fn release(&mut self) -> Option<CaptureStats> {
        self.device.stop();
        let active = self.active.take()?;
        let path = active.ingest.path().to_path_buf();
        match active.ingest.finish() {
            Ok(stats) => Some(stats),
            Err(e) => {
                log::error!("Failed to finalize {}: {}", path.display(), e);
                None
            }
        }
    }
}
