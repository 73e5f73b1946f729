use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::receiver::device::SampleChunk;
use crate::receiver::spectrum::{SpectrumAnalyzer, SpectrumConfig};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CaptureStats {
    pub bytes_written: u64,
    pub chunks: u64,
    pub dropped_chunks: u64,
    /// Times the stream started over mid-capture (relay session resumed).
    /// Chunks in flight across the interruption are not in `dropped_chunks`.
    pub resumed: u64,
}

/// Consumer end of a sample stream: writes the sink file, accounts for
/// sequence gaps and produces spectrum snapshots for gain control.
pub struct SampleIngest {
    path: PathBuf,
    sink: BufWriter<File>,
    analyzer: SpectrumAnalyzer,
    stats: CaptureStats,
    next_seq: Option<u64>,
}

impl SampleIngest {
    pub fn create(path: &Path, spectrum: SpectrumConfig) -> io::Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = File::create(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            sink: BufWriter::new(file),
            analyzer: SpectrumAnalyzer::new(spectrum),
            stats: CaptureStats::default(),
            next_seq: None,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// A restarted stream (device restart, relay resume) begins again at a
    /// lower sequence number.
    pub fn restart_sequence(&mut self) {
        self.next_seq = None;
    }

    pub fn ingest(&mut self, chunk: &SampleChunk) -> io::Result<Vec<Vec<f32>>> {
        if let Some(expected) = self.next_seq {
            if chunk.seq > expected {
                let gap = chunk.seq - expected;
                self.stats.dropped_chunks += gap;
                log::warn!(
                    "{}: {} chunks lost before seq {}",
                    self.path.display(),
                    gap,
                    chunk.seq
                );
            } else if chunk.seq < expected {
                self.stats.resumed += 1;
                log::info!(
                    "{}: sample stream restarted at seq {}",
                    self.path.display(),
                    chunk.seq
                );
            }
        }
        self.next_seq = Some(chunk.seq + 1);

        self.sink.write_all(&chunk.data)?;
        self.stats.bytes_written += chunk.data.len() as u64;
        self.stats.chunks += 1;
        Ok(self.analyzer.push(&chunk.data))
    }

    pub fn finish(mut self) -> io::Result<CaptureStats> {
        self.sink.flush()?;
        Ok(self.stats)
    }
}
