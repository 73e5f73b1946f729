use std::{
    io::{self, Read},
    os::unix::process::CommandExt,
    process::{Child, ChildStdout, Command as StdCommand, Stdio},
    thread,
};

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::receiver::{HardwareFault, Tuning};

/// One block of raw samples. `seq` increases by one per block produced by the
/// device, including blocks that were dropped on overflow, so consumers can
/// see gaps.
#[derive(Debug, Clone)]
pub struct SampleChunk {
    pub seq: u64,
    pub data: Bytes,
}

pub type SampleFeed = mpsc::Receiver<SampleChunk>;

/// Producer of raw samples for a tuned radio.
pub trait SampleDevice: Send {
    /// Start streaming into a buffer of `depth` chunks.
    fn start(&mut self, tuning: &Tuning, gain: f64, depth: usize)
        -> Result<SampleFeed, HardwareFault>;
    /// Err once the device has died underneath an active capture.
    fn check(&mut self) -> Result<(), HardwareFault>;
    fn stop(&mut self);
}

/// Runs a capture command (`rtl_fm`, `rtl_sdr`, ...) and streams its stdout.
///
/// The command is a template; `{frequency}`, `{bandwidth}`, `{sample_rate}`
/// and `{gain}` are substituted before it is handed to `sh -c`. The shell
/// leads its own process group so that stopping the device also ends every
/// process of a pipeline.
pub struct ProcessDevice {
    template: String,
    chunk_size: usize,
    child: Option<Child>,
}

impl ProcessDevice {
    pub fn new(template: String, chunk_size: usize) -> Self {
        Self {
            template,
            chunk_size: chunk_size.max(1),
            child: None,
        }
    }

    pub fn render(&self, tuning: &Tuning, gain: f64) -> String {
        self.template
            .replace("{frequency}", &tuning.frequency_hz.to_string())
            .replace("{bandwidth}", &tuning.bandwidth_hz.to_string())
            .replace("{sample_rate}", &tuning.sample_rate.to_string())
            .replace("{gain}", &format!("{gain}"))
    }
}

impl SampleDevice for ProcessDevice {
    fn start(
        &mut self,
        tuning: &Tuning,
        gain: f64,
        depth: usize,
    ) -> Result<SampleFeed, HardwareFault> {
        self.stop();

        let cmd = self.render(tuning, gain);
        log::info!("Starting capture command: {}", cmd);

        let mut child = StdCommand::new("sh")
            .arg("-c")
            .arg(&cmd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .process_group(0)
            .spawn()
            .map_err(|e| HardwareFault::DeviceStart(e.to_string()))?;

        log::info!("Capture spawned (PID: {})", child.id());

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| HardwareFault::DeviceStart("no stdout pipe".into()))?;
        let (tx, rx) = mpsc::channel(depth.max(1));
        let chunk_size = self.chunk_size;
        thread::spawn(move || {
            if let Err(e) = pump(stdout, chunk_size, tx) {
                log::warn!("Capture reader stopped: {}", e);
            }
        });

        self.child = Some(child);
        Ok(rx)
    }

    fn check(&mut self) -> Result<(), HardwareFault> {
        let Some(child) = &mut self.child else {
            return Err(HardwareFault::NotAcquired);
        };
        match child.try_wait() {
            Ok(None) => Ok(()),
            Ok(Some(status)) => {
                kill_group(child);
                self.child = None;
                Err(HardwareFault::DeviceExited(status.code()))
            }
            Err(e) => Err(HardwareFault::DeviceStart(e.to_string())),
        }
    }

    fn stop(&mut self) {
        if let Some(mut child) = self.child.take() {
            kill_group(&child);
            let _ = child.kill();
            let _ = child.wait();
            log::info!("Capture process stopped");
        }
    }
}

impl Drop for ProcessDevice {
    fn drop(&mut self) {
        self.stop();
    }
}

fn kill_group(child: &Child) {
    let Ok(pgid) = libc::pid_t::try_from(child.id()) else {
        return;
    };
    // SAFETY: kill(2) with a negative pid signals the group led by our child.
    unsafe {
        libc::kill(-pgid, libc::SIGKILL);
    }
}

/// Copy stdout into the bounded feed; a full feed drops the chunk.
fn pump(mut stdout: ChildStdout, chunk_size: usize, tx: mpsc::Sender<SampleChunk>) -> io::Result<()> {
    let mut seq = 0u64;
    let mut dropped = 0u64;
    loop {
        let mut buf = vec![0u8; chunk_size];
        let n = stdout.read(&mut buf)?;
        if n == 0 {
            return Ok(());
        }
        buf.truncate(n);
        let chunk = SampleChunk {
            seq,
            data: Bytes::from(buf),
        };
        seq += 1;
        match tx.try_send(chunk) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                dropped += 1;
                if dropped.is_power_of_two() {
                    log::warn!("Sample buffer overrun, {} chunks dropped so far", dropped);
                }
            }
            Err(mpsc::error::TrySendError::Closed(_)) => return Ok(()),
        }
    }
}
