use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;

use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use crate::config::SchedulerConfig;
use crate::decoder::{DecodeOutcome, DecodeReport, DecodeRequest, Decoder};
use crate::gain::{AutoGainController, GainDecision};
use crate::predict::{Pass, SatelliteProfile};
use crate::receiver::{HardwareFault, Receiver, Tuning};
use crate::scheduler::state::{
    CaptureJob, JobOutcome, Progress, SchedulerSnapshot, SchedulerStatus, StatusEvent,
};

#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub lead_time: Duration,
    pub guard: Duration,
    pub grace: Duration,
    pub los_tolerance: Duration,
    pub max_retries: u32,
    pub recordings_dir: PathBuf,
    pub history: usize,
}

impl SchedulerSettings {
    pub fn from_config(config: &SchedulerConfig) -> Self {
        let millis = |d: std::time::Duration| Duration::milliseconds(d.as_millis() as i64);
        Self {
            lead_time: millis(config.lead_time),
            guard: millis(config.guard),
            grace: millis(config.grace),
            los_tolerance: millis(config.los_tolerance),
            max_retries: config.max_retries,
            recordings_dir: config.recordings_dir.clone(),
            history: config.history.max(1),
        }
    }
}

#[derive(Debug, Clone)]
struct Queued {
    pass: Pass,
    retry_count: u32,
}

/// The pass being waited for or recorded. `job` is set once the receiver has
/// been acquired.
#[derive(Debug)]
struct Active {
    pass: Pass,
    retry_count: u32,
    job: Option<CaptureJob>,
}

/// Drives the capture cycle: idle, waiting, recording, decoding, plus
/// scanning for event-based transmitters.
///
/// All transitions happen in [`tick`](Self::tick), which only compares the
/// given time against pass boundaries and drains what the receiver has
/// buffered. It never waits on I/O.
pub struct CaptureScheduler<R> {
    settings: SchedulerSettings,
    profiles: HashMap<u32, SatelliteProfile>,
    receiver: R,
    gain: AutoGainController,
    auto_gain: bool,
    decoder: Box<dyn Decoder>,
    status: SchedulerStatus,
    queue: VecDeque<Queued>,
    scan_windows: Vec<Pass>,
    active: Option<Active>,
    handled: Vec<Pass>,
    history: VecDeque<CaptureJob>,
}

impl<R: Receiver> CaptureScheduler<R> {
    /// A controller that is disabled on entry stays manual: captures use its
    /// gain but never re-enable it.
    pub fn new(
        settings: SchedulerSettings,
        profiles: Vec<SatelliteProfile>,
        receiver: R,
        gain: AutoGainController,
        decoder: Box<dyn Decoder>,
    ) -> Self {
        Self {
            settings,
            profiles: profiles.into_iter().map(|p| (p.norad_id, p)).collect(),
            receiver,
            auto_gain: gain.is_enabled(),
            gain,
            decoder,
            status: SchedulerStatus::Idle,
            queue: VecDeque::new(),
            scan_windows: Vec::new(),
            active: None,
            handled: Vec::new(),
            history: VecDeque::new(),
        }
    }

    pub fn status(&self) -> SchedulerStatus {
        self.status
    }

    /// Finished jobs, oldest first.
    pub fn history(&self) -> impl DoubleEndedIterator<Item = &CaptureJob> {
        self.history.iter()
    }

    #[cfg(test)]
    pub fn receiver(&self) -> &R {
        &self.receiver
    }

    /// Replace the pass queue and scanning windows after a prediction run.
    /// The active pass and passes already handled are left out.
    pub fn set_passes(&mut self, passes: Vec<Pass>) {
        let previous: Vec<Queued> = self.queue.drain(..).collect();
        self.scan_windows.clear();

        for pass in passes {
            let Some(event_based) = self.profiles.get(&pass.norad_id).map(|p| p.event_based)
            else {
                log::debug!("No profile for {}, ignoring pass", pass.satellite);
                continue;
            };
            let in_progress = self
                .active
                .as_ref()
                .is_some_and(|a| a.pass.overlaps(pass.norad_id, pass.aos, pass.los));
            if in_progress || self.is_handled(&pass) {
                continue;
            }
            if event_based {
                self.scan_windows.push(pass);
                continue;
            }
            let retry_count = previous
                .iter()
                .find(|q| q.pass.overlaps(pass.norad_id, pass.aos, pass.los))
                .map_or(0, |q| q.retry_count);
            self.queue.push_back(Queued { pass, retry_count });
        }

        self.queue
            .make_contiguous()
            .sort_by(|a, b| by_aos(&a.pass, &b.pass));
        self.scan_windows.sort_by(by_aos);
        log::info!(
            "{} passes queued, {} scanning windows",
            self.queue.len(),
            self.scan_windows.len()
        );
    }

    /// Advance the state machine. Returns an event only when the state changed.
    pub fn tick(&mut self, now: DateTime<Utc>) -> Option<StatusEvent> {
        let before = self.status;
        self.handled.retain(|p| p.los + Duration::hours(1) > now);

        match self.status {
            SchedulerStatus::Idle => self.idle(now),
            SchedulerStatus::Waiting => self.waiting(now),
            SchedulerStatus::Recording => self.recording(now),
            SchedulerStatus::Decoding => self.decoding(now),
            SchedulerStatus::Scanning => self.scanning(now),
        }

        if self.status != before {
            log::info!("Scheduler {} -> {}", before.as_str(), self.status.as_str());
            Some(self.event(now))
        } else {
            None
        }
    }

    /// Manual stop: cancel whatever is active and go idle. The cancelled pass
    /// is not re-entered.
    pub fn stop(&mut self, now: DateTime<Utc>) -> Option<StatusEvent> {
        let before = self.status;
        if let Some(active) = self.active.take() {
            let stats = self.receiver.release();
            if let Some(mut job) = active.job {
                log::warn!("Capture of {} cancelled", job.pass.satellite);
                job.end = Some(now);
                job.stats = stats;
                job.outcome = JobOutcome::Failed;
                job.failure = Some("cancelled".to_string());
                job.final_gain = Some(self.gain.current_gain());
                self.archive(job);
            }
            self.handled.push(active.pass);
        }
        self.status = SchedulerStatus::Idle;
        (self.status != before).then(|| self.event(now))
    }

    /// Record a decoder outcome against its job. False if the job is unknown
    /// (e.g. already dropped from the history).
    pub fn on_decode_complete(&mut self, report: DecodeReport) -> bool {
        match self.history.iter_mut().find(|j| j.id == report.job_id) {
            Some(job) => {
                match &report.outcome {
                    DecodeOutcome::Success { output } => {
                        log::info!("Decoded {} to {}", job.pass.satellite, output.display())
                    }
                    DecodeOutcome::Failed { reason } => {
                        log::warn!("Decoding {} failed: {}", job.pass.satellite, reason)
                    }
                }
                job.decode = Some(report.outcome);
                true
            }
            None => {
                log::warn!("Decode report for unknown job {}", report.job_id);
                false
            }
        }
    }

    pub fn snapshot(&self, now: DateTime<Utc>) -> SchedulerSnapshot {
        SchedulerSnapshot {
            status: self.status(),
            current_pass: self.active.as_ref().map(|a| a.pass.clone()),
            progress: self.progress(now),
            current_job: self.active.as_ref().and_then(|a| a.job.clone()),
            upcoming: self.queue.iter().map(|q| q.pass.clone()).collect(),
            scan_windows: self.scan_windows.clone(),
            history: self.history().rev().cloned().collect(),
            gain: self.gain.current_gain(),
            gain_control_active: self.gain.is_enabled(),
        }
    }

    fn idle(&mut self, now: DateTime<Utc>) {
        self.discard_stale(now);
        if self.take_imminent(now) {
            return;
        }
        let window = self
            .scan_windows
            .iter()
            .find(|w| w.aos <= now && now < w.los && !self.is_handled(w))
            .cloned();
        if let Some(window) = window {
            log::info!("Scanning for {} until {}", window.satellite, window.los);
            self.start_capture(window, 0, true, now);
        }
    }

    fn waiting(&mut self, now: DateTime<Utc>) {
        let ready = match &self.active {
            Some(active) => now >= active.pass.aos - self.settings.guard,
            None => {
                self.status = SchedulerStatus::Idle;
                return;
            }
        };
        if !ready {
            return;
        }
        if let Some(active) = self.active.take() {
            self.start_capture(active.pass, active.retry_count, false, now);
        }
    }

    fn recording(&mut self, now: DateTime<Utc>) {
        if let Err(fault) = self.pump() {
            self.abort(fault, now);
            return;
        }
        let Some(los) = self.active.as_ref().map(|a| a.pass.los) else {
            self.status = SchedulerStatus::Idle;
            return;
        };
        if now >= los + self.settings.los_tolerance {
            self.finish(now);
            self.status = SchedulerStatus::Decoding;
        }
    }

    fn decoding(&mut self, now: DateTime<Utc>) {
        self.discard_stale(now);
        if !self.take_imminent(now) {
            self.status = SchedulerStatus::Idle;
        }
    }

    fn scanning(&mut self, now: DateTime<Utc>) {
        if let Err(fault) = self.pump() {
            self.abort(fault, now);
            return;
        }
        self.discard_stale(now);
        let preempted = self
            .queue
            .front()
            .is_some_and(|q| q.pass.aos - self.settings.lead_time <= now);
        let closed = self.active.as_ref().map_or(true, |a| now >= a.pass.los);

        if preempted {
            log::info!("Scanning pre-empted by an upcoming pass");
            self.finish(now);
            self.take_imminent(now);
        } else if closed {
            self.finish(now);
            self.status = SchedulerStatus::Idle;
        }
    }

    fn discard_stale(&mut self, now: DateTime<Utc>) {
        while let Some(front) = self.queue.front() {
            if now - front.pass.aos <= self.settings.grace {
                break;
            }
            if let Some(stale) = self.queue.pop_front() {
                log::warn!(
                    "Skipping {}: AOS {} is {}s in the past",
                    stale.pass.satellite,
                    stale.pass.aos,
                    (now - stale.pass.aos).num_seconds()
                );
                self.handled.push(stale.pass);
            }
        }
    }

    fn take_imminent(&mut self, now: DateTime<Utc>) -> bool {
        let imminent = self
            .queue
            .front()
            .is_some_and(|q| q.pass.aos - self.settings.lead_time <= now);
        if !imminent {
            return false;
        }
        let Some(next) = self.queue.pop_front() else {
            return false;
        };
        log::info!(
            "Waiting for {} (AOS {}, max elevation {:.1}°)",
            next.pass.satellite,
            next.pass.aos,
            next.pass.max_elevation_deg
        );
        self.active = Some(Active {
            pass: next.pass,
            retry_count: next.retry_count,
            job: None,
        });
        self.status = SchedulerStatus::Waiting;
        true
    }

    fn start_capture(&mut self, pass: Pass, retry_count: u32, scanning: bool, now: DateTime<Utc>) {
        let Some(profile) = self.profiles.get(&pass.norad_id) else {
            log::warn!("Profile for {} disappeared, dropping pass", pass.satellite);
            self.handled.push(pass);
            self.status = SchedulerStatus::Idle;
            return;
        };
        let demod = profile.demod();
        let tuning = Tuning {
            frequency_hz: profile.frequency_hz,
            bandwidth_hz: demod.bandwidth_hz,
            sample_rate: demod.sample_rate,
        };
        let signal = profile.signal;
        let sink = self.sink_path(&pass, retry_count, scanning);

        if self.auto_gain {
            self.gain.reset();
        }
        let gain = self.gain.current_gain();
        log::info!(
            "Recording {} at {} Hz, gain {} -> {}",
            pass.satellite,
            tuning.frequency_hz,
            gain,
            sink.display()
        );

        let job = CaptureJob {
            id: Uuid::new_v4(),
            pass: pass.clone(),
            signal,
            scanning,
            start: now,
            end: None,
            sink: sink.clone(),
            retry_count,
            outcome: JobOutcome::Pending,
            failure: None,
            stats: None,
            final_gain: None,
            decode: None,
        };
        self.active = Some(Active {
            pass,
            retry_count,
            job: Some(job),
        });
        self.status = if scanning {
            SchedulerStatus::Scanning
        } else {
            SchedulerStatus::Recording
        };

        if let Err(fault) = self.receiver.acquire(&tuning, gain, &sink) {
            self.abort(fault, now);
        }
    }

    /// Drain buffered samples and run gain control on their snapshots.
    fn pump(&mut self) -> Result<(), HardwareFault> {
        for snapshot in self.receiver.poll()? {
            match self.gain.feed(&snapshot) {
                GainDecision::Waiting => {}
                GainDecision::InRange { gain } => {
                    log::info!("Noise floor within target at gain {}", gain)
                }
                GainDecision::Adjusted { old, new } => {
                    log::info!("Adjusting gain {} -> {}", old, new);
                    self.receiver.set_gain(new)?;
                }
                GainDecision::LimitReached { gain } => {
                    log::warn!("Gain limit reached at {}, noise floor target unreachable", gain)
                }
            }
        }
        Ok(())
    }

    /// Normal end of a capture: release, then hand the recording to the
    /// decoder without waiting for it.
    fn finish(&mut self, now: DateTime<Utc>) {
        let Some(active) = self.active.take() else {
            return;
        };
        let stats = self.receiver.release();
        self.handled.push(active.pass);
        let Some(mut job) = active.job else {
            return;
        };
        job.end = Some(now);
        job.stats = stats;
        job.outcome = JobOutcome::Success;
        job.final_gain = Some(self.gain.current_gain());

        let request = DecodeRequest {
            job_id: job.id,
            satellite: job.pass.satellite.clone(),
            signal: job.signal,
            input: job.sink.clone(),
        };
        match self.decoder.submit(request) {
            Ok(()) => log::info!("Submitted {} for decoding", job.sink.display()),
            Err(e) => {
                log::warn!("Could not submit {} for decoding: {}", job.sink.display(), e);
                job.decode = Some(DecodeOutcome::Failed {
                    reason: e.to_string(),
                });
            }
        }
        self.archive(job);
    }

    fn abort(&mut self, fault: HardwareFault, now: DateTime<Utc>) {
        let stats = self.receiver.release();
        self.status = SchedulerStatus::Idle;
        let Some(active) = self.active.take() else {
            return;
        };
        let retry_count = active.retry_count + 1;
        let mut scanning = false;
        if let Some(mut job) = active.job {
            log::error!("Capture of {} failed: {}", job.pass.satellite, fault);
            scanning = job.scanning;
            job.end = Some(now);
            job.stats = stats;
            job.outcome = JobOutcome::Failed;
            job.failure = Some(fault.to_string());
            job.retry_count = retry_count;
            job.final_gain = Some(self.gain.current_gain());
            self.archive(job);
        }

        if !scanning && now < active.pass.los && retry_count <= self.settings.max_retries {
            log::info!(
                "Re-queueing {} (retry {}/{})",
                active.pass.satellite,
                retry_count,
                self.settings.max_retries
            );
            self.enqueue(Queued {
                pass: active.pass,
                retry_count,
            });
        } else {
            self.handled.push(active.pass);
        }
    }

    fn enqueue(&mut self, queued: Queued) {
        let at = self
            .queue
            .iter()
            .position(|q| by_aos(&queued.pass, &q.pass).is_lt())
            .unwrap_or(self.queue.len());
        self.queue.insert(at, queued);
    }

    fn archive(&mut self, job: CaptureJob) {
        self.history.push_back(job);
        while self.history.len() > self.settings.history {
            self.history.pop_front();
        }
    }

    fn is_handled(&self, pass: &Pass) -> bool {
        self.handled
            .iter()
            .any(|h| h.overlaps(pass.norad_id, pass.aos, pass.los))
    }

    fn progress(&self, now: DateTime<Utc>) -> Option<Progress> {
        if !matches!(
            self.status,
            SchedulerStatus::Recording | SchedulerStatus::Scanning
        ) {
            return None;
        }
        let pass = &self.active.as_ref()?.pass;
        let total = (pass.los - pass.aos).num_seconds();
        Some(Progress {
            elapsed: (now - pass.aos).num_seconds().clamp(0, total),
            total,
        })
    }

    fn event(&self, now: DateTime<Utc>) -> StatusEvent {
        StatusEvent {
            status: self.status(),
            current_pass: self.active.as_ref().map(|a| a.pass.clone()),
            progress: self.progress(now),
        }
    }

    fn sink_path(&self, pass: &Pass, retry_count: u32, scanning: bool) -> PathBuf {
        let name: String = pass
            .satellite
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() {
                    c.to_ascii_lowercase()
                } else {
                    '-'
                }
            })
            .collect();
        let suffix = match (scanning, retry_count) {
            (true, _) => "-scan".to_string(),
            (false, 0) => String::new(),
            (false, n) => format!("-retry{n}"),
        };
        self.settings.recordings_dir.join(format!(
            "{}-{}{}.raw",
            pass.aos.format("%Y%m%d-%H%M%S"),
            name,
            suffix
        ))
    }
}

fn by_aos(a: &Pass, b: &Pass) -> std::cmp::Ordering {
    a.aos.cmp(&b.aos).then_with(|| a.satellite.cmp(&b.satellite))
}
