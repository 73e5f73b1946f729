use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Instant;

use bytes::BytesMut;
use serde::Serialize;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep, timeout, Instant as TokioInstant};

use crate::receiver::{
    CaptureStats, HardwareFault, Receiver, SampleChunk, SampleIngest, SpectrumConfig, Tuning,
};
use crate::relay::error::RelayError;
use crate::relay::protocol::{
    control, read_frame, write_frame, Frame, RelayCommand, RelayMessage, PROTOCOL_VERSION,
};
use crate::relay::LinkSettings;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum LinkState {
    Connecting,
    Connected,
    /// Transport dropped while a capture was running.
    Reconnecting {
        #[serde(skip)]
        since: Option<Instant>,
    },
    Unavailable {
        reason: String,
    },
}

#[derive(Debug, Clone, Copy)]
struct CaptureIntent {
    tuning: Tuning,
    gain: f64,
}

#[derive(Debug)]
struct PendingCommand {
    verb: &'static str,
    deadline: Instant,
}

#[derive(Debug)]
struct Outgoing {
    id: u64,
    command: RelayCommand,
}

#[derive(Debug)]
struct Shared {
    state: LinkState,
    next_id: u64,
    pending: HashMap<u64, PendingCommand>,
    /// First fault seen for the current capture; cleared on acquire/release.
    fault: Option<HardwareFault>,
    capture: Option<CaptureIntent>,
    reported_overruns: u64,
}

impl Shared {
    fn register(&mut self, command: &RelayCommand, timeout: std::time::Duration) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.pending.insert(
            id,
            PendingCommand {
                verb: command.verb(),
                deadline: Instant::now() + timeout,
            },
        );
        id
    }

    fn latch(&mut self, fault: HardwareFault) {
        if self.capture.is_some() && self.fault.is_none() {
            log::warn!("Relay capture fault: {}", fault);
            self.fault = Some(fault);
        }
    }
}

#[derive(Clone)]
pub struct LinkMonitor {
    shared: Arc<StdMutex<Shared>>,
}

impl LinkMonitor {
    pub fn state(&self) -> LinkState {
        self.shared.lock().unwrap().state.clone()
    }

    pub fn reported_overruns(&self) -> u64 {
        self.shared.lock().unwrap().reported_overruns
    }
}

enum SessionEnd {
    Transport(String),
    HeartbeatLost(String),
    Shutdown,
}

/// Receiver that drives a radio hosted by a remote [`RelayServer`].
///
/// The link runs in a background task that owns the socket; the methods here
/// only queue commands and inspect shared state, so they never block.
///
/// [`RelayServer`]: crate::relay::RelayServer
pub struct RelayClient {
    settings: LinkSettings,
    spectrum: SpectrumConfig,
    shared: Arc<StdMutex<Shared>>,
    outgoing: mpsc::UnboundedSender<Outgoing>,
    samples: mpsc::Receiver<SampleChunk>,
    ingest: Option<SampleIngest>,
    task: JoinHandle<()>,
}

impl RelayClient {
    /// Start the link task. Must be called inside a tokio runtime.
    pub fn connect(address: String, settings: LinkSettings, spectrum: SpectrumConfig) -> Self {
        let shared = Arc::new(StdMutex::new(Shared {
            state: LinkState::Connecting,
            next_id: 1,
            pending: HashMap::new(),
            fault: None,
            capture: None,
            reported_overruns: 0,
        }));
        let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel();
        let (sample_tx, sample_rx) = mpsc::channel(settings.buffer_depth.max(1));
        let task = tokio::spawn(run_link(
            address,
            settings.clone(),
            shared.clone(),
            outgoing_rx,
            sample_tx,
        ));
        Self {
            settings,
            spectrum,
            shared,
            outgoing: outgoing_tx,
            samples: sample_rx,
            ingest: None,
            task,
        }
    }

    pub fn state(&self) -> LinkState {
        self.shared.lock().unwrap().state.clone()
    }

    /// Read-only view of the link for observers that do not own the client.
    pub fn monitor(&self) -> LinkMonitor {
        LinkMonitor {
            shared: self.shared.clone(),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.state() == LinkState::Connected
    }

    fn send(&self, command: RelayCommand, tracked: bool) -> Result<(), HardwareFault> {
        let id = {
            let mut shared = self.shared.lock().unwrap();
            if tracked {
                shared.register(&command, self.settings.command_timeout)
            } else {
                let id = shared.next_id;
                shared.next_id += 1;
                id
            }
        };
        self.outgoing
            .send(Outgoing { id, command })
            .map_err(|_| HardwareFault::RelayUnavailable("link task stopped".into()))
    }

    fn discard_samples(&mut self) {
        while self.samples.try_recv().is_ok() {}
    }
}

impl Drop for RelayClient {
    fn drop(&mut self) {
        self.task.abort();
    }
}

impl Receiver for RelayClient {
    fn acquire(&mut self, tuning: &Tuning, gain: f64, sink: &Path) -> Result<(), HardwareFault> {
        {
            let shared = self.shared.lock().unwrap();
            match &shared.state {
                LinkState::Connected => {}
                LinkState::Unavailable { reason } => {
                    return Err(HardwareFault::RelayUnavailable(reason.clone()))
                }
                _ => {
                    return Err(HardwareFault::RelayUnavailable(
                        "link not established".into(),
                    ))
                }
            }
        }
        if self.ingest.is_some() {
            self.release();
        }
        self.ingest = Some(SampleIngest::create(sink, self.spectrum)?);
        self.discard_samples();
        {
            let mut shared = self.shared.lock().unwrap();
            shared.fault = None;
            shared.capture = Some(CaptureIntent {
                tuning: *tuning,
                gain,
            });
        }
        self.send(RelayCommand::Tune { tuning: *tuning }, true)?;
        self.send(RelayCommand::SetGain { gain }, true)?;
        self.send(RelayCommand::StartCapture, true)
    }

    fn set_gain(&mut self, gain: f64) -> Result<(), HardwareFault> {
        {
            let mut shared = self.shared.lock().unwrap();
            let Some(capture) = &mut shared.capture else {
                return Err(HardwareFault::NotAcquired);
            };
            capture.gain = gain;
        }
        self.send(RelayCommand::SetGain { gain }, true)
    }

    fn poll(&mut self) -> Result<Vec<Vec<f32>>, HardwareFault> {
        let Some(ingest) = &mut self.ingest else {
            return Ok(Vec::new());
        };
        {
            let shared = self.shared.lock().unwrap();
            if let Some(fault) = &shared.fault {
                return Err(fault.clone());
            }
            let now = Instant::now();
            if let Some(p) = shared.pending.values().find(|p| p.deadline <= now) {
                return Err(HardwareFault::CommandTimeout {
                    command: p.verb.to_string(),
                });
            }
            match &shared.state {
                LinkState::Unavailable { reason } => {
                    return Err(HardwareFault::RelayUnavailable(reason.clone()))
                }
                LinkState::Reconnecting { since: Some(since) }
                    if since.elapsed() > self.settings.resume_window =>
                {
                    return Err(HardwareFault::LinkLost(
                        "not re-established within resume window".into(),
                    ))
                }
                _ => {}
            }
        }

        let mut snapshots = Vec::new();
        while let Ok(chunk) = self.samples.try_recv() {
            snapshots.extend(ingest.ingest(&chunk)?);
        }
        Ok(snapshots)
    }

    fn release(&mut self) -> Option<CaptureStats> {
        let was_capturing = {
            let mut shared = self.shared.lock().unwrap();
            shared.fault = None;
            shared.pending.clear();
            shared.capture.take().is_some()
        };
        if was_capturing && self.send(RelayCommand::StopCapture, false).is_err() {
            log::debug!("Link task gone, relay will stop on session loss");
        }
        self.discard_samples();
        let ingest = self.ingest.take()?;
        let path = ingest.path().to_path_buf();
        match ingest.finish() {
            Ok(stats) => Some(stats),
            Err(e) => {
                log::error!("Failed to finalize {}: {}", path.display(), e);
                None
            }
        }
    }
}

async fn run_link(
    address: String,
    settings: LinkSettings,
    shared: Arc<StdMutex<Shared>>,
    mut outgoing: mpsc::UnboundedReceiver<Outgoing>,
    samples: mpsc::Sender<SampleChunk>,
) {
    let mut failures = 0u32;
    let mut backoff = settings.backoff_initial;

    loop {
        let attempt = timeout(settings.command_timeout, TcpStream::connect(&address)).await;
        let stream = match attempt {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                connect_failed(&shared, &settings, &address, &mut failures, e.to_string());
                sleep(backoff).await;
                backoff = (backoff * 2).min(settings.backoff_max);
                continue;
            }
            Err(_) => {
                connect_failed(&shared, &settings, &address, &mut failures, "timed out".into());
                sleep(backoff).await;
                backoff = (backoff * 2).min(settings.backoff_max);
                continue;
            }
        };

        failures = 0;
        backoff = settings.backoff_initial;
        log::info!("Relay link to {} established", address);

        match session(stream, &settings, &shared, &mut outgoing, &samples).await {
            SessionEnd::Shutdown => return,
            SessionEnd::HeartbeatLost(reason) => {
                log::warn!("Relay {} unavailable: {}", address, reason);
                let mut shared = shared.lock().unwrap();
                shared.pending.clear();
                shared.latch(HardwareFault::LinkLost(reason.clone()));
                shared.state = LinkState::Unavailable { reason };
            }
            SessionEnd::Transport(reason) => {
                log::warn!("Relay {} connection lost: {}", address, reason);
                let mut shared = shared.lock().unwrap();
                shared.pending.clear();
                shared.state = if shared.capture.is_some() && shared.fault.is_none() {
                    LinkState::Reconnecting {
                        since: Some(Instant::now()),
                    }
                } else {
                    LinkState::Connecting
                };
            }
        }
    }
}

fn connect_failed(
    shared: &StdMutex<Shared>,
    settings: &LinkSettings,
    address: &str,
    failures: &mut u32,
    reason: String,
) {
    *failures += 1;
    log::warn!(
        "Relay connect to {} failed (attempt {}/{}): {}",
        address,
        failures,
        settings.connect_attempts,
        reason
    );
    if *failures >= settings.connect_attempts {
        let mut shared = shared.lock().unwrap();
        if !matches!(shared.state, LinkState::Unavailable { .. }) {
            log::error!("Relay {} unavailable after {} attempts", address, failures);
        }
        let reason = format!("{} connect attempts failed: {}", failures, reason);
        shared.latch(HardwareFault::RelayUnavailable(reason.clone()));
        shared.state = LinkState::Unavailable { reason };
    }
}

async fn read_loop(mut reader: OwnedReadHalf, frames: mpsc::Sender<Result<Frame, RelayError>>) {
    let mut buf = BytesMut::with_capacity(64 * 1024);
    loop {
        let result = read_frame(&mut reader, &mut buf).await;
        let done = !matches!(result, Ok(Some(_)));
        let item = match result {
            Ok(Some(frame)) => Ok(frame),
            Ok(None) => Err(RelayError::Protocol("connection closed".into())),
            Err(e) => Err(e),
        };
        if frames.send(item).await.is_err() || done {
            return;
        }
    }
}

async fn session(
    stream: TcpStream,
    settings: &LinkSettings,
    shared: &StdMutex<Shared>,
    outgoing: &mut mpsc::UnboundedReceiver<Outgoing>,
    samples: &mpsc::Sender<SampleChunk>,
) -> SessionEnd {
    let _ = stream.set_nodelay(true);
    let (reader, mut writer) = stream.into_split();
    let (frame_tx, mut frames) = mpsc::channel(64);
    let reader = tokio::spawn(read_loop(reader, frame_tx));

    let end = drive_session(&mut writer, &mut frames, settings, shared, outgoing, samples).await;
    reader.abort();
    end
}

async fn drive_session(
    writer: &mut tokio::net::tcp::OwnedWriteHalf,
    frames: &mut mpsc::Receiver<Result<Frame, RelayError>>,
    settings: &LinkSettings,
    shared: &StdMutex<Shared>,
    outgoing: &mut mpsc::UnboundedReceiver<Outgoing>,
    samples: &mpsc::Sender<SampleChunk>,
) -> SessionEnd {
    let hello = control(RelayMessage::Hello {
        version: PROTOCOL_VERSION,
    });
    if let Err(e) = write_frame(writer, &hello).await {
        return SessionEnd::Transport(e.to_string());
    }

    // Commands queued for the previous session are void.
    while outgoing.try_recv().is_ok() {}

    let replay = resume_or_abandon(shared, settings);
    for msg in replay {
        if let Err(e) = write_frame(writer, &control(msg)).await {
            return SessionEnd::Transport(e.to_string());
        }
    }

    let period = settings.heartbeat_interval;
    let mut heartbeat = interval_at(TokioInstant::now() + period, period);
    let mut heard = false;
    let mut missed = 0u32;
    let mut beat = 0u64;
    let mut local_drops = 0u64;

    loop {
        tokio::select! {
            frame = frames.recv() => match frame {
                Some(Ok(Frame::Samples(chunk))) => {
                    if let Err(mpsc::error::TrySendError::Full(_)) = samples.try_send(chunk) {
                        local_drops += 1;
                        if local_drops.is_power_of_two() {
                            log::warn!("Scheduler-side sample buffer full, {} chunks dropped", local_drops);
                        }
                    }
                }
                Some(Ok(Frame::Control(msg))) => {
                    if let Err(reason) = handle_message(msg, shared, &mut heard) {
                        return SessionEnd::Transport(reason);
                    }
                }
                Some(Err(e)) => return SessionEnd::Transport(e.to_string()),
                None => return SessionEnd::Transport("reader stopped".into()),
            },
            out = outgoing.recv() => match out {
                Some(Outgoing { id, command }) => {
                    log::debug!("-> relay {} (id {})", command.verb(), id);
                    let frame = control(RelayMessage::Command { id, command });
                    if let Err(e) = write_frame(writer, &frame).await {
                        return SessionEnd::Transport(e.to_string());
                    }
                }
                None => return SessionEnd::Shutdown,
            },
            _ = heartbeat.tick() => {
                if heard {
                    missed = 0;
                } else {
                    missed += 1;
                }
                heard = false;
                if missed >= settings.max_missed_heartbeats {
                    return SessionEnd::HeartbeatLost(format!("{missed} consecutive heartbeats missed"));
                }
                beat += 1;
                if let Err(e) = write_frame(writer, &control(RelayMessage::Heartbeat { seq: beat })).await {
                    return SessionEnd::Transport(e.to_string());
                }
            }
        }
    }
}

/// Mark the link up and decide whether an interrupted capture continues.
/// Returns the commands to replay.
fn resume_or_abandon(shared: &StdMutex<Shared>, settings: &LinkSettings) -> Vec<RelayMessage> {
    let mut shared = shared.lock().unwrap();
    let interrupted_at = match shared.state {
        LinkState::Reconnecting { since } => since,
        _ => None,
    };
    shared.pending.clear();
    shared.state = LinkState::Connected;

    let Some(intent) = shared.capture else {
        return Vec::new();
    };
    if shared.fault.is_some() {
        return Vec::new();
    }
    if interrupted_at.is_some_and(|t| t.elapsed() > settings.resume_window) {
        shared.latch(HardwareFault::LinkLost(
            "not re-established within resume window".into(),
        ));
        return Vec::new();
    }

    log::info!("Resuming relay capture at {} Hz", intent.tuning.frequency_hz);
    [
        RelayCommand::Tune {
            tuning: intent.tuning,
        },
        RelayCommand::SetGain { gain: intent.gain },
        RelayCommand::StartCapture,
    ]
    .into_iter()
    .map(|command| RelayMessage::Command {
        id: shared.register(&command, settings.command_timeout),
        command,
    })
    .collect()
}

fn handle_message(msg: RelayMessage, shared: &StdMutex<Shared>, heard: &mut bool) -> Result<(), String> {
    match msg {
        RelayMessage::Hello { version } if version != PROTOCOL_VERSION => {
            return Err(format!("relay speaks protocol {version}, expected {PROTOCOL_VERSION}"));
        }
        RelayMessage::Hello { .. } => {}
        RelayMessage::Heartbeat { .. } => *heard = true,
        RelayMessage::Ack { id, error } => {
            let mut shared = shared.lock().unwrap();
            let verb = shared.pending.remove(&id).map(|p| p.verb);
            if let (Some(verb), Some(message)) = (verb, error) {
                shared.latch(HardwareFault::CommandRejected {
                    command: verb.to_string(),
                    message,
                });
            }
        }
        RelayMessage::Overrun { dropped } => {
            log::warn!("Relay reported {} dropped sample chunks", dropped);
            shared.lock().unwrap().reported_overruns += dropped;
        }
        RelayMessage::Fault { message } => {
            shared.lock().unwrap().latch(HardwareFault::Remote(message));
        }
        RelayMessage::Command { command, .. } => {
            log::warn!("Ignoring unexpected {} command from relay", command.verb());
        }
    }
    Ok(())
}
