use std::future::pending;

use bytes::BytesMut;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant};

use crate::receiver::{SampleDevice, SampleFeed, Tuning};
use crate::relay::error::RelayError;
use crate::relay::protocol::{
    control, read_frame, samples, write_frame, Frame, RelayCommand, RelayMessage,
    PROTOCOL_VERSION,
};
use crate::relay::LinkSettings;

/// Radio-side end of the link. Serves one scheduler at a time.
pub struct RelayServer<D> {
    device: D,
    settings: LinkSettings,
}

/// Per-session device state.
#[derive(Default)]
struct Capture {
    tuning: Option<Tuning>,
    gain: f64,
    feed: Option<SampleFeed>,
    /// Next device sequence number expected; resets when the device restarts.
    expected: u64,
    /// Sequence numbers on the wire keep increasing across restarts.
    wire_seq: u64,
    unreported_drops: u64,
}

impl<D: SampleDevice> RelayServer<D> {
    pub fn new(device: D, settings: LinkSettings) -> Self {
        Self { device, settings }
    }

    pub async fn serve(mut self, listener: TcpListener) -> Result<(), RelayError> {
        log::info!("Relay listening on {}", listener.local_addr()?);
        loop {
            let (stream, peer) = listener.accept().await?;
            log::info!("Scheduler connected from {}", peer);
            match self.session(stream).await {
                Ok(()) => log::info!("Session with {} closed", peer),
                Err(e) => log::warn!("Session with {} ended: {}", peer, e),
            }
            self.device.stop();
        }
    }

    async fn session(&mut self, stream: TcpStream) -> Result<(), RelayError> {
        let _ = stream.set_nodelay(true);
        let (mut reader, mut writer) = stream.into_split();
        let (frame_tx, mut frames) = mpsc::channel(64);
        let reader = tokio::spawn(async move {
            let mut buf = BytesMut::with_capacity(4096);
            loop {
                let result = read_frame(&mut reader, &mut buf).await;
                let done = !matches!(result, Ok(Some(_)));
                if frame_tx.send(result).await.is_err() || done {
                    return;
                }
            }
        });

        let result = self.drive(&mut writer, &mut frames).await;
        reader.abort();
        result
    }

    async fn drive(
        &mut self,
        writer: &mut OwnedWriteHalf,
        frames: &mut mpsc::Receiver<Result<Option<Frame>, RelayError>>,
    ) -> Result<(), RelayError> {
        write_frame(
            writer,
            &control(RelayMessage::Hello {
                version: PROTOCOL_VERSION,
            }),
        )
        .await?;

        let period = self.settings.heartbeat_interval;
        let mut heartbeat = interval_at(Instant::now() + period, period);
        let mut capture = Capture::default();
        let mut heard = false;
        let mut missed = 0u32;
        let mut beat = 0u64;

        loop {
            tokio::select! {
                frame = frames.recv() => {
                    let msg = match frame {
                        Some(Ok(Some(Frame::Control(msg)))) => msg,
                        Some(Ok(Some(Frame::Samples(_)))) => {
                            return Err(RelayError::Protocol("scheduler sent samples".into()));
                        }
                        Some(Ok(None)) | None => return Ok(()),
                        Some(Err(e)) => return Err(e),
                    };
                    match msg {
                        RelayMessage::Hello { version } if version != PROTOCOL_VERSION => {
                            return Err(RelayError::Protocol(format!(
                                "scheduler speaks protocol {version}, expected {PROTOCOL_VERSION}"
                            )));
                        }
                        RelayMessage::Heartbeat { .. } => heard = true,
                        RelayMessage::Command { id, command } => {
                            let error = self.execute(&mut capture, command).err();
                            write_frame(writer, &control(RelayMessage::Ack { id, error })).await?;
                        }
                        other => log::debug!("Ignoring {:?}", other),
                    }
                }
                chunk = next_chunk(&mut capture.feed) => match chunk {
                    Some(chunk) => {
                        if chunk.seq > capture.expected {
                            let gap = chunk.seq - capture.expected;
                            capture.wire_seq += gap;
                            capture.unreported_drops += gap;
                        }
                        capture.expected = chunk.seq + 1;
                        if capture.unreported_drops > 0 {
                            let dropped = std::mem::take(&mut capture.unreported_drops);
                            write_frame(writer, &control(RelayMessage::Overrun { dropped })).await?;
                        }
                        write_frame(writer, &samples(capture.wire_seq, chunk.data)).await?;
                        capture.wire_seq += 1;
                    }
                    None => {
                        capture.feed = None;
                        let message = match self.device.check() {
                            Err(fault) => fault.to_string(),
                            Ok(()) => "sample stream ended".to_string(),
                        };
                        log::warn!("Device fault during capture: {}", message);
                        write_frame(writer, &control(RelayMessage::Fault { message })).await?;
                    }
                },
                _ = heartbeat.tick() => {
                    if heard {
                        missed = 0;
                    } else {
                        missed += 1;
                    }
                    heard = false;
                    if missed >= self.settings.max_missed_heartbeats {
                        return Err(RelayError::Protocol(format!(
                            "{missed} consecutive heartbeats missed"
                        )));
                    }
                    beat += 1;
                    write_frame(writer, &control(RelayMessage::Heartbeat { seq: beat })).await?;
                }
            }
        }
    }

    fn execute(&mut self, capture: &mut Capture, command: RelayCommand) -> Result<(), String> {
        log::info!("Relay command: {}", command.verb());
        match command {
            RelayCommand::Tune { tuning } => {
                capture.tuning = Some(tuning);
                if capture.feed.is_some() {
                    self.restart(capture)?;
                }
            }
            RelayCommand::SetGain { gain } => {
                capture.gain = gain;
                if capture.feed.is_some() {
                    self.restart(capture)?;
                }
            }
            RelayCommand::StartCapture => self.restart(capture)?,
            RelayCommand::StopCapture => {
                capture.feed = None;
                self.device.stop();
            }
        }
        Ok(())
    }

    fn restart(&mut self, capture: &mut Capture) -> Result<(), String> {
        let tuning = capture.tuning.ok_or("not tuned")?;
        capture.feed = None;
        let feed = self
            .device
            .start(&tuning, capture.gain, self.settings.buffer_depth)
            .map_err(|e| e.to_string())?;
        capture.feed = Some(feed);
        capture.expected = 0;
        Ok(())
    }
}

async fn next_chunk(feed: &mut Option<SampleFeed>) -> Option<crate::receiver::SampleChunk> {
    match feed {
        Some(feed) => feed.recv().await,
        None => pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::receiver::{HardwareFault, Receiver, SampleChunk, SpectrumConfig};
    use crate::relay::RelayClient;
    use bytes::Bytes;
    use std::time::Duration;

    /// Emits fixed chunks with one sequence gap, then holds the feed open.
    struct GappyDevice {
        starts: Vec<f64>,
        tx: Option<mpsc::Sender<SampleChunk>>,
    }

    impl SampleDevice for GappyDevice {
        fn start(&mut self, _: &Tuning, gain: f64, depth: usize) -> Result<SampleFeed, HardwareFault> {
            self.starts.push(gain);
            let (tx, rx) = mpsc::channel(depth.max(4));
            for seq in [0u64, 1, 3] {
                tx.try_send(SampleChunk {
                    seq,
                    data: Bytes::from_static(&[1, 2, 3, 4]),
                })
                .unwrap();
            }
            self.tx = Some(tx);
            Ok(rx)
        }

        fn check(&mut self) -> Result<(), HardwareFault> {
            Ok(())
        }

        fn stop(&mut self) {
            self.tx = None;
        }
    }

    fn settings() -> LinkSettings {
        LinkSettings {
            heartbeat_interval: Duration::from_millis(50),
            command_timeout: Duration::from_secs(2),
            backoff_initial: Duration::from_millis(10),
            ..LinkSettings::default()
        }
    }

    #[tokio::test]
    async fn streams_samples_to_client() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let device = GappyDevice {
            starts: Vec::new(),
            tx: None,
        };
        tokio::spawn(RelayServer::new(device, settings()).serve(listener));

        let dir = tempfile::tempdir().unwrap();
        let sink = dir.path().join("noaa.raw");
        let mut client = RelayClient::connect(addr, settings(), SpectrumConfig::default());
        let monitor = client.monitor();
        for _ in 0..200 {
            if client.is_connected() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let tuning = Tuning {
            frequency_hz: 137_100_000,
            bandwidth_hz: 40_000,
            sample_rate: 48_000,
        };
        client.acquire(&tuning, 25.0, &sink).unwrap();

        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            client.poll().unwrap();
            if monitor.reported_overruns() > 0 && std::fs::metadata(&sink).is_ok() {
                break;
            }
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        client.poll().unwrap();
        let stats = client.release().unwrap();
        assert_eq!(stats.chunks, 3);
        assert_eq!(stats.bytes_written, 12);
        assert_eq!(stats.dropped_chunks, 1);
        assert_eq!(monitor.reported_overruns(), 1);
        assert_eq!(std::fs::read(&sink).unwrap().len(), 12);
    }

    #[tokio::test]
    async fn start_before_tune_is_rejected() {
        let mut server = RelayServer::new(
            GappyDevice {
                starts: Vec::new(),
                tx: None,
            },
            settings(),
        );
        let mut capture = Capture::default();
        assert_eq!(
            server.execute(&mut capture, RelayCommand::StartCapture),
            Err("not tuned".to_string())
        );
        let tuning = Tuning {
            frequency_hz: 1,
            bandwidth_hz: 1,
            sample_rate: 1,
        };
        server
            .execute(&mut capture, RelayCommand::Tune { tuning })
            .unwrap();
        server.execute(&mut capture, RelayCommand::StartCapture).unwrap();
        server
            .execute(&mut capture, RelayCommand::SetGain { gain: 12.0 })
            .unwrap();
        assert_eq!(server.device.starts, vec![0.0, 12.0]);
    }
}
