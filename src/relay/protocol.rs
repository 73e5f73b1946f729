//! Relay wire format.
//!
//! Every frame is `[kind: u8][len: u32 BE][payload]`. Control frames carry a
//! JSON [`RelayMessage`]; sample frames carry `[seq: u64 BE][raw bytes]`.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::receiver::{SampleChunk, Tuning};
use crate::relay::error::RelayError;

pub const PROTOCOL_VERSION: u32 = 1;
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

const KIND_CONTROL: u8 = 1;
const KIND_SAMPLES: u8 = 2;
const HEADER_LEN: usize = 5;

/// Commands sent from the scheduler host to the relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum RelayCommand {
    Tune { tuning: Tuning },
    SetGain { gain: f64 },
    StartCapture,
    StopCapture,
}

impl RelayCommand {
    pub fn verb(&self) -> &'static str {
        match self {
            RelayCommand::Tune { .. } => "tune",
            RelayCommand::SetGain { .. } => "set_gain",
            RelayCommand::StartCapture => "start_capture",
            RelayCommand::StopCapture => "stop_capture",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RelayMessage {
    Hello {
        version: u32,
    },
    Command {
        id: u64,
        command: RelayCommand,
    },
    Ack {
        id: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    Heartbeat {
        seq: u64,
    },
    /// Chunks the relay had to drop since the last report.
    Overrun {
        dropped: u64,
    },
    /// The relay's device failed during a capture.
    Fault {
        message: String,
    },
}

#[derive(Debug, Clone)]
pub enum Frame {
    Control(RelayMessage),
    Samples(SampleChunk),
}

pub fn encode(frame: &Frame, dst: &mut BytesMut) -> Result<(), RelayError> {
    match frame {
        Frame::Control(msg) => {
            let payload = serde_json::to_vec(msg)?;
            check_len(payload.len())?;
            dst.reserve(HEADER_LEN + payload.len());
            dst.put_u8(KIND_CONTROL);
            dst.put_u32(payload.len() as u32);
            dst.put_slice(&payload);
        }
        Frame::Samples(chunk) => {
            let len = 8 + chunk.data.len();
            check_len(len)?;
            dst.reserve(HEADER_LEN + len);
            dst.put_u8(KIND_SAMPLES);
            dst.put_u32(len as u32);
            dst.put_u64(chunk.seq);
            dst.put_slice(&chunk.data);
        }
    }
    Ok(())
}

/// Decode one frame from the front of `src`, or `None` if it is incomplete.
pub fn decode(src: &mut BytesMut) -> Result<Option<Frame>, RelayError> {
    if src.len() < HEADER_LEN {
        return Ok(None);
    }
    let kind = src[0];
    let len = u32::from_be_bytes([src[1], src[2], src[3], src[4]]) as usize;
    check_len(len)?;
    if src.len() < HEADER_LEN + len {
        src.reserve(HEADER_LEN + len - src.len());
        return Ok(None);
    }
    src.advance(HEADER_LEN);
    let mut payload = src.split_to(len);
    match kind {
        KIND_CONTROL => Ok(Some(Frame::Control(serde_json::from_slice(&payload)?))),
        KIND_SAMPLES => {
            if payload.len() < 8 {
                return Err(RelayError::Protocol("short sample frame".into()));
            }
            let seq = payload.get_u64();
            Ok(Some(Frame::Samples(SampleChunk {
                seq,
                data: payload.freeze(),
            })))
        }
        other => Err(RelayError::Protocol(format!("unknown frame kind {other}"))),
    }
}

fn check_len(len: usize) -> Result<(), RelayError> {
    if len > MAX_FRAME_LEN {
        Err(RelayError::FrameTooLarge(len))
    } else {
        Ok(())
    }
}

/// `Ok(None)` on a clean close between frames.
pub async fn read_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
    buf: &mut BytesMut,
) -> Result<Option<Frame>, RelayError> {
    loop {
        if let Some(frame) = decode(buf)? {
            return Ok(Some(frame));
        }
        if reader.read_buf(buf).await? == 0 {
            return if buf.is_empty() {
                Ok(None)
            } else {
                Err(RelayError::Protocol("connection closed mid-frame".into()))
            };
        }
    }
}

pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    frame: &Frame,
) -> Result<(), RelayError> {
    let mut buf = BytesMut::new();
    encode(frame, &mut buf)?;
    writer.write_all(&buf).await?;
    Ok(())
}

pub fn control(msg: RelayMessage) -> Frame {
    Frame::Control(msg)
}

pub fn samples(seq: u64, data: Bytes) -> Frame {
    Frame::Samples(SampleChunk { seq, data })
}
