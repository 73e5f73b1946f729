//! Hands finished recordings to external image decoders.

use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io;
use std::path::PathBuf;
use std::process::{Command as StdCommand, Stdio};
use std::thread;

use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::predict::SignalType;

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("no decoder configured for {0}")]
    NoCommand(&'static str),
    #[error("failed to start decoder: {0}")]
    Spawn(#[from] io::Error),
}

#[derive(Debug, Clone, PartialEq)]
pub struct DecodeRequest {
    pub job_id: Uuid,
    pub satellite: String,
    pub signal: SignalType,
    pub input: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum DecodeOutcome {
    Success { output: PathBuf },
    Failed { reason: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct DecodeReport {
    pub job_id: Uuid,
    pub outcome: DecodeOutcome,
}

/// Fire-and-forget decoding. `submit` returns as soon as the work is queued;
/// the outcome arrives later as a [`DecodeReport`].
pub trait Decoder: Send {
    fn submit(&self, request: DecodeRequest) -> Result<(), DecodeError>;
}

/// Runs a shell template per signal type in its own thread.
pub struct CommandDecoder {
    commands: HashMap<SignalType, String>,
    output_dir: PathBuf,
    reports: mpsc::UnboundedSender<DecodeReport>,
}

impl CommandDecoder {
    pub fn new(
        commands: HashMap<SignalType, String>,
        output_dir: PathBuf,
        reports: mpsc::UnboundedSender<DecodeReport>,
    ) -> Self {
        Self {
            commands,
            output_dir,
            reports,
        }
    }

    fn output_path(&self, request: &DecodeRequest) -> PathBuf {
        let stem = request
            .input
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| request.job_id.to_string());
        self.output_dir.join(format!("{stem}.png"))
    }
}

impl Decoder for CommandDecoder {
    fn submit(&self, request: DecodeRequest) -> Result<(), DecodeError> {
        let template = self
            .commands
            .get(&request.signal)
            .ok_or(DecodeError::NoCommand(request.signal.as_str()))?;
        fs::create_dir_all(&self.output_dir)?;

        let output = self.output_path(&request);
        let cmd = template
            .replace("{input}", &request.input.to_string_lossy())
            .replace("{output}", &output.to_string_lossy())
            .replace("{satellite}", &request.satellite)
            .replace("{signal}", request.signal.as_str());

        let log_path = output.with_extension("log");
        let log_file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&log_path)?;

        log::info!("Decoding {} for {}: {}", request.job_id, request.satellite, cmd);
        let mut child = StdCommand::new("sh")
            .arg("-c")
            .arg(&cmd)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log_file.try_clone()?))
            .stderr(Stdio::from(log_file))
            .spawn()?;
        log::debug!("Decoder spawned (PID: {})", child.id());

        let reports = self.reports.clone();
        let job_id = request.job_id;
        thread::spawn(move || {
            let outcome = match child.wait() {
                Ok(status) if status.success() => DecodeOutcome::Success { output },
                Ok(status) => DecodeOutcome::Failed {
                    reason: format!(
                        "decoder exited with code {}, see {}",
                        status.code().unwrap_or(-1),
                        log_path.display()
                    ),
                },
                Err(e) => DecodeOutcome::Failed {
                    reason: format!("wait error: {e}"),
                },
            };
            let _ = reports.send(DecodeReport { job_id, outcome });
        });
        Ok(())
    }
}
