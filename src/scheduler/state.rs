use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::PathBuf;
use uuid::Uuid;

use crate::decoder::DecodeOutcome;
use crate::predict::{Pass, SignalType};
use crate::receiver::CaptureStats;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerStatus {
    Idle,
    Waiting,
    Recording,
    Decoding,
    Scanning,
}

impl SchedulerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SchedulerStatus::Idle => "idle",
            SchedulerStatus::Waiting => "waiting",
            SchedulerStatus::Recording => "recording",
            SchedulerStatus::Decoding => "decoding",
            SchedulerStatus::Scanning => "scanning",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobOutcome {
    Pending,
    Success,
    Failed,
}

/// One attempt at recording a pass (or a scanning window).
#[derive(Debug, Clone, Serialize)]
pub struct CaptureJob {
    pub id: Uuid,
    pub pass: Pass,
    pub signal: SignalType,
    pub scanning: bool,
    pub start: DateTime<Utc>,
    pub end: Option<DateTime<Utc>>,
    pub sink: PathBuf,
    pub retry_count: u32,
    pub outcome: JobOutcome,
    pub failure: Option<String>,
    pub stats: Option<CaptureStats>,
    pub final_gain: Option<f64>,
    pub decode: Option<DecodeOutcome>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Progress {
    pub elapsed: i64,
    pub total: i64,
}

/// Published whenever the scheduler changes state.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusEvent {
    pub status: SchedulerStatus,
    pub current_pass: Option<Pass>,
    pub progress: Option<Progress>,
}

/// Read-only view served by the status API.
#[derive(Debug, Clone, Serialize)]
pub struct SchedulerSnapshot {
    pub status: SchedulerStatus,
    pub current_pass: Option<Pass>,
    pub progress: Option<Progress>,
    pub current_job: Option<CaptureJob>,
    pub upcoming: Vec<Pass>,
    pub scan_windows: Vec<Pass>,
    pub history: Vec<CaptureJob>,
    pub gain: f64,
    pub gain_control_active: bool,
}

impl Default for SchedulerSnapshot {
    fn default() -> Self {
        Self {
            status: SchedulerStatus::Idle,
            current_pass: None,
            progress: None,
            current_job: None,
            upcoming: Vec::new(),
            scan_windows: Vec::new(),
            history: Vec::new(),
            gain: 0.0,
            gain_control_active: false,
        }
    }
}
