//! Capture state machine and the async loop that drives it.

mod capture;
mod runner;
mod state;

pub use capture::{CaptureScheduler, SchedulerSettings};
pub use runner::{Control, Runner, SchedulerHandle};
pub use state::{
    CaptureJob, JobOutcome, Progress, SchedulerSnapshot, SchedulerStatus, StatusEvent,
};
