use thiserror::Error;

/// Anything that makes the active capture unusable. Aborts the job, never
/// the process.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum HardwareFault {
    #[error("failed to start capture device: {0}")]
    DeviceStart(String),
    #[error("capture device exited (code {0:?})")]
    DeviceExited(Option<i32>),
    #[error("sample sink error: {0}")]
    Sink(String),
    #[error("receiver not acquired")]
    NotAcquired,
    #[error("no acknowledgement for {command} within timeout")]
    CommandTimeout { command: String },
    #[error("relay rejected {command}: {message}")]
    CommandRejected { command: String, message: String },
    #[error("relay unavailable: {0}")]
    RelayUnavailable(String),
    #[error("relay link lost: {0}")]
    LinkLost(String),
    #[error("relay device fault: {0}")]
    Remote(String),
}

impl From<std::io::Error> for HardwareFault {
    fn from(err: std::io::Error) -> Self {
        HardwareFault::Sink(err.to_string())
    }
}
