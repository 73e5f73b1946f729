//! Link between the scheduler host and a radio on another machine.

mod client;
mod error;
mod protocol;
mod server;

use std::time::Duration;

use serde::{Deserialize, Serialize};

use error::RelayError;

pub use client::{LinkMonitor, LinkState, RelayClient};
pub use server::RelayServer;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkSettings {
    #[serde(with = "crate::config::duration")]
    pub heartbeat_interval: Duration,
    pub max_missed_heartbeats: u32,
    #[serde(with = "crate::config::duration")]
    pub command_timeout: Duration,
    pub connect_attempts: u32,
    #[serde(with = "crate::config::duration")]
    pub backoff_initial: Duration,
    #[serde(with = "crate::config::duration")]
    pub backoff_max: Duration,
    /// A capture interrupted by a dropped connection resumes only if the
    /// session is back within this window.
    #[serde(with = "crate::config::duration")]
    pub resume_window: Duration,
    /// Sample chunks buffered before the producer starts dropping.
    pub buffer_depth: usize,
}

impl Default for LinkSettings {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(2),
            max_missed_heartbeats: 3,
            command_timeout: Duration::from_secs(5),
            connect_attempts: 5,
            backoff_initial: Duration::from_secs(1),
            backoff_max: Duration::from_secs(30),
            resume_window: Duration::from_secs(30),
            buffer_depth: 256,
        }
    }
}

/// Accepts `tcp://host:port` or bare `host:port`.
pub fn endpoint_address(url: &str) -> Result<String, RelayError> {
    let addr = url.strip_prefix("tcp://").unwrap_or(url).trim_end_matches('/');
    match addr.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() && port.parse::<u16>().is_ok() => {
            Ok(addr.to_string())
        }
        _ => Err(RelayError::Protocol(format!("bad relay endpoint {url:?}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_endpoints() {
        assert_eq!(endpoint_address("tcp://pi.local:7373").unwrap(), "pi.local:7373");
        assert_eq!(endpoint_address("10.0.0.2:7373/").unwrap(), "10.0.0.2:7373");
        assert!(endpoint_address("tcp://pi.local").is_err());
        assert!(endpoint_address(":7373").is_err());
    }
}
