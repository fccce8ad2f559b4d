//! Talos API reachability check.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::net::TcpStream;
use tracing::debug;

/// Default Talos API port.
pub const TALOS_API_PORT: u16 = 50000;

/// Errors returned when a service could not be reached.
#[derive(Error, Debug)]
pub enum ProbeError {
    /// Connection was refused or failed.
    #[error("{addr} unreachable after {attempts} attempts: {source}")]
    Unreachable {
        addr: String,
        attempts: u32,
        #[source]
        source: std::io::Error,
    },

    /// Connection did not complete within the connect timeout.
    #[error("{addr} timed out after {attempts} attempts")]
    Timeout { addr: String, attempts: u32 },
}

/// Checks whether a management API accepts connections.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ServiceProbe: Send + Sync {
    /// Try up to `attempts` times. Returns the last attempt's error when all fail.
    async fn check(&self, host: &str, attempts: u32) -> Result<(), ProbeError>;
}

/// TCP probe for the Talos API port.
#[derive(Debug, Clone)]
pub struct TalosApiProbe {
    port: u16,
    connect_timeout: Duration,
    retry_interval: Duration,
}

impl Default for TalosApiProbe {
    fn default() -> Self {
        Self {
            port: TALOS_API_PORT,
            connect_timeout: Duration::from_secs(5),
            retry_interval: Duration::from_secs(5),
        }
    }
}

impl TalosApiProbe {
    /// Probe a different port.
    #[must_use]
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Set per-attempt connect timeout and the delay between attempts.
    #[must_use]
    pub fn with_timing(mut self, connect_timeout: Duration, retry_interval: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self.retry_interval = retry_interval;
        self
    }

    async fn connect_once(&self, addr: &str, attempts: u32) -> Result<(), ProbeError> {
        match tokio::time::timeout(self.connect_timeout, TcpStream::connect(addr)).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(source)) => Err(ProbeError::Unreachable {
                addr: addr.to_string(),
                attempts,
                source,
            }),
            Err(_) => Err(ProbeError::Timeout {
                addr: addr.to_string(),
                attempts,
            }),
        }
    }
}

#[async_trait]
impl ServiceProbe for TalosApiProbe {
    async fn check(&self, host: &str, attempts: u32) -> Result<(), ProbeError> {
        let addr = format!("{host}:{}", self.port);
        let attempts = attempts.max(1);

        let mut attempt = 1;
        loop {
            match self.connect_once(&addr, attempt).await {
                Ok(()) => return Ok(()),
                Err(e) if attempt >= attempts => return Err(e),
                Err(e) => {
                    debug!(addr = %addr, attempt, error = %e, "Talos API not reachable yet");
                    tokio::time::sleep(self.retry_interval).await;
                    attempt += 1;
                }
            }
        }
    }
}
