//! Remote command execution in the Hetzner rescue system.
//!
//! [`RemoteExec`] is the shell abstraction consumed by the provisioning state
//! machine. [`SshClient`] implements it with libssh2 and password
//! authentication, which is what the rescue system offers.

mod client;
pub mod disks;

use async_trait::async_trait;
use thiserror::Error;

pub use client::{SshClient, IMAGE_PATH};
pub use disks::{log_disks, parse_lsblk_output, DiskInfo};

/// Errors that can occur while talking to the rescue system.
#[derive(Error, Debug)]
pub enum SshError {
    /// No target host was configured before connecting.
    #[error("SSH target host is not configured")]
    NotConfigured,

    /// A command was executed before a session was established.
    #[error("SSH session is not established")]
    NoSession,

    /// TCP connection could not be opened.
    #[error("failed to dial {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// libssh2 reported an error (handshake, channel, auth).
    #[error("SSH protocol error: {0}")]
    Protocol(#[from] ssh2::Error),

    /// Password authentication was rejected.
    #[error("authentication failed for user {0}")]
    Auth(String),

    /// Remote command exited with a non-zero status.
    #[error("command `{command}` exited with status {status}")]
    Command {
        command: String,
        status: i32,
        output: String,
    },

    /// Local I/O error while reading command output.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The blocking SSH worker panicked or was cancelled.
    #[error("SSH worker task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// libssh2's `LIBSSH2_ERROR_TIMEOUT`.
const LIBSSH2_ERROR_TIMEOUT: i32 = -9;

impl SshError {
    /// Whether this is a connection timeout, which is expected while a host reboots.
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        match self {
            Self::Connect { source, .. } | Self::Io(source) => {
                source.kind() == std::io::ErrorKind::TimedOut
                    || source.kind() == std::io::ErrorKind::WouldBlock
            }
            Self::Protocol(e) => {
                matches!(e.code(), ssh2::ErrorCode::Session(LIBSSH2_ERROR_TIMEOUT))
                    || e.message().to_lowercase().contains("timed out")
            }
            _ => false,
        }
    }

    /// Captured output of a failed command, if any.
    #[must_use]
    pub fn output(&self) -> Option<&str> {
        match self {
            Self::Command { output, .. } => Some(output),
            _ => None,
        }
    }
}

/// Shell access to a remote host.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RemoteExec: Send + Sync {
    /// Set the host and port to connect to.
    fn set_target_host(&mut self, host: &str, port: u16);

    /// Set the credentials used by the next [`RemoteExec::establish_session`].
    fn auth(&mut self, user: &str, password: &str);

    /// Connect and authenticate, replacing any existing session.
    async fn establish_session(&mut self) -> Result<(), SshError>;

    /// Run a command and return its combined stdout/stderr.
    async fn execute(&self, command: &str) -> Result<String, SshError>;

    /// Download an image to [`IMAGE_PATH`].
    async fn download_image(&self, url: &str) -> Result<String, SshError>;

    /// Decompress the downloaded image onto `/dev/<disk>`.
    async fn install_image(&self, disk: &str) -> Result<String, SshError>;

    /// Raw `lsblk` output.
    async fn list_disks(&self) -> Result<String, SshError>;

    /// Succeeds when `/dev/<disk>` is a block device.
    async fn verify_disk_exists(&self, disk: &str) -> Result<String, SshError>;

    /// Poll session establishment until the host is back. Returns false when
    /// all attempts failed.
    async fn wait_for_reboot(&mut self) -> bool;
}

/// Quote a value for a POSIX shell.
pub(crate) fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}
