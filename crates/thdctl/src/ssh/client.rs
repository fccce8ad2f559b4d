//! libssh2 based [`RemoteExec`] implementation.
//!
//! libssh2 is blocking, so every network operation runs on tokio's blocking
//! pool. A single session is kept and each command opens its own channel.

use std::io::Read;
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ssh2::Session;
use tracing::{debug, error, info};

use super::{shell_quote, RemoteExec, SshError};

/// Where the downloaded image is stored in the rescue system.
pub const IMAGE_PATH: &str = "/tmp/talos.raw.zst";

/// Default SSH port.
const DEFAULT_PORT: u16 = 22;

/// Timeout for TCP connect and SSH handshake.
const CONNECT_TIMEOUT_SECS: u64 = 5;

/// Longest a blocking libssh2 call may wait for the rescue system once
/// connected. `wget` and `zstdcat -v` report progress well within this.
const COMMAND_TIMEOUT_SECS: u64 = 30 * 60;

/// Attempts made by [`RemoteExec::wait_for_reboot`].
const REBOOT_ATTEMPTS: u32 = 10;

/// Delay between [`RemoteExec::wait_for_reboot`] attempts.
const REBOOT_INTERVAL_SECS: u64 = 10;

/// SSH client for the rescue system.
pub struct SshClient {
    host: String,
    port: u16,
    user: String,
    password: String,
    connect_timeout: Duration,
    command_timeout: Duration,
    reboot_attempts: u32,
    reboot_interval: Duration,
    session: Option<Arc<Session>>,
}

impl Default for SshClient {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: DEFAULT_PORT,
            user: "root".to_string(),
            password: String::new(),
            connect_timeout: Duration::from_secs(CONNECT_TIMEOUT_SECS),
            command_timeout: Duration::from_secs(COMMAND_TIMEOUT_SECS),
            reboot_attempts: REBOOT_ATTEMPTS,
            reboot_interval: Duration::from_secs(REBOOT_INTERVAL_SECS),
            session: None,
        }
    }
}

impl std::fmt::Debug for SshClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshClient")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("connected", &self.session.is_some())
            .finish_non_exhaustive()
    }
}

impl SshClient {
    /// Set the TCP connect and handshake timeout.
    #[must_use]
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set how long a connected session may wait on a silent remote command.
    #[must_use]
    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    /// Set how often and how long [`RemoteExec::wait_for_reboot`] polls.
    #[must_use]
    pub fn with_reboot_polling(mut self, attempts: u32, interval: Duration) -> Self {
        self.reboot_attempts = attempts;
        self.reboot_interval = interval;
        self
    }

    fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    fn session(&self) -> Result<Arc<Session>, SshError> {
        self.session.clone().ok_or(SshError::NoSession)
    }
}

/// libssh2 timeout in milliseconds. Zero would disable the timeout.
fn timeout_millis(timeout: Duration) -> u32 {
    u32::try_from(timeout.as_millis())
        .unwrap_or(u32::MAX)
        .max(1)
}

/// Open a TCP connection, run the SSH handshake and authenticate.
fn connect(
    addr: &str,
    user: &str,
    password: &str,
    timeout: Duration,
    command_timeout: Duration,
) -> Result<Session, SshError> {
    let dial_error = |source| SshError::Connect {
        addr: addr.to_string(),
        source,
    };

    let socket = addr
        .to_socket_addrs()
        .map_err(dial_error)?
        .next()
        .ok_or_else(|| {
            dial_error(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "no address resolved",
            ))
        })?;
    let tcp = TcpStream::connect_timeout(&socket, timeout).map_err(dial_error)?;

    let mut session = Session::new()?;
    session.set_tcp_stream(tcp);
    session.set_timeout(timeout_millis(timeout));
    session.handshake()?;
    session.userauth_password(user, password)?;
    if !session.authenticated() {
        return Err(SshError::Auth(user.to_string()));
    }

    // Image download and install run for minutes.
    session.set_timeout(timeout_millis(command_timeout));
    Ok(session)
}

/// Run a command on its own channel, capturing stdout and stderr together.
fn run_command(session: &Session, command: &str) -> Result<String, SshError> {
    let mut channel = session.channel_session()?;
    channel.handle_extended_data(ssh2::ExtendedData::Merge)?;
    channel.exec(command)?;

    let output = read_output(&mut channel)?;
    channel.wait_close()?;

    let status = channel.exit_status()?;
    if status != 0 {
        return Err(SshError::Command {
            command: command.to_string(),
            status,
            output,
        });
    }
    Ok(output)
}

/// Read a command's output. Invalid UTF-8 (progress bars, binary) is replaced.
fn read_output<R: Read>(reader: &mut R) -> Result<String, SshError> {
    let mut bytes = Vec::new();
    reader.read_to_end(&mut bytes)?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

#[async_trait]
impl RemoteExec for SshClient {
    fn set_target_host(&mut self, host: &str, port: u16) {
        self.host = host.to_string();
        self.port = port;
    }

    fn auth(&mut self, user: &str, password: &str) {
        self.user = user.to_string();
        self.password = password.to_string();
    }

    async fn establish_session(&mut self) -> Result<(), SshError> {
        if self.host.is_empty() {
            return Err(SshError::NotConfigured);
        }

        let addr = self.address();
        let user = self.user.clone();
        let password = self.password.clone();
        let timeout = self.connect_timeout;
        let command_timeout = self.command_timeout;
        debug!(addr = %addr, user = %user, "Establishing SSH session");

        let session = tokio::task::spawn_blocking(move || {
            connect(&addr, &user, &password, timeout, command_timeout)
        })
        .await??;
        self.session = Some(Arc::new(session));
        Ok(())
    }

    async fn execute(&self, command: &str) -> Result<String, SshError> {
        let session = self.session()?;
        let command = command.to_string();
        debug!(host = %self.host, command = %command, "Executing remote command");

        tokio::task::spawn_blocking(move || run_command(&session, &command)).await?
    }

    async fn download_image(&self, url: &str) -> Result<String, SshError> {
        self.execute(&format!("wget -O {IMAGE_PATH} {}", shell_quote(url)))
            .await
    }

    async fn install_image(&self, disk: &str) -> Result<String, SshError> {
        let device = shell_quote(&format!("/dev/{disk}"));
        self.execute(&format!("zstdcat -dv {IMAGE_PATH} > {device} && sync"))
            .await
    }

    async fn list_disks(&self) -> Result<String, SshError> {
        self.execute("lsblk").await
    }

    async fn verify_disk_exists(&self, disk: &str) -> Result<String, SshError> {
        self.execute(&format!("lsblk {}", shell_quote(&format!("/dev/{disk}"))))
            .await
    }

    async fn wait_for_reboot(&mut self) -> bool {
        for attempt in 1..=self.reboot_attempts {
            info!(attempt, host = %self.host, port = self.port, "Establishing SSH session");

            match self.establish_session().await {
                Ok(()) => return true,
                Err(e) => {
                    error!(attempt, host = %self.host, port = self.port, error = %e, "Error establishing SSH session");
                    if attempt < self.reboot_attempts {
                        info!("Retrying in {:?}...", self.reboot_interval);
                        tokio::time::sleep(self.reboot_interval).await;
                    }
                }
            }
        }
        false
    }
}
