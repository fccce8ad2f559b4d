//! Provisioning states and the server descriptor.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

use crate::talos::TalosImage;

/// Where a server stands in the provisioning flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProvisioningState {
    /// Not determined yet.
    Unknown,
    /// Rescue system has not been requested.
    Uninitialized,
    /// Rescue system is armed but the server has not booted into it.
    RescueModeInitiated,
    /// A reset is needed to boot into the rescue system.
    RequiresReboot,
    /// Reset issued, waiting for SSH in the rescue system.
    WaitForReboot,
    /// Rescue system reachable over SSH.
    SshAvailable,
    /// Image written to disk, server rebooting into Talos.
    TalosImageInstalled,
    /// Talos API reachable. Success.
    TalosApiAvailable,
    /// Server number unknown to the Robot API.
    ServerNotFound,
    /// Descriptor has no server number.
    MissingServerNumber,
    /// Robot API failed in a state that cannot recover from it.
    RobotApiUnavailable,
}

/// Name that does not correspond to any [`ProvisioningState`].
#[derive(Error, Debug, PartialEq, Eq)]
#[error("unknown state: {0}")]
pub struct UnknownStateError(pub String);

impl ProvisioningState {
    /// Every state, in flow order.
    pub const ALL: [Self; 11] = [
        Self::Unknown,
        Self::Uninitialized,
        Self::RescueModeInitiated,
        Self::RequiresReboot,
        Self::WaitForReboot,
        Self::SshAvailable,
        Self::TalosImageInstalled,
        Self::TalosApiAvailable,
        Self::ServerNotFound,
        Self::MissingServerNumber,
        Self::RobotApiUnavailable,
    ];

    /// Canonical name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Unknown => "Unknown",
            Self::Uninitialized => "Uninitialized",
            Self::RescueModeInitiated => "RescueModeInitiated",
            Self::RequiresReboot => "RequiresReboot",
            Self::WaitForReboot => "WaitForReboot",
            Self::SshAvailable => "SSHAvailable",
            Self::TalosImageInstalled => "TalosImageInstalled",
            Self::TalosApiAvailable => "TalosAPIAvailable",
            Self::ServerNotFound => "ServerNotFound",
            Self::MissingServerNumber => "MissingServerNumber",
            Self::RobotApiUnavailable => "RobotAPIUnavailable",
        }
    }

    /// The success state.
    #[must_use]
    pub const fn is_success(self) -> bool {
        matches!(self, Self::TalosApiAvailable)
    }

    /// States that end a run with an error.
    #[must_use]
    pub const fn is_failure(self) -> bool {
        matches!(
            self,
            Self::ServerNotFound | Self::MissingServerNumber | Self::RobotApiUnavailable
        )
    }

    /// States that end a run.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        self.is_success() || self.is_failure()
    }

    /// States where only the extended retry ceiling applies, because the
    /// server's status is not observable while it reboots.
    #[must_use]
    pub const fn is_reboot_tolerant(self) -> bool {
        matches!(
            self,
            Self::Unknown | Self::Uninitialized | Self::WaitForReboot | Self::TalosImageInstalled
        )
    }
}

impl fmt::Display for ProvisioningState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProvisioningState {
    type Err = UnknownStateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|state| state.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| UnknownStateError(s.to_string()))
    }
}

/// The server to provision. Immutable during a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerDescriptor {
    server_number: u32,
    disk: String,
    talos_version: Option<String>,
    image_url: Option<String>,
}

impl ServerDescriptor {
    /// Server number `0` means unset.
    #[must_use]
    pub fn new(server_number: u32, disk: impl Into<String>) -> Self {
        Self {
            server_number,
            disk: disk.into(),
            talos_version: None,
            image_url: None,
        }
    }

    /// Install the official release image of this version.
    #[must_use]
    pub fn with_talos_version(mut self, version: impl Into<String>) -> Self {
        self.talos_version = Some(version.into()).filter(|v: &String| !v.is_empty());
        self
    }

    /// Install from an explicit URL. Takes precedence over the version.
    #[must_use]
    pub fn with_image_url(mut self, url: impl Into<String>) -> Self {
        self.image_url = Some(url.into()).filter(|u: &String| !u.is_empty());
        self
    }

    #[must_use]
    pub fn server_number(&self) -> u32 {
        self.server_number
    }

    /// Device name below `/dev`.
    #[must_use]
    pub fn disk(&self) -> &str {
        &self.disk
    }

    /// Both a version and an image URL were given.
    #[must_use]
    pub fn has_conflicting_image(&self) -> bool {
        self.talos_version.is_some() && self.image_url.is_some()
    }

    /// Resolved image source: URL, then version, then the default release.
    #[must_use]
    pub fn image(&self) -> TalosImage {
        match (&self.image_url, &self.talos_version) {
            (Some(url), _) => TalosImage::Url(url.clone()),
            (None, Some(version)) => TalosImage::Release(version.clone()),
            (None, None) => TalosImage::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names_round_trip() {
        for state in ProvisioningState::ALL {
            assert_eq!(state.to_string().parse::<ProvisioningState>(), Ok(state));
        }
        assert_eq!(
            "sshavailable".parse::<ProvisioningState>(),
            Ok(ProvisioningState::SshAvailable)
        );
    }

    #[test]
    fn test_unknown_name_is_rejected() {
        let err = "Provisioned".parse::<ProvisioningState>().unwrap_err();
        assert_eq!(err.to_string(), "unknown state: Provisioned");
    }

    #[test]
    fn test_classification() {
        let terminal: Vec<_> = ProvisioningState::ALL
            .into_iter()
            .filter(|s| s.is_terminal())
            .collect();
        assert_eq!(
            terminal,
            vec![
                ProvisioningState::TalosApiAvailable,
                ProvisioningState::ServerNotFound,
                ProvisioningState::MissingServerNumber,
                ProvisioningState::RobotApiUnavailable,
            ]
        );
        assert!(ProvisioningState::TalosApiAvailable.is_success());
        assert!(!ProvisioningState::TalosApiAvailable.is_failure());
        assert!(!ProvisioningState::SshAvailable.is_reboot_tolerant());
        assert!(ProvisioningState::WaitForReboot.is_reboot_tolerant());
    }

    #[test]
    fn test_image_url_wins_over_version() {
        let server = ServerDescriptor::new(12345, "sda")
            .with_talos_version("v1.9.2")
            .with_image_url("https://example.com/talos.raw.zst");

        assert!(server.has_conflicting_image());
        assert_eq!(
            server.image(),
            TalosImage::Url("https://example.com/talos.raw.zst".to_string())
        );
    }

    #[test]
    fn test_version_and_default_image() {
        let server = ServerDescriptor::new(12345, "sda").with_talos_version("v1.8.4");
        assert_eq!(server.image(), TalosImage::Release("v1.8.4".to_string()));

        let server = ServerDescriptor::new(12345, "sda").with_image_url("");
        assert_eq!(server.image(), TalosImage::default());
        assert!(!server.has_conflicting_image());
    }
}
