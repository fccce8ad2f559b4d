//! State machine configuration.

use std::time::Duration;

use super::ProvisionError;

/// Default retry ceiling per state.
pub const DEFAULT_MAX_RETRIES: u32 = 10;

/// Default delay between ticks.
pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_secs(5);

/// Default number of Talos API connection attempts per tick.
pub const DEFAULT_TALOS_PROBE_ATTEMPTS: u32 = 5;

/// Provisioning configuration.
#[derive(Clone)]
pub struct ProvisionConfig {
    /// No-progress ticks tolerated per state. Doubled for reboot tolerant states.
    pub max_retries: u32,
    /// Delay between ticks.
    pub tick_interval: Duration,
    /// SSH port of the rescue system.
    pub ssh_port: u16,
    /// SSH user of the rescue system.
    pub ssh_user: String,
    /// Rescue password supplied by the operator. Wins over API passwords.
    pub ssh_password_override: Option<String>,
    /// Talos API connection attempts per tick.
    pub talos_probe_attempts: u32,
    /// Do not issue the reset that boots into the rescue system.
    pub skip_reboot: bool,
    /// Enable the rescue system even if it is already active (new password).
    pub force_rescue: bool,
}

impl Default for ProvisionConfig {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            tick_interval: DEFAULT_TICK_INTERVAL,
            ssh_port: 22,
            ssh_user: "root".to_string(),
            ssh_password_override: None,
            talos_probe_attempts: DEFAULT_TALOS_PROBE_ATTEMPTS,
            skip_reboot: false,
            force_rescue: false,
        }
    }
}

impl std::fmt::Debug for ProvisionConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProvisionConfig")
            .field("max_retries", &self.max_retries)
            .field("tick_interval", &self.tick_interval)
            .field("ssh_port", &self.ssh_port)
            .field("ssh_user", &self.ssh_user)
            .field(
                "ssh_password_override",
                &self.ssh_password_override.as_ref().map(|_| "<redacted>"),
            )
            .field("talos_probe_attempts", &self.talos_probe_attempts)
            .field("skip_reboot", &self.skip_reboot)
            .field("force_rescue", &self.force_rescue)
            .finish()
    }
}

impl ProvisionConfig {
    /// Set the per-state retry ceiling.
    #[must_use]
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Set the delay between ticks.
    #[must_use]
    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval;
        self
    }

    /// Set the operator supplied rescue password. Empty means none.
    #[must_use]
    pub fn with_ssh_password_override(mut self, password: Option<String>) -> Self {
        self.ssh_password_override = password.filter(|p| !p.is_empty());
        self
    }

    /// Set Talos API connection attempts per tick.
    #[must_use]
    pub fn with_talos_probe_attempts(mut self, attempts: u32) -> Self {
        self.talos_probe_attempts = attempts;
        self
    }

    #[must_use]
    pub fn with_skip_reboot(mut self, skip: bool) -> Self {
        self.skip_reboot = skip;
        self
    }

    #[must_use]
    pub fn with_force_rescue(mut self, force: bool) -> Self {
        self.force_rescue = force;
        self
    }

    /// Ceiling for reboot tolerant states.
    #[must_use]
    pub fn extended_max_retries(&self) -> u32 {
        self.max_retries.saturating_mul(2)
    }

    /// Reject configurations the state machine cannot run with.
    ///
    /// # Errors
    /// Returns [`ProvisionError::InvalidConfig`] if `max_retries` is zero.
    pub fn validate(&self) -> Result<(), ProvisionError> {
        if self.max_retries == 0 {
            return Err(ProvisionError::InvalidConfig(
                "max_retries must be positive".to_string(),
            ));
        }
        Ok(())
    }
}
