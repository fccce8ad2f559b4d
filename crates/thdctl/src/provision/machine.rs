//! Provisioning state machine: transition loop and per-state handlers.

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{
    ProvisionConfig, ProvisionError, ProvisionObserver, ProvisioningState, ServerDescriptor,
    TracingObserver,
};
use crate::robot::{RescueDetails, RobotApi};
use crate::ssh::{log_disks, parse_lsblk_output, RemoteExec};
use crate::talos::ServiceProbe;

/// Mutable session data of one run.
#[derive(Debug)]
struct RunState {
    state: ProvisioningState,
    /// Consecutive ticks without a state change.
    retries: u32,
    max_retries: u32,
    /// Resets issued because the rescue system did not come up.
    forced_reboots: u32,
    /// Last rescue password returned by the Robot API.
    last_ssh_password: Option<String>,
}

/// Drives one server from an unknown state to a reachable Talos API.
pub struct StateMachine<A, S, P> {
    api: A,
    ssh: S,
    probe: P,
    server: ServerDescriptor,
    config: ProvisionConfig,
    observer: Box<dyn ProvisionObserver>,
    cancel: CancellationToken,
    run: RunState,
}

impl<A, S, P> StateMachine<A, S, P>
where
    A: RobotApi,
    S: RemoteExec,
    P: ServiceProbe,
{
    /// Create a state machine starting in [`ProvisioningState::Unknown`].
    pub fn new(
        api: A,
        ssh: S,
        probe: P,
        server: ServerDescriptor,
        config: ProvisionConfig,
    ) -> Self {
        let max_retries = config.max_retries;
        Self {
            api,
            ssh,
            probe,
            server,
            config,
            observer: Box::new(TracingObserver),
            cancel: CancellationToken::new(),
            run: RunState {
                state: ProvisioningState::Unknown,
                retries: 0,
                max_retries,
                forced_reboots: 0,
                last_ssh_password: None,
            },
        }
    }

    /// Report events to `observer` instead of the log.
    #[must_use]
    pub fn with_observer(mut self, observer: Box<dyn ProvisionObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// Stop the run when `token` is cancelled.
    #[must_use]
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Start from `state` instead of resolving it.
    #[must_use]
    pub fn with_start_state(mut self, state: ProvisioningState) -> Self {
        self.run.state = state;
        self
    }

    /// Current state.
    pub fn state(&self) -> ProvisioningState {
        self.run.state
    }

    /// Ticks spent in the current state without progress.
    pub fn retries(&self) -> u32 {
        self.run.retries
    }

    /// Run until the Talos API is reachable.
    ///
    /// Each tick runs the handler of the current state and waits
    /// `tick_interval`. A state that makes no progress for `max_retries`
    /// ticks ends the run; reboot tolerant states get `2 × max_retries`.
    /// While the state stays [`ProvisioningState::Unknown`] for
    /// `2 × max_retries − 1` ticks the server is assumed to be unprovisioned
    /// and the machine continues from [`ProvisioningState::Uninitialized`].
    /// At most `max_retries` resets are forced from
    /// [`ProvisioningState::WaitForReboot`].
    ///
    /// Cancellation is observed while a handler is running as well as
    /// between ticks.
    ///
    /// # Errors
    /// Returns the [`ProvisionError`] that ended the run: a terminal failure
    /// state, an exhausted retry ceiling, or cancellation.
    pub async fn run(&mut self) -> Result<(), ProvisionError> {
        self.config.validate()?;
        let extended_max_retries = self.config.extended_max_retries();

        info!(
            server_number = self.server.server_number(),
            disk = %self.server.disk(),
            state = %self.run.state,
            max_retries = self.run.max_retries,
            "Starting provisioning"
        );

        loop {
            let state = self.run.state;
            if state.is_success() {
                info!(server_number = self.server.server_number(), "Talos API is available");
                return Ok(());
            }
            if state.is_failure() {
                return Err(ProvisionError::Terminal(state));
            }

            let retries = self.run.retries;
            if (retries >= self.run.max_retries && !state.is_reboot_tolerant())
                || retries >= extended_max_retries
            {
                return Err(ProvisionError::RetriesExhausted { state, retries });
            }
            if self.cancel.is_cancelled() {
                return Err(ProvisionError::Cancelled(state));
            }

            self.observer.tick(state, retries);
            let cancel = self.cancel.clone();
            let mut next = tokio::select! {
                () = cancel.cancelled() => {
                    return Err(ProvisionError::Cancelled(state));
                }
                next = self.dispatch(state) => next?,
            };

            if state == ProvisioningState::WaitForReboot
                && next == ProvisioningState::RequiresReboot
            {
                self.run.forced_reboots += 1;
                if self.run.forced_reboots > self.run.max_retries {
                    return Err(ProvisionError::RetriesExhausted {
                        state,
                        retries: self.run.max_retries,
                    });
                }
            }

            if state == ProvisioningState::Unknown
                && next == ProvisioningState::Unknown
                && retries == extended_max_retries - 1
            {
                warn!(
                    retries,
                    "Server state still unknown, assuming it is not provisioned"
                );
                next = ProvisioningState::Uninitialized;
            }
            self.transition(next);

            if next.is_terminal() {
                continue;
            }

            tokio::select! {
                () = self.cancel.cancelled() => {
                    return Err(ProvisionError::Cancelled(self.run.state));
                }
                () = tokio::time::sleep(self.config.tick_interval) => {}
            }
        }
    }

    /// Apply a handler's result. A changed state resets the retry counter.
    fn transition(&mut self, next: ProvisioningState) {
        if next == self.run.state {
            self.run.retries += 1;
            return;
        }
        self.observer.state_changed(self.run.state, next);
        self.run.state = next;
        self.run.retries = 0;
    }

    async fn dispatch(
        &mut self,
        state: ProvisioningState,
    ) -> Result<ProvisioningState, ProvisionError> {
        let next = match state {
            ProvisioningState::Unknown => self.determine_status().await,
            ProvisioningState::Uninitialized => self.initialize().await,
            ProvisioningState::RescueModeInitiated => self.check_rescue_mode().await,
            ProvisioningState::RequiresReboot => self.reboot().await,
            ProvisioningState::WaitForReboot => self.check_ssh().await,
            ProvisioningState::SshAvailable => self.install_image().await,
            ProvisioningState::TalosImageInstalled => self.check_talos_api().await,
            ProvisioningState::TalosApiAvailable
            | ProvisioningState::ServerNotFound
            | ProvisioningState::MissingServerNumber
            | ProvisioningState::RobotApiUnavailable => {
                return Err(ProvisionError::UnhandledState(state));
            }
        };
        Ok(next)
    }

    /// Work out where an existing server stands.
    async fn determine_status(&mut self) -> ProvisioningState {
        let server_number = self.server.server_number();
        if server_number == 0 {
            return ProvisioningState::MissingServerNumber;
        }
        if self.config.force_rescue {
            info!(server_number, "Re-entering rescue system as requested");
            return ProvisioningState::Uninitialized;
        }

        let rescue = match self.api.get_rescue(server_number).await {
            Ok(rescue) => rescue,
            Err(e) if e.is_not_found() => return ProvisioningState::ServerNotFound,
            Err(e) => {
                warn!(server_number, error = %e, "Could not determine rescue system status");
                return ProvisioningState::Unknown;
            }
        };

        if !rescue.active {
            return ProvisioningState::Uninitialized;
        }

        self.configure_ssh(&rescue);
        match self.ssh.establish_session().await {
            Ok(()) => ProvisioningState::SshAvailable,
            Err(e) => {
                debug!(server_number, error = %e, "Rescue system armed but not reachable");
                ProvisioningState::RescueModeInitiated
            }
        }
    }

    async fn initialize(&mut self) -> ProvisioningState {
        let server_number = self.server.server_number();
        if server_number == 0 {
            return ProvisioningState::MissingServerNumber;
        }

        match self.api.enable_rescue(server_number).await {
            Ok(rescue) => {
                if let Some(password) = rescue.password() {
                    self.run.last_ssh_password = Some(password.to_string());
                }
                ProvisioningState::RequiresReboot
            }
            Err(e) => {
                error!(server_number, error = %e, "Rescue system state is not available");
                ProvisioningState::Uninitialized
            }
        }
    }

    async fn check_rescue_mode(&mut self) -> ProvisioningState {
        let server_number = self.server.server_number();
        match self.api.get_rescue(server_number).await {
            Ok(rescue) if rescue.active => ProvisioningState::RequiresReboot,
            Ok(_) => ProvisioningState::RescueModeInitiated,
            Err(e) if e.is_not_found() => ProvisioningState::ServerNotFound,
            Err(e) => {
                error!(server_number, error = %e, "Error getting rescue system status");
                ProvisioningState::RobotApiUnavailable
            }
        }
    }

    async fn reboot(&mut self) -> ProvisioningState {
        let server_number = self.server.server_number();
        if self.config.skip_reboot {
            info!(server_number, "Skipping reset, reboot the server into the rescue system manually");
        } else if let Err(e) = self.api.reset_server(server_number).await {
            // SSH availability is the real check.
            warn!(server_number, error = %e, "Reset request failed");
        }
        ProvisioningState::WaitForReboot
    }

    async fn check_ssh(&mut self) -> ProvisioningState {
        let server_number = self.server.server_number();
        let rescue = match self.api.get_rescue(server_number).await {
            Ok(rescue) => rescue,
            Err(e) => {
                error!(server_number, error = %e, "Error getting rescue system status");
                return ProvisioningState::RobotApiUnavailable;
            }
        };

        self.configure_ssh(&rescue);
        match self.ssh.establish_session().await {
            Ok(()) => return ProvisioningState::SshAvailable,
            Err(e) if e.is_timeout() => {
                warn!(host = %rescue.server_ip, error = %e, "Timeout while establishing SSH session");
            }
            Err(e) => {
                error!(host = %rescue.server_ip, error = %e, "SSH not available");
            }
        }

        if rescue.active && self.run.retries + 1 >= self.run.max_retries {
            warn!(server_number, retries = self.run.retries, "Rescue system did not come up, resetting again");
            return ProvisioningState::RequiresReboot;
        }
        ProvisioningState::WaitForReboot
    }

    async fn install_image(&mut self) -> ProvisioningState {
        if self.server.has_conflicting_image() {
            warn!("Both version and image are set. Using image definition.");
        }
        let url = self.server.image().download_url();
        let disk = self.server.disk();

        info!(url = %url, "Downloading Talos image");
        if let Err(e) = self.ssh.download_image(&url).await {
            error!(error = %e, output = e.output().unwrap_or_default(), "Failed to download image");
            return ProvisioningState::SshAvailable;
        }

        info!(disk = %disk, "Writing Talos image to disk");
        if let Err(e) = self.ssh.install_image(disk).await {
            error!(disk = %disk, error = %e, output = e.output().unwrap_or_default(), "Failed to install image");
            self.log_disk_diagnostics().await;
            return ProvisioningState::SshAvailable;
        }

        let server_number = self.server.server_number();
        if let Err(e) = self.api.reset_server(server_number).await {
            warn!(server_number, error = %e, "Reset into Talos failed");
        }
        ProvisioningState::TalosImageInstalled
    }

    async fn check_talos_api(&mut self) -> ProvisioningState {
        let server_number = self.server.server_number();
        let rescue = match self.api.get_rescue(server_number).await {
            Ok(rescue) => rescue,
            Err(e) => {
                error!(server_number, error = %e, "Error getting rescue system status");
                return ProvisioningState::RobotApiUnavailable;
            }
        };

        match self
            .probe
            .check(&rescue.server_ip, self.config.talos_probe_attempts)
            .await
        {
            Ok(()) => ProvisioningState::TalosApiAvailable,
            Err(e) => {
                warn!(host = %rescue.server_ip, error = %e, "Talos API not available");
                ProvisioningState::TalosImageInstalled
            }
        }
    }

    /// Log what the rescue system sees so the operator can pick the right disk.
    async fn log_disk_diagnostics(&self) {
        let disk = self.server.disk();
        if let Err(e) = self.ssh.verify_disk_exists(disk).await {
            error!(disk = %disk, error = %e, "Target disk not found");
        }

        match self.ssh.list_disks().await {
            Ok(output) => {
                error!(output = %output, "Available disks");
                log_disks(&parse_lsblk_output(&output));
            }
            Err(e) => error!(error = %e, "Failed to list disks"),
        }
    }

    /// Point the SSH client at the rescue system.
    fn configure_ssh(&mut self, rescue: &RescueDetails) {
        if let Some(password) = rescue.password() {
            self.run.last_ssh_password = Some(password.to_string());
        }
        let password = self.ssh_password();
        self.ssh.set_target_host(&rescue.server_ip, self.config.ssh_port);
        self.ssh.auth(&self.config.ssh_user, &password);
    }

    /// Operator override, then the last password from the Robot API.
    fn ssh_password(&self) -> String {
        self.config
            .ssh_password_override
            .clone()
            .or_else(|| self.run.last_ssh_password.clone())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use std::io;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use super::*;
    use crate::robot::{MockRobotApi, RobotError};
    use crate::ssh::{MockRemoteExec, SshError};
    use crate::talos::{MockServiceProbe, ProbeError};

    type Machine = StateMachine<MockRobotApi, MockRemoteExec, MockServiceProbe>;

    #[derive(Clone, Default)]
    struct Recorder(Arc<Mutex<Vec<ProvisioningState>>>);

    impl Recorder {
        fn states(&self) -> Vec<ProvisioningState> {
            self.0.lock().unwrap().clone()
        }
    }

    impl ProvisionObserver for Recorder {
        fn state_changed(&self, _from: ProvisioningState, to: ProvisioningState) {
            self.0.lock().unwrap().push(to);
        }
    }

    fn rescue(active: bool, password: Option<&str>) -> RescueDetails {
        RescueDetails {
            server_ip: "192.0.2.10".to_string(),
            server_number: 12345,
            active,
            password: password.map(str::to_string),
            ..RescueDetails::default()
        }
    }

    fn api_down() -> RobotError {
        RobotError::Api {
            status: 503,
            code: String::new(),
            message: "maintenance".to_string(),
        }
    }

    fn ssh_timeout() -> SshError {
        SshError::Connect {
            addr: "192.0.2.10:22".to_string(),
            source: io::Error::new(io::ErrorKind::TimedOut, "i/o timeout"),
        }
    }

    fn command_failed(command: &str) -> SshError {
        SshError::Command {
            command: command.to_string(),
            status: 1,
            output: "failed".to_string(),
        }
    }

    /// SSH mock that accepts any target and credentials.
    fn ssh_target() -> MockRemoteExec {
        let mut ssh = MockRemoteExec::new();
        ssh.expect_set_target_host().returning(|_, _| ());
        ssh.expect_auth().returning(|_, _| ());
        ssh
    }

    fn config(max_retries: u32) -> ProvisionConfig {
        ProvisionConfig::default()
            .with_max_retries(max_retries)
            .with_tick_interval(Duration::ZERO)
    }

    fn machine(
        api: MockRobotApi,
        ssh: MockRemoteExec,
        probe: MockServiceProbe,
        config: ProvisionConfig,
    ) -> (Machine, Recorder) {
        let recorder = Recorder::default();
        let server = ServerDescriptor::new(12345, "sda").with_talos_version("v1.9.2");
        let machine = StateMachine::new(api, ssh, probe, server, config)
            .with_observer(Box::new(recorder.clone()));
        (machine, recorder)
    }

    #[tokio::test]
    async fn test_happy_path() {
        let mut api = MockRobotApi::new();
        let mut rescue_calls = 0;
        api.expect_get_rescue().returning(move |_| {
            rescue_calls += 1;
            Ok(rescue(rescue_calls > 1, None))
        });
        api.expect_enable_rescue()
            .times(1)
            .returning(|_| Ok(rescue(true, Some("rescue-pw"))));
        api.expect_reset_server().times(2).returning(|_| Ok(()));

        let mut ssh = MockRemoteExec::new();
        ssh.expect_set_target_host()
            .withf(|host, port| host == "192.0.2.10" && *port == 22)
            .returning(|_, _| ());
        ssh.expect_auth()
            .withf(|user, password| user == "root" && password == "rescue-pw")
            .returning(|_, _| ());
        ssh.expect_establish_session().times(1).returning(|| Ok(()));
        ssh.expect_download_image()
            .withf(|url| {
                url == "https://github.com/siderolabs/talos/releases/download/v1.9.2/metal-amd64.raw.zst"
            })
            .times(1)
            .returning(|_| Ok(String::new()));
        ssh.expect_install_image()
            .withf(|disk| disk == "sda")
            .times(1)
            .returning(|_| Ok(String::new()));

        let mut probe = MockServiceProbe::new();
        probe
            .expect_check()
            .withf(|host, attempts| host == "192.0.2.10" && *attempts == 5)
            .times(1)
            .returning(|_, _| Ok(()));

        let (mut machine, recorder) = machine(api, ssh, probe, config(3));
        assert_eq!(machine.run().await, Ok(()));
        assert_eq!(
            recorder.states(),
            vec![
                ProvisioningState::Uninitialized,
                ProvisioningState::RequiresReboot,
                ProvisioningState::WaitForReboot,
                ProvisioningState::SshAvailable,
                ProvisioningState::TalosImageInstalled,
                ProvisioningState::TalosApiAvailable,
            ]
        );
        assert_eq!(machine.state(), ProvisioningState::TalosApiAvailable);
    }

    #[tokio::test]
    async fn test_rescue_query_not_found() {
        let mut api = MockRobotApi::new();
        api.expect_get_rescue()
            .times(1)
            .returning(|_| Err(RobotError::NotFound("Server not found".to_string())));

        let (machine, _) = machine(api, MockRemoteExec::new(), MockServiceProbe::new(), config(3));
        let mut machine = machine.with_start_state(ProvisioningState::RescueModeInitiated);

        let err = machine.run().await.unwrap_err();
        assert_eq!(err, ProvisionError::Terminal(ProvisioningState::ServerNotFound));
        assert!(err.to_string().contains("ServerNotFound"));
    }

    #[tokio::test]
    async fn test_rescue_query_failure_is_terminal() {
        let mut api = MockRobotApi::new();
        api.expect_get_rescue().times(1).returning(|_| Err(api_down()));

        let (machine, _) = machine(api, MockRemoteExec::new(), MockServiceProbe::new(), config(3));
        let mut machine = machine.with_start_state(ProvisioningState::RescueModeInitiated);

        assert_eq!(
            machine.run().await,
            Err(ProvisionError::Terminal(ProvisioningState::RobotApiUnavailable))
        );
    }

    #[tokio::test]
    async fn test_download_failure_exhausts_retries() {
        let mut ssh = MockRemoteExec::new();
        ssh.expect_download_image()
            .times(3)
            .returning(|_| Err(command_failed("wget")));

        let (machine, recorder) = machine(MockRobotApi::new(), ssh, MockServiceProbe::new(), config(3));
        let mut machine = machine.with_start_state(ProvisioningState::SshAvailable);

        let err = machine.run().await.unwrap_err();
        assert_eq!(
            err,
            ProvisionError::RetriesExhausted {
                state: ProvisioningState::SshAvailable,
                retries: 3,
            }
        );
        assert!(err.to_string().contains("SSHAvailable"));
        assert!(recorder.states().is_empty());
    }

    #[tokio::test]
    async fn test_ceiling_for_normal_states() {
        for max_retries in 1..=4 {
            let mut api = MockRobotApi::new();
            api.expect_get_rescue()
                .times(max_retries as usize)
                .returning(|_| Ok(rescue(false, None)));

            let (machine, _) =
                machine(api, MockRemoteExec::new(), MockServiceProbe::new(), config(max_retries));
            let mut machine = machine.with_start_state(ProvisioningState::RescueModeInitiated);

            assert_eq!(
                machine.run().await,
                Err(ProvisionError::RetriesExhausted {
                    state: ProvisioningState::RescueModeInitiated,
                    retries: max_retries,
                })
            );
        }
    }

    #[tokio::test]
    async fn test_extended_ceiling_for_reboot_tolerant_states() {
        for max_retries in 1..=4 {
            let mut api = MockRobotApi::new();
            api.expect_get_rescue().returning(|_| Ok(rescue(true, None)));

            let mut probe = MockServiceProbe::new();
            probe
                .expect_check()
                .times(2 * max_retries as usize)
                .returning(|host, attempts| {
                    Err(ProbeError::Timeout {
                        addr: format!("{host}:50000"),
                        attempts,
                    })
                });

            let (machine, _) =
                machine(api, MockRemoteExec::new(), probe, config(max_retries));
            let mut machine = machine.with_start_state(ProvisioningState::TalosImageInstalled);

            assert_eq!(
                machine.run().await,
                Err(ProvisionError::RetriesExhausted {
                    state: ProvisioningState::TalosImageInstalled,
                    retries: 2 * max_retries,
                })
            );
        }
    }

    #[tokio::test]
    async fn test_wait_for_reboot_uses_extended_ceiling() {
        let mut api = MockRobotApi::new();
        // Rescue already booted, so no forced reset.
        api.expect_get_rescue().returning(|_| Ok(rescue(false, None)));

        let mut ssh = ssh_target();
        ssh.expect_establish_session()
            .times(4)
            .returning(|| Err(ssh_timeout()));

        let (machine, _) = machine(api, ssh, MockServiceProbe::new(), config(2));
        let mut machine = machine.with_start_state(ProvisioningState::WaitForReboot);

        assert_eq!(
            machine.run().await,
            Err(ProvisionError::RetriesExhausted {
                state: ProvisioningState::WaitForReboot,
                retries: 4,
            })
        );
    }

    #[tokio::test]
    async fn test_terminal_states_end_run_without_handlers() {
        for state in [
            ProvisioningState::ServerNotFound,
            ProvisioningState::MissingServerNumber,
            ProvisioningState::RobotApiUnavailable,
        ] {
            let (machine, recorder) = machine(
                MockRobotApi::new(),
                MockRemoteExec::new(),
                MockServiceProbe::new(),
                config(1),
            );
            let mut machine = machine.with_start_state(state);

            assert_eq!(machine.run().await, Err(ProvisionError::Terminal(state)));
            assert!(recorder.states().is_empty());
        }
    }

    #[tokio::test]
    async fn test_success_state_ends_run() {
        let (machine, _) = machine(
            MockRobotApi::new(),
            MockRemoteExec::new(),
            MockServiceProbe::new(),
            config(1),
        );
        let mut machine = machine.with_start_state(ProvisioningState::TalosApiAvailable);

        assert_eq!(machine.run().await, Ok(()));
    }

    #[tokio::test]
    async fn test_success_after_exhausting_normal_ceiling() {
        let mut api = MockRobotApi::new();
        api.expect_get_rescue().returning(|_| Ok(rescue(false, None)));

        let mut probe = MockServiceProbe::new();
        let mut checks = 0;
        probe.expect_check().times(3).returning(move |host, attempts| {
            checks += 1;
            if checks < 3 {
                Err(ProbeError::Timeout {
                    addr: format!("{host}:50000"),
                    attempts,
                })
            } else {
                Ok(())
            }
        });

        let (machine, recorder) = machine(api, MockRemoteExec::new(), probe, config(2));
        let mut machine = machine.with_start_state(ProvisioningState::TalosImageInstalled);

        assert_eq!(machine.run().await, Ok(()));
        assert_eq!(machine.state(), ProvisioningState::TalosApiAvailable);
        assert_eq!(recorder.states(), vec![ProvisioningState::TalosApiAvailable]);
    }

    #[tokio::test]
    async fn test_forced_reboots_are_bounded() {
        let mut api = MockRobotApi::new();
        api.expect_get_rescue().returning(|_| Ok(rescue(true, None)));
        let resets = Arc::new(Mutex::new(0));
        let counted = Arc::clone(&resets);
        api.expect_reset_server().returning(move |_| {
            *counted.lock().unwrap() += 1;
            Ok(())
        });

        let mut ssh = ssh_target();
        ssh.expect_establish_session().returning(|| Err(ssh_timeout()));

        let (machine, _) = machine(api, ssh, MockServiceProbe::new(), config(2));
        let mut machine = machine.with_start_state(ProvisioningState::WaitForReboot);

        let result = tokio::time::timeout(Duration::from_secs(5), machine.run())
            .await
            .expect("run terminates");
        assert_eq!(
            result,
            Err(ProvisionError::RetriesExhausted {
                state: ProvisioningState::WaitForReboot,
                retries: 2,
            })
        );
        assert_eq!(*resets.lock().unwrap(), 2);
    }

    /// Probe that never answers, like a stalled remote call.
    struct StalledProbe;

    #[async_trait::async_trait]
    impl ServiceProbe for StalledProbe {
        async fn check(&self, _host: &str, _attempts: u32) -> Result<(), ProbeError> {
            std::future::pending().await
        }
    }

    #[tokio::test]
    async fn test_cancelled_while_handler_runs() {
        let mut api = MockRobotApi::new();
        api.expect_get_rescue().times(1).returning(|_| Ok(rescue(false, None)));

        let token = CancellationToken::new();
        let server = ServerDescriptor::new(12345, "sda");
        let mut machine = StateMachine::new(
            api,
            MockRemoteExec::new(),
            StalledProbe,
            server,
            config(3),
        )
        .with_start_state(ProvisioningState::TalosImageInstalled)
        .with_cancellation(token.clone());

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            token.cancel();
        });

        let result = tokio::time::timeout(Duration::from_secs(5), machine.run())
            .await
            .expect("cancellation interrupts the handler");
        assert_eq!(
            result,
            Err(ProvisionError::Cancelled(ProvisioningState::TalosImageInstalled))
        );
        assert_eq!(machine.retries(), 0);
    }

    #[tokio::test]
    async fn test_unknown_recovers_to_uninitialized() {
        let mut api = MockRobotApi::new();
        api.expect_get_rescue().times(4).returning(|_| Err(api_down()));
        api.expect_enable_rescue().times(4).returning(|_| Err(api_down()));

        let (mut machine, recorder) =
            machine(api, MockRemoteExec::new(), MockServiceProbe::new(), config(2));

        assert_eq!(
            machine.run().await,
            Err(ProvisionError::RetriesExhausted {
                state: ProvisioningState::Uninitialized,
                retries: 4,
            })
        );
        assert_eq!(recorder.states(), vec![ProvisioningState::Uninitialized]);
    }

    #[tokio::test]
    async fn test_missing_server_number() {
        let server = ServerDescriptor::new(0, "sda");
        let mut machine = StateMachine::new(
            MockRobotApi::new(),
            MockRemoteExec::new(),
            MockServiceProbe::new(),
            server,
            config(3),
        );

        assert_eq!(
            machine.run().await,
            Err(ProvisionError::Terminal(ProvisioningState::MissingServerNumber))
        );
    }

    #[tokio::test]
    async fn test_armed_rescue_without_ssh_triggers_reboot() {
        let mut api = MockRobotApi::new();
        api.expect_get_rescue().returning(|_| Ok(rescue(true, None)));
        api.expect_reset_server().times(1).returning(|_| Ok(()));

        let mut ssh = ssh_target();
        let mut attempts = 0;
        ssh.expect_establish_session().returning(move || {
            attempts += 1;
            if attempts == 1 {
                Err(SshError::Auth("root".to_string()))
            } else {
                Ok(())
            }
        });
        ssh.expect_download_image()
            .times(1)
            .returning(|_| Err(command_failed("wget")));

        let (mut machine, recorder) = machine(api, ssh, MockServiceProbe::new(), config(1));

        let err = machine.run().await.unwrap_err();
        assert_eq!(err.state(), Some(ProvisioningState::SshAvailable));
        assert_eq!(
            recorder.states(),
            vec![
                ProvisioningState::RescueModeInitiated,
                ProvisioningState::RequiresReboot,
                ProvisioningState::WaitForReboot,
                ProvisioningState::SshAvailable,
            ]
        );
    }

    #[tokio::test]
    async fn test_hung_boot_forces_reboot() {
        let mut api = MockRobotApi::new();
        api.expect_get_rescue().returning(|_| Ok(rescue(true, None)));
        api.expect_reset_server().times(2).returning(|_| Ok(()));

        let mut ssh = ssh_target();
        let mut attempts = 0;
        ssh.expect_establish_session().returning(move || {
            attempts += 1;
            if attempts <= 3 {
                Err(ssh_timeout())
            } else {
                Ok(())
            }
        });
        ssh.expect_download_image().returning(|_| Ok(String::new()));
        ssh.expect_install_image().returning(|_| Ok(String::new()));

        let mut probe = MockServiceProbe::new();
        probe.expect_check().returning(|_, _| Ok(()));

        let (machine, recorder) = machine(api, ssh, probe, config(3));
        let mut machine = machine.with_start_state(ProvisioningState::WaitForReboot);

        assert_eq!(machine.run().await, Ok(()));
        assert_eq!(
            recorder.states(),
            vec![
                ProvisioningState::RequiresReboot,
                ProvisioningState::WaitForReboot,
                ProvisioningState::SshAvailable,
                ProvisioningState::TalosImageInstalled,
                ProvisioningState::TalosApiAvailable,
            ]
        );
    }

    #[tokio::test]
    async fn test_install_failure_logs_disks_and_retries() {
        let mut ssh = MockRemoteExec::new();
        ssh.expect_download_image().times(2).returning(|_| Ok(String::new()));
        ssh.expect_install_image()
            .times(2)
            .returning(|_| Err(command_failed("zstdcat")));
        ssh.expect_verify_disk_exists()
            .withf(|disk| disk == "sda")
            .times(2)
            .returning(|_| Err(command_failed("lsblk /dev/sda")));
        ssh.expect_list_disks().times(2).returning(|| {
            Ok("NAME MAJ:MIN RM SIZE RO TYPE MOUNTPOINTS\nnvme0n1 259:0 0 476.9G 0 disk\n".to_string())
        });

        let (machine, _) = machine(MockRobotApi::new(), ssh, MockServiceProbe::new(), config(2));
        let mut machine = machine.with_start_state(ProvisioningState::SshAvailable);

        assert_eq!(
            machine.run().await,
            Err(ProvisionError::RetriesExhausted {
                state: ProvisioningState::SshAvailable,
                retries: 2,
            })
        );
    }

    #[tokio::test]
    async fn test_image_url_is_downloaded() {
        let mut ssh = MockRemoteExec::new();
        ssh.expect_download_image()
            .withf(|url| url == "https://factory.talos.dev/image/abc/v1.9.2/metal-amd64.raw.zst")
            .times(1)
            .returning(|_| Err(command_failed("wget")));

        let server = ServerDescriptor::new(12345, "nvme0n1")
            .with_talos_version("v1.9.2")
            .with_image_url("https://factory.talos.dev/image/abc/v1.9.2/metal-amd64.raw.zst");
        let mut machine = StateMachine::new(
            MockRobotApi::new(),
            ssh,
            MockServiceProbe::new(),
            server,
            config(1),
        )
        .with_start_state(ProvisioningState::SshAvailable);

        assert!(machine.run().await.is_err());
    }

    #[tokio::test]
    async fn test_skip_reboot_does_not_reset() {
        let api = MockRobotApi::new();
        let (machine, _) = machine(
            api,
            MockRemoteExec::new(),
            MockServiceProbe::new(),
            config(1).with_skip_reboot(true),
        );
        let mut machine = machine.with_start_state(ProvisioningState::RequiresReboot);

        assert_eq!(machine.reboot().await, ProvisioningState::WaitForReboot);
    }

    #[tokio::test]
    async fn test_force_rescue_skips_status_query() {
        let (mut machine, _) = machine(
            MockRobotApi::new(),
            MockRemoteExec::new(),
            MockServiceProbe::new(),
            config(1).with_force_rescue(true),
        );

        assert_eq!(
            machine.determine_status().await,
            ProvisioningState::Uninitialized
        );
    }

    #[tokio::test]
    async fn test_dispatch_rejects_terminal_states() {
        let (mut machine, _) = machine(
            MockRobotApi::new(),
            MockRemoteExec::new(),
            MockServiceProbe::new(),
            config(1),
        );

        for state in ProvisioningState::ALL.into_iter().filter(|s| s.is_terminal()) {
            assert_eq!(
                machine.dispatch(state).await,
                Err(ProvisionError::UnhandledState(state))
            );
        }
    }

    #[test]
    fn test_password_precedence() {
        let (mut machine, _) = machine(
            MockRobotApi::new(),
            ssh_target(),
            MockServiceProbe::new(),
            config(1),
        );
        assert_eq!(machine.ssh_password(), "");

        machine.run.last_ssh_password = Some("cached".to_string());
        machine.configure_ssh(&rescue(true, None));
        assert_eq!(machine.ssh_password(), "cached");

        machine.configure_ssh(&rescue(true, Some("from-api")));
        assert_eq!(machine.ssh_password(), "from-api");

        machine.config = machine
            .config
            .clone()
            .with_ssh_password_override(Some("operator".to_string()));
        machine.configure_ssh(&rescue(true, Some("newer-from-api")));
        assert_eq!(machine.ssh_password(), "operator");
        assert_eq!(
            machine.run.last_ssh_password.as_deref(),
            Some("newer-from-api")
        );
    }

    #[test]
    fn test_override_reaches_ssh_client() {
        let mut ssh = MockRemoteExec::new();
        ssh.expect_set_target_host().returning(|_, _| ());
        ssh.expect_auth()
            .withf(|user, password| user == "root" && password == "operator")
            .times(1)
            .returning(|_, _| ());

        let (mut machine, _) = machine(
            MockRobotApi::new(),
            ssh,
            MockServiceProbe::new(),
            config(1).with_ssh_password_override(Some("operator".to_string())),
        );
        machine.configure_ssh(&rescue(true, Some("from-api")));
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let token = CancellationToken::new();
        token.cancel();

        let (machine, _) = machine(
            MockRobotApi::new(),
            MockRemoteExec::new(),
            MockServiceProbe::new(),
            config(3),
        );
        let mut machine = machine.with_cancellation(token);

        assert_eq!(
            machine.run().await,
            Err(ProvisionError::Cancelled(ProvisioningState::Unknown))
        );
    }

    #[tokio::test]
    async fn test_cancelled_during_wait() {
        let mut api = MockRobotApi::new();
        api.expect_get_rescue().times(1).returning(|_| Err(api_down()));

        let token = CancellationToken::new();
        let (machine, _) = machine(
            api,
            MockRemoteExec::new(),
            MockServiceProbe::new(),
            config(3).with_tick_interval(Duration::from_secs(3600)),
        );
        let mut machine = machine.with_cancellation(token.clone());

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            token.cancel();
        });

        assert_eq!(
            machine.run().await,
            Err(ProvisionError::Cancelled(ProvisioningState::Unknown))
        );
        assert_eq!(machine.retries(), 1);
    }

    #[tokio::test]
    async fn test_zero_retries_rejected() {
        let (mut machine, _) = machine(
            MockRobotApi::new(),
            MockRemoteExec::new(),
            MockServiceProbe::new(),
            config(0),
        );

        assert!(matches!(
            machine.run().await,
            Err(ProvisionError::InvalidConfig(_))
        ));
    }
}
