//! Single server provisioning state machine.
//!
//! The machine starts in [`ProvisioningState::Unknown`] and walks the server
//! through the rescue system into Talos:
//!
//! ```text
//! Unknown -> Uninitialized -> RequiresReboot -> WaitForReboot
//!         -> SSHAvailable -> TalosImageInstalled -> TalosAPIAvailable
//! ```
//!
//! Each state tolerates a bounded number of ticks without progress; see
//! [`StateMachine::run`].

mod config;
mod machine;
mod observer;
mod state;

use thiserror::Error;

pub use config::{
    ProvisionConfig, DEFAULT_MAX_RETRIES, DEFAULT_TALOS_PROBE_ATTEMPTS, DEFAULT_TICK_INTERVAL,
};
pub use machine::StateMachine;
pub use observer::{ProvisionObserver, TracingObserver};
pub use state::{ProvisioningState, ServerDescriptor, UnknownStateError};

/// Why a provisioning run ended without reaching the Talos API.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ProvisionError {
    /// A state made no progress within its retry ceiling.
    #[error("max retries reached for state: {state} ({retries} attempts)")]
    RetriesExhausted {
        state: ProvisioningState,
        retries: u32,
    },

    /// An unrecoverable state was entered.
    #[error("failed to reach a valid state: {0}")]
    Terminal(ProvisioningState),

    /// A state reached the dispatcher without a handler.
    #[error("no handler for state: {0}")]
    UnhandledState(ProvisioningState),

    /// The run was cancelled.
    #[error("provisioning cancelled in state: {0}")]
    Cancelled(ProvisioningState),

    /// The configuration cannot be run.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl ProvisionError {
    /// State the run ended in, if any.
    #[must_use]
    pub fn state(&self) -> Option<ProvisioningState> {
        match self {
            Self::RetriesExhausted { state, .. }
            | Self::Terminal(state)
            | Self::UnhandledState(state)
            | Self::Cancelled(state) => Some(*state),
            Self::InvalidConfig(_) => None,
        }
    }
}
