//! Observation of state machine progress.

use tracing::{debug, info};

use super::ProvisioningState;

/// Receives state machine events.
pub trait ProvisionObserver: Send + Sync {
    /// The state changed.
    fn state_changed(&self, from: ProvisioningState, to: ProvisioningState);

    /// A handler is about to run.
    fn tick(&self, _state: ProvisioningState, _retries: u32) {}
}

/// Logs events with `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingObserver;

impl ProvisionObserver for TracingObserver {
    fn state_changed(&self, from: ProvisioningState, to: ProvisioningState) {
        info!(from = %from, to = %to, "State change from {from} to {to}");
    }

    fn tick(&self, state: ProvisioningState, retries: u32) {
        debug!(state = %state, retries, "Evaluating state");
    }
}
