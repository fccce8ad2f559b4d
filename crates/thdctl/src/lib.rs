//! Talos Linux provisioning for Hetzner dedicated servers.
//!
//! This crate drives the Hetzner Robot webservice and an SSH session into the
//! rescue system to write a Talos image onto a server's disk, then waits for
//! the Talos API to come online.
//!
//! # Example
//!
//! ```rust,ignore
//! use thdctl::provision::{ProvisionConfig, ServerDescriptor, StateMachine};
//! use thdctl::robot::RobotClient;
//! use thdctl::ssh::SshClient;
//! use thdctl::talos::TalosApiProbe;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let robot = RobotClient::new("robot-user", "robot-password")?;
//!     let server = ServerDescriptor::new(12345, "nvme0n1").with_talos_version("v1.9.2");
//!
//!     let mut machine = StateMachine::new(
//!         robot,
//!         SshClient::default(),
//!         TalosApiProbe::default(),
//!         server,
//!         ProvisionConfig::default(),
//!     );
//!     machine.run().await?;
//!     Ok(())
//! }
//! ```

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod provision;
pub mod robot;
pub mod ssh;
pub mod talos;
pub mod validation;

pub use provision::{ProvisionConfig, ProvisionError, ProvisioningState, ServerDescriptor, StateMachine};
pub use robot::{RobotApi, RobotClient, RobotError};
pub use ssh::{RemoteExec, SshClient, SshError};
pub use talos::{ServiceProbe, TalosApiProbe};
