//! Hetzner Robot webservice.
//!
//! The [`RobotApi`] trait is what the provisioning state machine consumes;
//! [`RobotClient`] implements it over HTTPS.
//! API Documentation: <https://robot.hetzner.com/doc/webservice/en.html>

mod client;
mod models;

use async_trait::async_trait;
use thiserror::Error;

pub use client::RobotClient;
pub use models::*;

/// Errors that can occur during Robot API operations.
#[derive(Error, Debug)]
pub enum RobotError {
    /// HTTP request failed.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// API returned an error response.
    #[error("API error: {status} {code} - {message}")]
    Api {
        status: u16,
        code: String,
        message: String,
    },

    /// Resource (usually the server number) does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl RobotError {
    /// HTTP status code of the failure, if one was received.
    #[must_use]
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Http(e) => e.status().map(|s| s.as_u16()),
            Self::Api { status, .. } => Some(*status),
            Self::NotFound(_) => Some(404),
            Self::Serialization(_) => None,
        }
    }

    /// Whether the failure means the requested resource does not exist.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        self.status() == Some(404)
    }
}

/// Operations on the Robot webservice used by `thdctl`.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RobotApi: Send + Sync {
    /// Get server metadata.
    async fn get_server(&self, server_number: u32) -> Result<ServerDetails, RobotError>;

    /// List all servers of the account.
    async fn list_servers(&self) -> Result<Vec<ServerDetails>, RobotError>;

    /// Get rescue system status.
    async fn get_rescue(&self, server_number: u32) -> Result<RescueDetails, RobotError>;

    /// Arm the rescue system for the next boot. The response carries the root password.
    async fn enable_rescue(&self, server_number: u32) -> Result<RescueDetails, RobotError>;

    /// Trigger a hardware reset.
    async fn reset_server(&self, server_number: u32) -> Result<(), RobotError>;

    /// Get firewall configuration.
    async fn get_firewall(&self, server_number: u32) -> Result<Firewall, RobotError>;
}
