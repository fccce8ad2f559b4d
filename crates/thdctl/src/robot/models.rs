//! Hetzner Robot webservice request and response models.
//!
//! Based on the Robot webservice documentation. Only the fields used by the
//! provisioning flow and the CLI are modelled; unknown fields are ignored.

use serde::{Deserialize, Serialize};

// ============================================================================
// Server types
// ============================================================================

/// Server wrapper returned by `GET /server` and `GET /server/{id}`.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerResponse {
    /// Server details.
    pub server: ServerDetails,
}

/// Server details.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerDetails {
    /// Server number (unique identifier).
    pub server_number: u32,
    /// Server name/label.
    #[serde(default)]
    pub server_name: String,
    /// Main IPv4 address.
    #[serde(default)]
    pub server_ip: Option<String>,
    /// IPv6 network.
    #[serde(default)]
    pub server_ipv6_net: Option<String>,
    /// Product name (e.g. "AX52").
    #[serde(default)]
    pub product: String,
    /// Data center (e.g. "FSN1-DC14").
    #[serde(default)]
    pub dc: String,
    /// Server status ("ready" or "in process").
    #[serde(default)]
    pub status: String,
    /// Paid until date.
    #[serde(default)]
    pub paid_until: Option<String>,
    /// Whether the server has been cancelled.
    #[serde(default)]
    pub cancelled: bool,
}

// ============================================================================
// Rescue types
// ============================================================================

/// Rescue mode activation request for `POST /boot/{id}/rescue`.
#[derive(Debug, Serialize)]
pub struct RescueRequest {
    /// Operating system for rescue mode.
    pub os: String,
    /// SSH key fingerprints.
    #[serde(rename = "authorized_key[]")]
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub authorized_key: Vec<String>,
}

/// Rescue mode response.
#[derive(Debug, Clone, Deserialize)]
pub struct RescueResponse {
    /// Rescue mode details.
    pub rescue: RescueDetails,
}

/// Rescue mode details.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct RescueDetails {
    /// Main IPv4 address of the server.
    #[serde(default)]
    pub server_ip: String,
    /// IPv6 network.
    #[serde(default)]
    pub server_ipv6_net: Option<String>,
    /// Server number.
    #[serde(default)]
    pub server_number: u32,
    /// Whether the rescue system is armed for the next boot.
    #[serde(default)]
    pub active: bool,
    /// Root password, only present right after activation.
    #[serde(default)]
    pub password: Option<String>,
    /// Authorized SSH keys.
    #[serde(default)]
    pub authorized_key: Vec<serde_json::Value>,
    /// Host keys.
    #[serde(default)]
    pub host_key: Vec<serde_json::Value>,
    /// Time of the last rescue boot.
    #[serde(default)]
    pub boot_time: Option<String>,
}

impl RescueDetails {
    /// Root password if the API returned a non-empty one.
    #[must_use]
    pub fn password(&self) -> Option<&str> {
        self.password.as_deref().filter(|p| !p.is_empty())
    }
}

// ============================================================================
// Reset types
// ============================================================================

/// Reset server request for `POST /reset/{id}`.
#[derive(Debug, Serialize)]
pub struct ResetRequest {
    /// Reset type: "hw" (hardware), "sw" (software), "power" (power cycle).
    #[serde(rename = "type")]
    pub reset_type: String,
}

// ============================================================================
// Firewall types
// ============================================================================

/// Firewall wrapper returned by `GET /firewall/{id}`.
#[derive(Debug, Clone, Deserialize)]
pub struct FirewallResponse {
    /// Firewall configuration.
    pub firewall: Firewall,
}

/// Firewall configuration of a server.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Firewall {
    /// Main IPv4 address.
    #[serde(default)]
    pub server_ip: String,
    /// Server number.
    #[serde(default)]
    pub server_number: u32,
    /// Status: "active", "disabled" or "in process".
    #[serde(default)]
    pub status: String,
    /// Whether IPv6 traffic is filtered.
    #[serde(default)]
    pub filter_ipv6: bool,
    /// Whether Hetzner services are whitelisted.
    #[serde(default)]
    pub whitelist_hos: bool,
    /// Switch port ("main" or "kvm").
    #[serde(default)]
    pub port: String,
    /// Rule sets.
    #[serde(default)]
    pub rules: FirewallRules,
}

/// Input and output rule sets.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct FirewallRules {
    /// Incoming rules.
    #[serde(default)]
    pub input: Vec<FirewallRule>,
    /// Outgoing rules.
    #[serde(default)]
    pub output: Vec<FirewallRule>,
}

/// Single firewall rule.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct FirewallRule {
    /// "ipv4" or "ipv6".
    #[serde(default)]
    pub ip_version: Option<String>,
    /// Rule name.
    #[serde(default)]
    pub name: Option<String>,
    /// Destination IP or subnet.
    #[serde(default)]
    pub dst_ip: Option<String>,
    /// Source IP or subnet.
    #[serde(default)]
    pub src_ip: Option<String>,
    /// Destination port or range.
    #[serde(default)]
    pub dst_port: Option<String>,
    /// Source port or range.
    #[serde(default)]
    pub src_port: Option<String>,
    /// Protocol (tcp, udp, ...).
    #[serde(default)]
    pub protocol: Option<String>,
    /// TCP flags.
    #[serde(default)]
    pub tcp_flags: Option<String>,
    /// "accept" or "discard".
    #[serde(default)]
    pub action: String,
}

// ============================================================================
// Error types
// ============================================================================

/// Error body returned by the Robot webservice on failures.
#[derive(Debug, Deserialize)]
pub struct ErrorResponse {
    /// Error details.
    pub error: ErrorDetails,
}

/// Error details.
#[derive(Debug, Deserialize)]
pub struct ErrorDetails {
    /// HTTP status repeated in the body.
    #[serde(default)]
    pub status: u16,
    /// Machine readable code (e.g. `SERVER_NOT_FOUND`).
    #[serde(default)]
    pub code: String,
    /// Human readable message.
    #[serde(default)]
    pub message: String,
}
