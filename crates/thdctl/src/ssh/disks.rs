//! `lsblk` output parsing for install diagnostics.

use serde::Serialize;
use tracing::{error, info};

/// A top-level block device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiskInfo {
    pub name: String,
    pub size: String,
    #[serde(rename = "type")]
    pub disk_type: String,
    pub mountpoint: String,
}

/// Parse the default `lsblk` table.
///
/// The header line is skipped, as are partition rows drawn with tree
/// prefixes (`├─`, `└─`). Rows with fewer than six columns are ignored.
#[must_use]
pub fn parse_lsblk_output(output: &str) -> Vec<DiskInfo> {
    output
        .lines()
        .skip(1)
        .filter(|line| !line.contains("├─") && !line.contains("└─"))
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 6 {
                return None;
            }
            Some(DiskInfo {
                name: fields[0].to_string(),
                size: fields[3].to_string(),
                disk_type: fields[5].to_string(),
                mountpoint: fields[6..].join(" "),
            })
        })
        .collect()
}

/// Log disks as a single JSON field.
pub fn log_disks(disks: &[DiskInfo]) {
    match serde_json::to_string(disks) {
        Ok(json) => info!(disks = %json, "Disk information"),
        Err(e) => error!(error = %e, "Failed to serialize disk information"),
    }
}
