//! Validation of operator input that ends up in remote shell commands.

use std::sync::LazyLock;

use regex::Regex;
use thiserror::Error;
use url::Url;

static DISK_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_./-]*$").expect("valid regex"));

static TALOS_VERSION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^v\d+\.\d+\.\d+(-[0-9A-Za-z.]+)?$").expect("valid regex"));

/// Rejected operator input.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ValidationError {
    #[error("invalid disk name '{0}': use a device name below /dev such as nvme0n1 or sda")]
    DiskName(String),

    #[error("invalid image URL '{0}': {1}")]
    ImageUrl(String, String),

    #[error("invalid Talos version '{0}': expected e.g. v1.9.2")]
    TalosVersion(String),
}

/// Disk names are relative to `/dev` and may not contain shell metacharacters.
///
/// # Errors
/// Returns [`ValidationError::DiskName`] when the name is rejected.
pub fn validate_disk_name(disk: &str) -> Result<(), ValidationError> {
    if DISK_NAME.is_match(disk) && !disk.contains("..") {
        Ok(())
    } else {
        Err(ValidationError::DiskName(disk.to_string()))
    }
}

/// Image URLs must be absolute http(s) URLs.
///
/// # Errors
/// Returns [`ValidationError::ImageUrl`] when the URL does not parse or uses another scheme.
pub fn validate_image_url(image: &str) -> Result<(), ValidationError> {
    let url = Url::parse(image)
        .map_err(|e| ValidationError::ImageUrl(image.to_string(), e.to_string()))?;

    match url.scheme() {
        "http" | "https" => Ok(()),
        other => Err(ValidationError::ImageUrl(
            image.to_string(),
            format!("unsupported scheme '{other}'"),
        )),
    }
}

/// Talos versions are release tags.
///
/// # Errors
/// Returns [`ValidationError::TalosVersion`] for anything that is not a release tag.
pub fn validate_talos_version(version: &str) -> Result<(), ValidationError> {
    if TALOS_VERSION.is_match(version) {
        Ok(())
    } else {
        Err(ValidationError::TalosVersion(version.to_string()))
    }
}
