//! Talos image source resolution.

/// Default Talos version.
pub const DEFAULT_TALOS_VERSION: &str = "v1.9.2";

/// Talos GitHub releases base URL.
const RELEASES_URL: &str = "https://github.com/siderolabs/talos/releases/download";

/// Where the Talos disk image comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TalosImage {
    /// Official `metal` release image for a version (e.g. "v1.9.2").
    Release(String),
    /// Explicit image URL, e.g. from the Talos Image Factory.
    Url(String),
}

impl Default for TalosImage {
    fn default() -> Self {
        Self::Release(DEFAULT_TALOS_VERSION.to_string())
    }
}

impl TalosImage {
    /// Download URL of the zstd compressed raw disk image.
    #[must_use]
    pub fn download_url(&self) -> String {
        match self {
            Self::Release(version) => format!("{RELEASES_URL}/{version}/metal-amd64.raw.zst"),
            Self::Url(url) => url.clone(),
        }
    }
}
