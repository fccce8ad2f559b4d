//! Talos Linux images and API reachability.

mod image;
mod probe;

pub use image::{TalosImage, DEFAULT_TALOS_VERSION};
pub use probe::{ProbeError, ServiceProbe, TalosApiProbe, TALOS_API_PORT};

#[cfg(test)]
pub use probe::MockServiceProbe;
