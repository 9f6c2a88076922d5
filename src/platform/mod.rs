//! Native collaborators for the current target.
//!
//! Each backend provides the three environment traits plus runtime
//! detection. Targets without a backend report every operation as
//! unsupported, which leaves the coordinator inert.

use crate::config::RuntimeTarget;
use crate::engine::environment::Environment;
use crate::error::Result;

#[cfg(target_os = "linux")]
mod linux;
#[cfg(windows)]
mod windows;

#[cfg(target_os = "linux")]
pub use linux::{parse_maps, Mapping, MapsImage, NativeMemory, NativeOs};
#[cfg(windows)]
pub use windows::{NativeMemory, NativeOs, PeImage};

/// First known runtime image loaded in this process.
pub fn detect_runtime() -> Option<RuntimeTarget> {
    #[cfg(any(target_os = "linux", windows))]
    let detected = backend().detect_runtime();
    #[cfg(not(any(target_os = "linux", windows)))]
    let detected = None;

    match &detected {
        Some(target) => log::debug!("[PLATFORM] Detected {} v{}", target.module, target.version),
        None => log::debug!("[PLATFORM] No known runtime loaded"),
    }
    detected
}

/// Native environment for the runtime image `target`.
pub fn native_environment(target: &RuntimeTarget) -> Result<Environment> {
    #[cfg(any(target_os = "linux", windows))]
    return backend().environment(target);

    #[cfg(not(any(target_os = "linux", windows)))]
    {
        let _ = target;
        Err(crate::error::Error::Unsupported("runtime image inspection"))
    }
}

#[cfg(target_os = "linux")]
fn backend() -> linux::Backend {
    linux::Backend
}

#[cfg(windows)]
fn backend() -> windows::Backend {
    windows::Backend
}
