//! Managed-runtime profiler guard.
//!
//! Finds the runtime's undocumented profiler bookkeeping by signature
//! scanning, reports whether a profiler is or was attached, silences an
//! attached one, and keeps new ones out by taking the runtime's attach
//! channel away from it.
//!
//! The free functions drive one process-wide [`ProfilerGuard`]. Hosts that
//! want to own the lifetime, or inject their own collaborators, use
//! [`ProfilerGuard`] directly.
//!
//! ```no_run
//! if anti_profiler_framework::initialize() && anti_profiler_framework::is_profiler_attached() {
//!     anti_profiler_framework::prevent_active_profiler_from_receiving_messages();
//! }
//! ```

use std::sync::{Mutex, OnceLock, PoisonError};

pub mod config;
pub mod detectors;
pub mod engine;
pub mod error;
pub mod exports;
mod ffi;
pub mod platform;
pub mod scan;


pub use config::{Config, RuntimeTarget, RuntimeVersion};
pub use detectors::ProfilerStatus;
pub use engine::coordinator::{InitReport, ProfilerGuard};
pub use error::{Error, Result};

static GUARD: OnceLock<Mutex<ProfilerGuard>> = OnceLock::new();

fn with_guard<R>(f: impl FnOnce(&mut ProfilerGuard) -> R) -> R {
    let guard = GUARD.get_or_init(|| Mutex::new(ProfilerGuard::new(Config::from_env())));
    let mut guard = guard.lock().unwrap_or_else(PoisonError::into_inner);
    f(&mut guard)
}

/// Locates the runtime's profiler status and, for newer runtimes, seizes the
/// attach channel. Configuration comes from `APF_*` environment variables.
///
/// Returns whether the status structure was found. Only the first call does
/// any work; later calls return the first result.
pub fn initialize() -> bool {
    with_guard(|guard| guard.initialize())
}

/// Like [`initialize`] with an explicit configuration. The configuration is
/// ignored if the guard is already initialized.
pub fn initialize_with(config: Config) -> bool {
    with_guard(|guard| {
        guard.configure(config);
        guard.initialize()
    })
}

/// Whether a profiler is attached right now.
pub fn is_profiler_attached() -> bool {
    with_guard(|guard| guard.is_profiler_attached())
}

/// Whether a profiler was attached when [`initialize`] ran.
pub fn was_profiler_attached() -> bool {
    with_guard(|guard| guard.was_profiler_attached())
}

/// Clears the profiler status so the runtime stops delivering callbacks to
/// an attached profiler. Does nothing if the status was never located.
pub fn prevent_active_profiler_from_receiving_messages() {
    with_guard(|guard| {
        guard.prevent_active_profiler_from_receiving_messages();
    })
}

/// Current status as read from the runtime.
pub fn profiler_status() -> Option<ProfilerStatus> {
    with_guard(|guard| guard.status())
}

/// Event mask of the control block, when the runtime has one.
pub fn event_mask() -> Option<u32> {
    with_guard(|guard| guard.event_mask())
}

/// What the one initialization pass found.
pub fn report() -> Option<InitReport> {
    with_guard(|guard| guard.report())
}
