//! C ABI
//!
//! Entry points for hosts that load the crate as a shared library, typically
//! a managed application calling in through P/Invoke. A panic never crosses
//! the boundary; it is logged and turned into the "nothing found" answer.

use std::panic::{catch_unwind, AssertUnwindSafe};

fn guarded<R>(name: &str, fallback: R, f: impl FnOnce() -> R) -> R {
    catch_unwind(AssertUnwindSafe(f)).unwrap_or_else(|_| {
        log::error!("[FFI] {} panicked", name);
        fallback
    })
}

#[no_mangle]
pub extern "C" fn apf_initialize() -> bool {
    guarded("apf_initialize", false, crate::initialize)
}

#[no_mangle]
pub extern "C" fn apf_is_profiler_attached() -> bool {
    guarded("apf_is_profiler_attached", false, crate::is_profiler_attached)
}

#[no_mangle]
pub extern "C" fn apf_was_profiler_attached() -> bool {
    guarded("apf_was_profiler_attached", false, crate::was_profiler_attached)
}

#[no_mangle]
pub extern "C" fn apf_prevent_active_profiler_from_receiving_messages() {
    guarded(
        "apf_prevent_active_profiler_from_receiving_messages",
        (),
        crate::prevent_active_profiler_from_receiving_messages,
    )
}
