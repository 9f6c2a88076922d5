//! Fault-Tolerant Probes
//!
//! Every read or write into memory owned by the runtime goes through
//! [`try_read`] / [`try_write`]. An access violation on the probed address is
//! turned into `false` instead of killing the process.
//!
//! # Backends
//!
//! - **Linux x86_64**: an assembly copy routine (`asm/probe_x86_64.s`) plus a
//!   process-wide SIGSEGV/SIGBUS handler. When the faulting RIP lies inside
//!   the copy routine, the handler moves RIP to a recovery label that returns
//!   0. Any other fault is handed to whatever handler was installed before us.
//! - **Linux, other architectures**: `process_vm_readv` / `process_vm_writev`
//!   against our own pid, which report `EFAULT` instead of faulting.
//! - **Windows**: `ReadProcessMemory` / `WriteProcessMemory` on the current
//!   process handle. `WriteProcessMemory` raises page protection on its
//!   own, so trial stores succeed on read-only pages here; that is accepted.
//! - Anything else: every probe fails.

/// Copies `buf.len()` bytes from `address` into `buf`.
///
/// # Safety
///
/// `address` may point anywhere; faults are recovered. The caller must not
/// rely on `buf` contents when `false` is returned.
pub unsafe fn try_read(address: usize, buf: &mut [u8]) -> bool {
    if buf.is_empty() {
        return true;
    }
    backend::copy(buf.as_mut_ptr(), address as *const u8, buf.len())
}

/// Copies `buf` to `address`.
///
/// # Safety
///
/// The write is real: a successful probe modifies foreign memory. Callers
/// must only target addresses they have validated as the structure they
/// intend to patch.
pub unsafe fn try_write(address: usize, buf: &[u8]) -> bool {
    if buf.is_empty() {
        return true;
    }
    backend::copy(address as *mut u8, buf.as_ptr(), buf.len())
}

#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
mod backend {
    use std::sync::{Once, OnceLock};

    use crate::ffi::{apf_probe_copy, apf_probe_copy_end, apf_probe_recover};

    /// Handlers that were active before ours, for chaining.
    struct PreviousHandlers {
        segv: libc::sigaction,
        bus: libc::sigaction,
    }

    static INSTALL: Once = Once::new();
    static PREVIOUS: OnceLock<PreviousHandlers> = OnceLock::new();

    pub unsafe fn copy(dst: *mut u8, src: *const u8, len: usize) -> bool {
        install_handler();
        if PREVIOUS.get().is_none() {
            // Installation failed; a fault would be fatal.
            return false;
        }
        apf_probe_copy(dst, src, len) == 1
    }

    fn install_handler() {
        INSTALL.call_once(|| unsafe {
            let mut sa: libc::sigaction = std::mem::zeroed();
            sa.sa_sigaction = probe_fault_handler as *const () as usize;
            libc::sigemptyset(&mut sa.sa_mask);
            sa.sa_flags = libc::SA_SIGINFO | libc::SA_ONSTACK;

            let mut old_segv: libc::sigaction = std::mem::zeroed();
            let mut old_bus: libc::sigaction = std::mem::zeroed();
            if libc::sigaction(libc::SIGSEGV, &sa, &mut old_segv) != 0 {
                log::warn!("[FAULT] Failed to install SIGSEGV handler");
                return;
            }
            if libc::sigaction(libc::SIGBUS, &sa, &mut old_bus) != 0 {
                log::warn!("[FAULT] Failed to install SIGBUS handler");
                libc::sigaction(libc::SIGSEGV, &old_segv, std::ptr::null_mut());
                return;
            }
            let _ = PREVIOUS.set(PreviousHandlers {
                segv: old_segv,
                bus: old_bus,
            });
            log::debug!("[FAULT] Probe fault handler installed");
        });
    }

    extern "C" fn probe_fault_handler(
        signum: libc::c_int,
        info: *mut libc::siginfo_t,
        ctx: *mut libc::c_void,
    ) {
        unsafe {
            let ucontext = ctx as *mut libc::ucontext_t;
            let rip = (*ucontext).uc_mcontext.gregs[libc::REG_RIP as usize] as usize;
            let start = apf_probe_copy as *const () as usize;
            let end = apf_probe_copy_end as *const () as usize;

            if rip >= start && rip < end {
                (*ucontext).uc_mcontext.gregs[libc::REG_RIP as usize] =
                    apf_probe_recover as *const () as usize as libc::greg_t;
                return;
            }

            chain(signum, info, ctx);
        }
    }

    /// Not one of ours: forward to the previous handler, or fall back to the
    /// default action so the faulting instruction re-executes and terminates.
    unsafe fn chain(signum: libc::c_int, info: *mut libc::siginfo_t, ctx: *mut libc::c_void) {
        let previous = match PREVIOUS.get() {
            Some(p) if signum == libc::SIGBUS => &p.bus,
            Some(p) => &p.segv,
            None => {
                libc::signal(signum, libc::SIG_DFL);
                return;
            }
        };

        let handler = previous.sa_sigaction;
        if handler == libc::SIG_DFL || handler == libc::SIG_IGN {
            libc::signal(signum, libc::SIG_DFL);
            return;
        }

        if previous.sa_flags & libc::SA_SIGINFO != 0 {
            let f: extern "C" fn(libc::c_int, *mut libc::siginfo_t, *mut libc::c_void) =
                std::mem::transmute(handler);
            f(signum, info, ctx);
        } else {
            let f: extern "C" fn(libc::c_int) = std::mem::transmute(handler);
            f(signum);
        }
    }
}

#[cfg(all(target_os = "linux", not(target_arch = "x86_64")))]
mod backend {
    pub unsafe fn copy(dst: *mut u8, src: *const u8, len: usize) -> bool {
        let local = libc::iovec {
            iov_base: dst as *mut libc::c_void,
            iov_len: len,
        };
        let remote = libc::iovec {
            iov_base: src as *mut libc::c_void,
            iov_len: len,
        };
        // The kernel resolves both sides in our own address space; a bad
        // pointer on either side yields EFAULT.
        let copied = libc::process_vm_readv(libc::getpid(), &local, 1, &remote, 1, 0);
        copied == len as isize
    }
}

#[cfg(windows)]
mod backend {
    use std::ffi::c_void;

    use windows_sys::Win32::System::Diagnostics::Debug::{ReadProcessMemory, WriteProcessMemory};
    use windows_sys::Win32::System::Threading::GetCurrentProcess;

    pub unsafe fn copy(dst: *mut u8, src: *const u8, len: usize) -> bool {
        // Stage through a local buffer so that both the source and the
        // destination are validated by the kernel.
        let mut staging = vec![0u8; len];
        let mut done = 0usize;
        let process = GetCurrentProcess();

        if ReadProcessMemory(
            process,
            src as *const c_void,
            staging.as_mut_ptr() as *mut c_void,
            len,
            &mut done,
        ) == 0
            || done != len
        {
            return false;
        }

        done = 0;
        WriteProcessMemory(
            process,
            dst as *const c_void,
            staging.as_ptr() as *const c_void,
            len,
            &mut done,
        ) != 0
            && done == len
    }
}

#[cfg(not(any(target_os = "linux", windows)))]
mod backend {
    pub unsafe fn copy(_dst: *mut u8, _src: *const u8, _len: usize) -> bool {
        false
    }
}
