//! Variant A: bit-flag status word.
//!
//! Older runtimes keep the profiler state in a single word. Every place that
//! asks "is a profiler around?" compiles to `test byte [status], 6`, which
//! makes the word easy to find by counting references to it.

use crate::detectors::{ProfilerStatus, STATUS_FLAG_BITS};
use crate::engine::environment::{Environment, ProcessMemory, ProcessMemoryExt};
use crate::scan::signatures::PROFILER_STATUS_TEST;
use crate::scan::{MemoryView, SignatureScanner, MIN_CONFIDENCE};

#[derive(Debug, Default)]
pub struct StatusFlagDetector {
    address: Option<usize>,
    was_attached: bool,
}

impl StatusFlagDetector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Locates the status word and latches the initial attach state.
    /// Returns whether the word was found.
    pub fn initialize(&mut self, env: &Environment) -> bool {
        let Some(text) = env.image.section(".text") else {
            log::info!("[STATUS] {} has no code section", env.image.module_name());
            return false;
        };
        let Some(view) = MemoryView::capture(&*env.memory, text) else {
            return false;
        };

        let scanner = SignatureScanner::new(&*env.image, &*env.memory);
        let tally = scanner.scan(&view, PROFILER_STATUS_TEST, |_| true);
        let Some(address) = tally.pick(MIN_CONFIDENCE) else {
            log::info!(
                "[STATUS] Status word not found ({} candidates, best count {})",
                tally.len(),
                tally.max_count()
            );
            return false;
        };

        self.address = Some(address);
        self.was_attached = self.is_attached(&*env.memory);
        log::info!(
            "[STATUS] Status word at {:#x} ({} hits), attached: {}",
            address,
            tally.count(address),
            self.was_attached
        );
        true
    }

    pub fn address(&self) -> Option<usize> {
        self.address
    }

    pub fn status(&self, memory: &dyn ProcessMemory) -> Option<ProfilerStatus> {
        let address = self.address?;
        memory.read_u8(address).map(ProfilerStatus::Flags)
    }

    pub fn is_attached(&self, memory: &dyn ProcessMemory) -> bool {
        self.status(memory).is_some_and(ProfilerStatus::is_attached)
    }

    pub fn was_attached(&self) -> bool {
        self.was_attached
    }

    /// Clears the profiler bits, leaving the rest of the word alone.
    pub fn mitigate(&self, memory: &dyn ProcessMemory) -> bool {
        let Some(address) = self.address else {
            return false;
        };
        let Some(current) = memory.read_u8(address) else {
            return false;
        };
        if current & STATUS_FLAG_BITS == 0 {
            return true;
        }
        memory.write_u8(address, current & !STATUS_FLAG_BITS)
    }
}
