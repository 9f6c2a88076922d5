//! Scoped write-permission elevation.

use crate::engine::environment::{Protection, ProcessMemory};
use crate::error::Result;

/// Keeps a memory range writable for as long as it lives.
///
/// The previous protection is put back on drop, so every exit path out of a
/// patching scope (early return, `?`, panic) restores it.
pub struct ProtectionGuard<'a> {
    memory: &'a dyn ProcessMemory,
    address: usize,
    len: usize,
    previous: Protection,
}

impl<'a> ProtectionGuard<'a> {
    pub fn elevate(memory: &'a dyn ProcessMemory, address: usize, len: usize) -> Result<Self> {
        let previous = memory.make_writable(address, len)?;
        Ok(Self {
            memory,
            address,
            len,
            previous,
        })
    }

    pub fn previous(&self) -> Protection {
        self.previous
    }
}

impl Drop for ProtectionGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = self
            .memory
            .restore_protection(self.address, self.len, self.previous)
        {
            log::warn!("[PROTECT] Restore failed at {:#x}: {}", self.address, e);
        }
    }
}
