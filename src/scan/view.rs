//! Bounded snapshot of an image section.
//!
//! Scanning works on a private copy of the section taken through the
//! fault-tolerant probe, so the byte-by-byte walk never dereferences foreign
//! memory directly. Pages that cannot be read are left zero-filled; no idiom
//! starts with a zero byte, so they simply never match.

use crate::engine::environment::{MemoryRegion, PointerWidth, ProcessMemory};

const CAPTURE_CHUNK: usize = 0x1000;

pub struct MemoryView {
    base: usize,
    bytes: Vec<u8>,
}

impl MemoryView {
    /// Copies `region` out of process memory. Returns `None` if no byte of it
    /// could be read.
    pub fn capture(memory: &dyn ProcessMemory, region: MemoryRegion) -> Option<Self> {
        if region.size == 0 {
            return None;
        }

        let mut bytes = vec![0u8; region.size];
        let mut readable = false;
        for (index, chunk) in bytes.chunks_mut(CAPTURE_CHUNK).enumerate() {
            let address = region.base + index * CAPTURE_CHUNK;
            if memory.try_read(address, chunk) {
                readable = true;
            } else {
                chunk.fill(0);
            }
        }

        if !readable {
            log::debug!("[VIEW] Region {:#x}+{:#x} unreadable", region.base, region.size);
            return None;
        }
        Some(Self {
            base: region.base,
            bytes,
        })
    }

    /// Wraps bytes already copied out of the process.
    pub fn from_bytes(base: usize, bytes: Vec<u8>) -> Self {
        Self { base, bytes }
    }

    pub fn base(&self) -> usize {
        self.base
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Absolute address of `offset`.
    pub fn address_of(&self, offset: usize) -> usize {
        self.base + offset
    }

    /// True if `pattern` occurs at `offset`.
    pub fn matches_at(&self, offset: usize, pattern: &[u8]) -> bool {
        offset
            .checked_add(pattern.len())
            .and_then(|end| self.bytes.get(offset..end))
            .map_or(false, |window| window == pattern)
    }

    pub fn read_i32(&self, offset: usize) -> Option<i32> {
        let window = self.bytes.get(offset..offset.checked_add(4)?)?;
        Some(i32::from_le_bytes(window.try_into().ok()?))
    }

    pub fn read_u32(&self, offset: usize) -> Option<u32> {
        self.read_i32(offset).map(|v| v as u32)
    }

    pub fn read_pointer(&self, offset: usize, width: PointerWidth) -> Option<usize> {
        match width {
            PointerWidth::Four => self.read_u32(offset).map(|v| v as usize),
            PointerWidth::Eight => {
                let window = self.bytes.get(offset..offset.checked_add(8)?)?;
                usize::try_from(u64::from_le_bytes(window.try_into().ok()?)).ok()
            }
        }
    }
}

impl std::fmt::Debug for MemoryView {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "MemoryView({:#x}+{:#x})", self.base, self.bytes.len())
    }
}
