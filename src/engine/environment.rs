//! Environment Module
//!
//! The collaborators the detectors run against. Everything that touches the
//! host OS or the runtime image sits behind one of three traits:
//!
//! - [`ImageInspector`]: section table and address-range validation for the
//!   runtime module
//! - [`ProcessMemory`]: fault-tolerant reads and writes plus protection changes
//! - [`OsServices`]: process id, named attach channels, sleeping
//!
//! Native implementations live in [`crate::platform`]; tests plug in a
//! simulated process instead.

use std::fmt;
use std::time::Duration;

use crate::error::Result;

/// Pointer width of the image being scanned. Decides whether memory operands
/// are absolute (4) or RIP-relative (8).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PointerWidth {
    Four,
    Eight,
}

impl PointerWidth {
    /// Width of the build this crate was compiled for.
    pub fn native() -> Self {
        if cfg!(target_pointer_width = "64") {
            PointerWidth::Eight
        } else {
            PointerWidth::Four
        }
    }

    pub fn bytes(self) -> usize {
        match self {
            PointerWidth::Four => 4,
            PointerWidth::Eight => 8,
        }
    }
}

/// Base and size of a named image section.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryRegion {
    pub base: usize,
    pub size: usize,
}

impl MemoryRegion {
    pub fn new(base: usize, size: usize) -> Self {
        Self { base, size }
    }

    pub fn end(&self) -> usize {
        self.base.saturating_add(self.size)
    }

    /// True if `[address, address + len)` lies inside the region.
    pub fn contains(&self, address: usize, len: usize) -> bool {
        match address.checked_add(len) {
            Some(end) => address >= self.base && end <= self.end(),
            None => false,
        }
    }
}

/// True if `address` is a multiple of `n` (`n` must be a power of two).
pub fn is_aligned(address: usize, n: usize) -> bool {
    debug_assert!(n.is_power_of_two());
    address & (n - 1) == 0
}

/// Platform-native protection value of a memory range, as returned by
/// [`ProcessMemory::make_writable`] so it can be restored later.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Protection(pub u32);

/// Section table and range validation for the runtime image.
pub trait ImageInspector {
    /// File name of the module this inspector describes.
    fn module_name(&self) -> &str;

    fn pointer_width(&self) -> PointerWidth;

    /// Looks up a section by its conventional name (`.text`, `.rdata`, `.data`).
    fn section(&self, name: &str) -> Option<MemoryRegion>;

    /// True if `[address, address + len)` is mapped, readable and belongs to
    /// the image.
    fn is_valid_range(&self, address: usize, len: usize) -> bool;
}

/// Reads and writes into memory the crate does not own.
///
/// Reads and writes must never fault; a bad address yields `false`.
pub trait ProcessMemory {
    fn try_read(&self, address: usize, buf: &mut [u8]) -> bool;

    fn try_write(&self, address: usize, buf: &[u8]) -> bool;

    /// Makes `[address, address + len)` writable and returns the previous
    /// protection.
    fn make_writable(&self, address: usize, len: usize) -> Result<Protection>;

    /// Puts back a protection previously returned by `make_writable`.
    fn restore_protection(&self, address: usize, len: usize, previous: Protection) -> Result<()>;
}

/// Typed helpers on top of [`ProcessMemory`].
pub trait ProcessMemoryExt: ProcessMemory {
    fn read_u8(&self, address: usize) -> Option<u8> {
        let mut buf = [0u8; 1];
        self.try_read(address, &mut buf).then_some(buf[0])
    }

    fn read_u32(&self, address: usize) -> Option<u32> {
        let mut buf = [0u8; 4];
        self.try_read(address, &mut buf)
            .then(|| u32::from_le_bytes(buf))
    }

    /// Reads a pointer-sized little-endian value.
    fn read_pointer(&self, address: usize, width: PointerWidth) -> Option<usize> {
        match width {
            PointerWidth::Four => self.read_u32(address).map(|v| v as usize),
            PointerWidth::Eight => {
                let mut buf = [0u8; 8];
                if !self.try_read(address, &mut buf) {
                    return None;
                }
                usize::try_from(u64::from_le_bytes(buf)).ok()
            }
        }
    }

    fn write_u8(&self, address: usize, value: u8) -> bool {
        self.try_write(address, &[value])
    }

    fn write_u32(&self, address: usize, value: u32) -> bool {
        self.try_write(address, &value.to_le_bytes())
    }
}

impl<T: ProcessMemory + ?Sized> ProcessMemoryExt for T {}

/// An open end of the attach channel. Dropping it closes the handle.
pub trait AttachChannel: Send + fmt::Debug {
    fn name(&self) -> &str;
}

/// Process-level OS services.
pub trait OsServices {
    fn process_id(&self) -> u32;

    /// Creates the single-instance channel. Fails if it already exists.
    fn create_channel(&self, name: &str) -> Result<Box<dyn AttachChannel>>;

    /// Connects to an existing channel as a client.
    fn open_channel(&self, name: &str) -> Result<Box<dyn AttachChannel>>;

    fn sleep(&self, duration: Duration);
}

/// The three collaborators bundled together, as owned by the coordinator.
pub struct Environment {
    pub image: Box<dyn ImageInspector + Send>,
    pub memory: Box<dyn ProcessMemory + Send>,
    pub os: Box<dyn OsServices + Send>,
}

impl Environment {
    pub fn new(
        image: Box<dyn ImageInspector + Send>,
        memory: Box<dyn ProcessMemory + Send>,
        os: Box<dyn OsServices + Send>,
    ) -> Self {
        Self { image, memory, os }
    }

    pub fn pointer_width(&self) -> PointerWidth {
        self.image.pointer_width()
    }
}

impl fmt::Debug for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Environment")
            .field("module", &self.image.module_name())
            .field("pointer_width", &self.image.pointer_width())
            .finish()
    }
}
