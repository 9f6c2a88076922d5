//! Windows backend.
//!
//! The runtime image is already mapped, so its section table is read straight
//! out of memory through the fault-tolerant probe rather than from the file.
//! The attach channel is a first-instance named pipe, exactly the object the
//! runtime's listener creates.

use std::ffi::c_void;
use std::fmt;
use std::time::Duration;

use windows_sys::Win32::Foundation::{
    CloseHandle, GetLastError, GENERIC_READ, GENERIC_WRITE, HANDLE, INVALID_HANDLE_VALUE,
};
use windows_sys::Win32::Storage::FileSystem::{
    CreateFileW, FILE_FLAG_FIRST_PIPE_INSTANCE, OPEN_EXISTING, PIPE_ACCESS_DUPLEX,
};
use windows_sys::Win32::System::LibraryLoader::GetModuleHandleW;
use windows_sys::Win32::System::Memory::{
    VirtualProtect, VirtualQuery, MEMORY_BASIC_INFORMATION, MEM_COMMIT, PAGE_EXECUTE_READ,
    PAGE_EXECUTE_READWRITE, PAGE_EXECUTE_WRITECOPY, PAGE_GUARD, PAGE_NOACCESS,
    PAGE_PROTECTION_FLAGS, PAGE_READONLY, PAGE_READWRITE, PAGE_WRITECOPY,
};
use windows_sys::Win32::System::Pipes::{
    CreateNamedPipeW, PIPE_READMODE_MESSAGE, PIPE_TYPE_MESSAGE, PIPE_WAIT,
};
use windows_sys::Win32::System::Threading::GetCurrentProcessId;

use crate::config::{RuntimeTarget, KNOWN_RUNTIMES};
use crate::engine::environment::{
    AttachChannel, Environment, ImageInspector, MemoryRegion, OsServices, PointerWidth,
    ProcessMemory, ProcessMemoryExt, Protection,
};
use crate::engine::fault;
use crate::error::{Error, Result};

const PIPE_PREFIX: &str = r"\\.\pipe\";
const PIPE_BUFFER_SIZE: u32 = 0x1000;

const IMAGE_DOS_SIGNATURE: u16 = 0x5A4D;
const IMAGE_NT_SIGNATURE: u32 = 0x0000_4550;
const SECTION_HEADER_SIZE: usize = 40;

pub(super) struct Backend;

impl Backend {
    pub fn detect_runtime(&self) -> Option<RuntimeTarget> {
        KNOWN_RUNTIMES.iter().find_map(|&(module, version)| {
            module_base(module).map(|_| RuntimeTarget::new(module, version))
        })
    }

    pub fn environment(&self, target: &RuntimeTarget) -> Result<Environment> {
        let image = PeImage::locate(&target.module)?;
        Ok(Environment::new(
            Box::new(image),
            Box::new(NativeMemory),
            Box::new(NativeOs),
        ))
    }
}

fn wide(text: &str) -> Vec<u16> {
    text.encode_utf16().chain(std::iter::once(0)).collect()
}

fn last_error() -> i32 {
    unsafe { GetLastError() as i32 }
}

fn module_base(module: &str) -> Option<usize> {
    let name = wide(module);
    let handle = unsafe { GetModuleHandleW(name.as_ptr()) };
    (!handle.is_null()).then_some(handle as usize)
}

/// Section table of a module mapped into this process.
#[derive(Debug, Clone)]
pub struct PeImage {
    module: String,
    width: PointerWidth,
    sections: Vec<(String, MemoryRegion)>,
}

impl PeImage {
    pub fn locate(module: &str) -> Result<Self> {
        let base = module_base(module).ok_or_else(|| Error::NotFound(format!("module {}", module)))?;
        let mut image = Self::parse(base, &NativeMemory)?;
        image.module = module.to_string();
        Ok(image)
    }

    /// Reads the headers of the image mapped at `base`.
    pub fn parse(base: usize, memory: &dyn ProcessMemory) -> Result<Self> {
        let bad = |what: &str| Error::NotFound(format!("{} of image at {:#x}", what, base));

        if memory.read_u32(base).map(|v| v as u16) != Some(IMAGE_DOS_SIGNATURE) {
            return Err(bad("DOS header"));
        }
        let nt = base + memory.read_u32(base + 0x3C).ok_or_else(|| bad("e_lfanew"))? as usize;
        if memory.read_u32(nt) != Some(IMAGE_NT_SIGNATURE) {
            return Err(bad("NT headers"));
        }

        let file_header = memory.read_u32(nt + 4).ok_or_else(|| bad("file header"))?;
        let section_count = (file_header >> 16) as usize;
        let optional_size = memory.read_u32(nt + 20).ok_or_else(|| bad("file header"))? & 0xFFFF;
        let magic = memory.read_u32(nt + 24).ok_or_else(|| bad("optional header"))? & 0xFFFF;
        let width = match magic {
            0x10B => PointerWidth::Four,
            0x20B => PointerWidth::Eight,
            _ => return Err(bad("optional header magic")),
        };

        let table = nt + 24 + optional_size as usize;
        let mut sections = Vec::with_capacity(section_count);
        for index in 0..section_count {
            let mut header = [0u8; SECTION_HEADER_SIZE];
            if !memory.try_read(table + index * SECTION_HEADER_SIZE, &mut header) {
                return Err(bad("section table"));
            }
            let name_len = header[..8].iter().position(|&b| b == 0).unwrap_or(8);
            let name = String::from_utf8_lossy(&header[..name_len]).into_owned();
            let field = |at: usize| u32::from_le_bytes([header[at], header[at + 1], header[at + 2], header[at + 3]]);
            let (virtual_size, virtual_address) = (field(8), field(12));
            sections.push((
                name,
                MemoryRegion::new(base + virtual_address as usize, virtual_size as usize),
            ));
        }

        log::debug!("[PLATFORM] Image at {:#x}: {} sections, {:?}", base, sections.len(), width);
        Ok(Self {
            module: String::new(),
            width,
            sections,
        })
    }
}

impl ImageInspector for PeImage {
    fn module_name(&self) -> &str {
        &self.module
    }

    fn pointer_width(&self) -> PointerWidth {
        self.width
    }

    fn section(&self, name: &str) -> Option<MemoryRegion> {
        self.sections
            .iter()
            .find(|(section, _)| section == name)
            .map(|&(_, region)| region)
    }

    fn is_valid_range(&self, address: usize, len: usize) -> bool {
        self.sections.iter().any(|(_, r)| r.contains(address, len)) && is_readable(address, len)
    }
}

const READABLE: PAGE_PROTECTION_FLAGS = PAGE_READONLY
    | PAGE_READWRITE
    | PAGE_WRITECOPY
    | PAGE_EXECUTE_READ
    | PAGE_EXECUTE_READWRITE
    | PAGE_EXECUTE_WRITECOPY;

fn is_readable(address: usize, len: usize) -> bool {
    let mut info: MEMORY_BASIC_INFORMATION = unsafe { std::mem::zeroed() };
    let queried = unsafe {
        VirtualQuery(
            address as *const c_void,
            &mut info,
            std::mem::size_of::<MEMORY_BASIC_INFORMATION>(),
        )
    };
    if queried == 0 || info.State != MEM_COMMIT {
        return false;
    }
    let protect = info.Protect;
    if protect & (PAGE_GUARD | PAGE_NOACCESS) != 0 || protect & READABLE == 0 {
        return false;
    }
    let end = (info.BaseAddress as usize).saturating_add(info.RegionSize);
    address.checked_add(len).is_some_and(|last| last <= end)
}

/// Memory of the current process.
#[derive(Debug, Default, Clone, Copy)]
pub struct NativeMemory;

impl ProcessMemory for NativeMemory {
    fn try_read(&self, address: usize, buf: &mut [u8]) -> bool {
        unsafe { fault::try_read(address, buf) }
    }

    fn try_write(&self, address: usize, buf: &[u8]) -> bool {
        unsafe { fault::try_write(address, buf) }
    }

    fn make_writable(&self, address: usize, len: usize) -> Result<Protection> {
        protect(address, len, PAGE_EXECUTE_READWRITE)
    }

    fn restore_protection(&self, address: usize, len: usize, previous: Protection) -> Result<()> {
        protect(address, len, previous.0).map(|_| ())
    }
}

fn protect(address: usize, len: usize, protection: PAGE_PROTECTION_FLAGS) -> Result<Protection> {
    let mut previous: PAGE_PROTECTION_FLAGS = 0;
    if unsafe { VirtualProtect(address as *const c_void, len, protection, &mut previous) } == 0 {
        return Err(Error::Protection {
            address,
            len,
            code: last_error(),
        });
    }
    Ok(Protection(previous))
}

/// Owned pipe or file handle, closed on drop.
struct HandleGuard(HANDLE);

impl Drop for HandleGuard {
    fn drop(&mut self) {
        if !self.0.is_null() && self.0 != INVALID_HANDLE_VALUE {
            unsafe { CloseHandle(self.0) };
        }
    }
}

// Kernel handles may be used from any thread.
unsafe impl Send for HandleGuard {}

struct PipeChannel {
    name: String,
    _handle: HandleGuard,
}

impl fmt::Debug for PipeChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipeChannel")
            .field("name", &self.name)
            .field("handle", &(self._handle.0 as usize))
            .finish()
    }
}

impl AttachChannel for PipeChannel {
    fn name(&self) -> &str {
        &self.name
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NativeOs;

impl NativeOs {
    fn channel(name: &str, handle: HANDLE) -> Result<Box<dyn AttachChannel>> {
        if handle == INVALID_HANDLE_VALUE || handle.is_null() {
            return Err(Error::ChannelUnavailable {
                name: name.to_string(),
                code: last_error(),
            });
        }
        Ok(Box::new(PipeChannel {
            name: name.to_string(),
            _handle: HandleGuard(handle),
        }))
    }
}

impl OsServices for NativeOs {
    fn process_id(&self) -> u32 {
        unsafe { GetCurrentProcessId() }
    }

    fn create_channel(&self, name: &str) -> Result<Box<dyn AttachChannel>> {
        let path = wide(&format!("{}{}", PIPE_PREFIX, name));
        let handle = unsafe {
            CreateNamedPipeW(
                path.as_ptr(),
                PIPE_ACCESS_DUPLEX | FILE_FLAG_FIRST_PIPE_INSTANCE,
                PIPE_TYPE_MESSAGE | PIPE_READMODE_MESSAGE | PIPE_WAIT,
                1,
                PIPE_BUFFER_SIZE,
                PIPE_BUFFER_SIZE,
                0,
                std::ptr::null(),
            )
        };
        Self::channel(name, handle)
    }

    fn open_channel(&self, name: &str) -> Result<Box<dyn AttachChannel>> {
        let path = wide(&format!("{}{}", PIPE_PREFIX, name));
        let handle = unsafe {
            CreateFileW(
                path.as_ptr(),
                GENERIC_READ | GENERIC_WRITE,
                0,
                std::ptr::null(),
                OPEN_EXISTING,
                0,
                std::ptr::null_mut(),
            )
        };
        Self::channel(name, handle)
    }

    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}
