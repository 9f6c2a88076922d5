//! Linux backend.
//!
//! - Image layout comes from `/proc/self/maps`: the module's first executable
//!   mapping stands in for `.text`, the first read-only mapping after it for
//!   `.rdata`, the first writable one for `.data`. Anonymous mappings glued to
//!   the end of the module (bss) count as part of it.
//! - Protection changes use `mprotect`, with the previous protection taken
//!   from the maps file.
//! - The attach channel is an abstract-namespace Unix socket. Binding is
//!   exclusive, which gives the same first-creator-wins rule as a
//!   single-instance pipe.

use std::fs;
use std::os::linux::net::SocketAddrExt;
use std::os::unix::net::{SocketAddr, UnixListener, UnixStream};
use std::time::Duration;

use crate::config::{known_version, RuntimeTarget};
use crate::engine::environment::{
    AttachChannel, Environment, ImageInspector, MemoryRegion, OsServices, PointerWidth,
    ProcessMemory, Protection,
};
use crate::engine::fault;
use crate::error::{Error, Result};

pub(super) struct Backend;

impl Backend {
    pub fn detect_runtime(&self) -> Option<RuntimeTarget> {
        let maps = read_maps().ok()?;
        maps.iter().find_map(|m| {
            let name = m.file_name()?;
            known_version(name).map(|version| RuntimeTarget::new(name, version))
        })
    }

    pub fn environment(&self, target: &RuntimeTarget) -> Result<Environment> {
        let image = MapsImage::locate(&target.module)?;
        Ok(Environment::new(
            Box::new(image),
            Box::new(NativeMemory),
            Box::new(NativeOs),
        ))
    }
}

/// One line of `/proc/self/maps`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mapping {
    pub start: usize,
    pub end: usize,
    pub perms: String,
    pub path: Option<String>,
}

impl Mapping {
    fn perm(&self, index: usize, flag: u8) -> bool {
        self.perms.as_bytes().get(index) == Some(&flag)
    }

    pub fn readable(&self) -> bool {
        self.perm(0, b'r')
    }

    pub fn writable(&self) -> bool {
        self.perm(1, b'w')
    }

    pub fn executable(&self) -> bool {
        self.perm(2, b'x')
    }

    pub fn region(&self) -> MemoryRegion {
        MemoryRegion::new(self.start, self.end - self.start)
    }

    /// Last path component, for file-backed mappings.
    pub fn file_name(&self) -> Option<&str> {
        let path = self.path.as_deref()?;
        if path.starts_with('[') {
            return None;
        }
        let path = path.strip_suffix(" (deleted)").unwrap_or(path);
        path.rsplit('/').next()
    }

    /// `PROT_*` bits matching the permission string.
    pub fn prot(&self) -> libc::c_int {
        let mut prot = libc::PROT_NONE;
        if self.readable() {
            prot |= libc::PROT_READ;
        }
        if self.writable() {
            prot |= libc::PROT_WRITE;
        }
        if self.executable() {
            prot |= libc::PROT_EXEC;
        }
        prot
    }
}

/// Parses the contents of a maps file.
pub fn parse_maps(text: &str) -> Result<Vec<Mapping>> {
    text.lines()
        .filter(|line| !line.trim().is_empty())
        .map(parse_line)
        .collect()
}

fn parse_line(line: &str) -> Result<Mapping> {
    let malformed = || Error::MapsParse(line.to_string());

    // address perms offset dev inode [path]
    let mut fields = line.splitn(6, ' ').filter(|f| !f.is_empty());
    let range = fields.next().ok_or_else(malformed)?;
    let perms = fields.next().ok_or_else(malformed)?;
    for _ in 0..3 {
        fields.next().ok_or_else(malformed)?;
    }
    let path = fields
        .next()
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(str::to_string);

    let (start, end) = range.split_once('-').ok_or_else(malformed)?;
    let start = usize::from_str_radix(start, 16).map_err(|_| malformed())?;
    let end = usize::from_str_radix(end, 16).map_err(|_| malformed())?;
    if end <= start || perms.len() != 4 {
        return Err(malformed());
    }

    Ok(Mapping {
        start,
        end,
        perms: perms.to_string(),
        path,
    })
}

fn read_maps() -> Result<Vec<Mapping>> {
    parse_maps(&fs::read_to_string("/proc/self/maps")?)
}

/// Image inspector over the module's mappings.
#[derive(Debug, Clone)]
pub struct MapsImage {
    module: String,
    mappings: Vec<Mapping>,
    text: Option<MemoryRegion>,
    rdata: Option<MemoryRegion>,
    data: Option<MemoryRegion>,
}

impl MapsImage {
    /// Inspector for `module` as currently mapped into this process.
    pub fn locate(module: &str) -> Result<Self> {
        Self::from_mappings(module, read_maps()?)
    }

    pub fn from_mappings(module: &str, all: Vec<Mapping>) -> Result<Self> {
        let mut mappings: Vec<Mapping> = Vec::new();
        for m in all {
            let named = m.file_name() == Some(module);
            let bss = m.path.is_none() && mappings.last().is_some_and(|prev| prev.end == m.start);
            if named || bss {
                mappings.push(m);
            }
        }
        if mappings.is_empty() {
            return Err(Error::NotFound(format!("module {}", module)));
        }

        let text = mappings.iter().find(|m| m.executable()).map(Mapping::region);
        let rdata = text.and_then(|t| {
            mappings
                .iter()
                .find(|m| m.start >= t.end() && m.readable() && !m.writable() && !m.executable())
                .map(Mapping::region)
        });
        let data = mappings.iter().find(|m| m.writable()).map(Mapping::region);
        log::debug!(
            "[PLATFORM] {}: text={:x?} rdata={:x?} data={:x?}",
            module,
            text,
            rdata,
            data
        );

        Ok(Self {
            module: module.to_string(),
            mappings,
            text,
            rdata,
            data,
        })
    }
}

impl ImageInspector for MapsImage {
    fn module_name(&self) -> &str {
        &self.module
    }

    fn pointer_width(&self) -> PointerWidth {
        PointerWidth::native()
    }

    fn section(&self, name: &str) -> Option<MemoryRegion> {
        match name {
            ".text" => self.text,
            ".rdata" => self.rdata,
            ".data" => self.data,
            _ => None,
        }
    }

    fn is_valid_range(&self, address: usize, len: usize) -> bool {
        self.mappings
            .iter()
            .any(|m| m.readable() && m.region().contains(address, len))
    }
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
        let previous = read_maps()?
            .iter()
            .find(|m| m.region().contains(address, 1))
            .map(Mapping::prot)
            .ok_or_else(|| Error::NotFound(format!("mapping of {:#x}", address)))?;
        protect(address, len, previous | libc::PROT_WRITE)?;
        Ok(Protection(previous as u32))
    }

    fn restore_protection(&self, address: usize, len: usize, previous: Protection) -> Result<()> {
        protect(address, len, previous.0 as libc::c_int)
    }
}

fn page_size() -> usize {
    match unsafe { libc::sysconf(libc::_SC_PAGESIZE) } {
        size if size > 0 => size as usize,
        _ => 0x1000,
    }
}

fn protect(address: usize, len: usize, prot: libc::c_int) -> Result<()> {
    let page = page_size();
    let start = address & !(page - 1);
    let end = address
        .checked_add(len.max(1))
        .and_then(|end| end.checked_add(page - 1))
        .map(|end| end & !(page - 1))
        .ok_or(Error::Protection {
            address,
            len,
            code: libc::EINVAL,
        })?;

    if unsafe { libc::mprotect(start as *mut libc::c_void, end - start, prot) } != 0 {
        let code = std::io::Error::last_os_error().raw_os_error().unwrap_or(0);
        return Err(Error::Protection { address, len, code });
    }
    Ok(())
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NativeOs;

impl NativeOs {
    fn address(name: &str) -> Result<SocketAddr> {
        Ok(SocketAddr::from_abstract_name(name.as_bytes())?)
    }
}

impl OsServices for NativeOs {
    fn process_id(&self) -> u32 {
        std::process::id()
    }

    fn create_channel(&self, name: &str) -> Result<Box<dyn AttachChannel>> {
        let listener = UnixListener::bind_addr(&Self::address(name)?).map_err(|e| {
            Error::ChannelUnavailable {
                name: name.to_string(),
                code: e.raw_os_error().unwrap_or(0),
            }
        })?;
        Ok(Box::new(SocketChannel {
            name: name.to_string(),
            _socket: Socket::Listener(listener),
        }))
    }

    fn open_channel(&self, name: &str) -> Result<Box<dyn AttachChannel>> {
        let stream = UnixStream::connect_addr(&Self::address(name)?).map_err(|e| {
            Error::ChannelUnavailable {
                name: name.to_string(),
                code: e.raw_os_error().unwrap_or(0),
            }
        })?;
        Ok(Box::new(SocketChannel {
            name: name.to_string(),
            _socket: Socket::Stream(stream),
        }))
    }

    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

#[derive(Debug)]
#[allow(dead_code)] // Held only to keep the descriptor open
enum Socket {
    Listener(UnixListener),
    Stream(UnixStream),
}

#[derive(Debug)]
struct SocketChannel {
    name: String,
    _socket: Socket,
}

impl AttachChannel for SocketChannel {
    fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::environment::ProcessMemoryExt;

    const MAPS: &str = "\
00400000-00452000 r-xp 00000000 08:02 173521      /usr/lib/libruntime.so
00651000-00652000 r--p 00051000 08:02 173521      /usr/lib/libruntime.so
00652000-00655000 rw-p 00052000 08:02 173521      /usr/lib/libruntime.so
00655000-00657000 rw-p 00000000 00:00 0
00e03000-00e24000 rw-p 00000000 00:00 0           [heap]
7f0000000000-7f0000001000 r-xp 00000000 08:02 42  /opt/my app/libother.so
7ffd4a2e6000-7ffd4a307000 rw-p 00000000 00:00 0   [stack]
";

    #[test]
    fn test_parse_maps() {
        let maps = parse_maps(MAPS).unwrap();
        assert_eq!(maps.len(), 7);
        assert_eq!(maps[0].start, 0x400000);
        assert_eq!(maps[0].end, 0x452000);
        assert!(maps[0].executable() && !maps[0].writable());
        assert_eq!(maps[0].file_name(), Some("libruntime.so"));
        assert_eq!(maps[3].path, None);
        assert_eq!(maps[4].file_name(), None);
        assert_eq!(maps[5].file_name(), Some("libother.so"));
        assert_eq!(maps[2].prot(), libc::PROT_READ | libc::PROT_WRITE);
    }

    #[test]
    fn test_malformed_lines_rejected() {
        for line in [
            "zzzz-0040 r-xp 00000000 08:02 1 /x",
            "00400000 r-xp 00000000 08:02 1",
            "00400000-00300000 r-xp 00000000 08:02 1",
            "00400000-00500000 r-xp",
        ] {
            assert!(matches!(parse_maps(line), Err(Error::MapsParse(_))), "{}", line);
        }
    }

    #[test]
    fn test_sections_from_mappings() {
        let image = MapsImage::from_mappings("libruntime.so", parse_maps(MAPS).unwrap()).unwrap();
        assert_eq!(image.section(".text"), Some(MemoryRegion::new(0x400000, 0x52000)));
        assert_eq!(image.section(".rdata"), Some(MemoryRegion::new(0x651000, 0x1000)));
        assert_eq!(image.section(".data"), Some(MemoryRegion::new(0x652000, 0x3000)));
        assert_eq!(image.section(".reloc"), None);

        // bss directly after the module belongs to it, the heap does not.
        assert!(image.is_valid_range(0x656000, 4));
        assert!(!image.is_valid_range(0xe03000, 4));
        assert!(!image.is_valid_range(0x452000, 4));
    }

    #[test]
    fn test_missing_module() {
        let result = MapsImage::from_mappings("clr.dll", parse_maps(MAPS).unwrap());
        assert!(matches!(result, Err(Error::NotFound(_))));
    }

    #[test]
    fn test_own_maps_parse() {
        let maps = read_maps().unwrap();
        assert!(maps.iter().any(|m| m.executable()));
    }

    #[test]
    fn test_channel_is_single_instance() {
        let os = NativeOs;
        let name = format!("apf-test-{}-single", std::process::id());

        let owner = os.create_channel(&name).unwrap();
        assert_eq!(owner.name(), name);
        assert!(matches!(
            os.create_channel(&name),
            Err(Error::ChannelUnavailable { .. })
        ));

        let client = os.open_channel(&name).unwrap();
        drop(client);
        drop(owner);

        assert!(os.open_channel(&name).is_err());
        assert!(os.create_channel(&name).is_ok());
    }

    #[test]
    #[cfg(target_arch = "x86_64")]
    fn test_protection_round_trip() {
        let page = page_size();
        let address = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                page,
                libc::PROT_READ,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        assert_ne!(address, libc::MAP_FAILED);
        let address = address as usize;
        let memory = NativeMemory;

        assert!(!memory.write_u32(address, 1));
        let previous = memory.make_writable(address + 8, 4).unwrap();
        assert_eq!(previous, Protection(libc::PROT_READ as u32));
        assert!(memory.write_u32(address + 8, 0xABCD));
        memory.restore_protection(address + 8, 4, previous).unwrap();
        assert!(!memory.write_u32(address + 8, 0));
        assert_eq!(memory.read_u32(address + 8), Some(0xABCD));

        unsafe { libc::munmap(address as *mut libc::c_void, page) };
    }
}
