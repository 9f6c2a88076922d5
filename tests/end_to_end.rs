//! Runs the status-flag model against real process memory: hand-assembled
//! code in a heap buffer, read and patched through the native probe.
#![cfg(all(target_os = "linux", target_arch = "x86_64"))]

use std::time::Duration;

use anti_profiler_framework::engine::environment::{
    AttachChannel, Environment, ImageInspector, MemoryRegion, OsServices, PointerWidth,
};
use anti_profiler_framework::platform::NativeMemory;
use anti_profiler_framework::{
    Config, Error, ProfilerGuard, ProfilerStatus, Result, RuntimeTarget, RuntimeVersion,
};

const CODE_SIZE: usize = 0x100;
const BUFFER_SIZE: usize = 0x200;

/// Heap buffer posing as a loaded image: code first, status word after it.
struct FakeImage {
    base: usize,
    text: MemoryRegion,
}

impl ImageInspector for FakeImage {
    fn module_name(&self) -> &str {
        "fake-runtime"
    }

    fn pointer_width(&self) -> PointerWidth {
        PointerWidth::Eight
    }

    fn section(&self, name: &str) -> Option<MemoryRegion> {
        (name == ".text").then_some(self.text)
    }

    fn is_valid_range(&self, address: usize, len: usize) -> bool {
        MemoryRegion::new(self.base, BUFFER_SIZE).contains(address, len)
    }
}

struct NoChannels;

impl OsServices for NoChannels {
    fn process_id(&self) -> u32 {
        std::process::id()
    }

    fn create_channel(&self, _name: &str) -> Result<Box<dyn AttachChannel>> {
        Err(Error::Unsupported("attach channel"))
    }

    fn open_channel(&self, _name: &str) -> Result<Box<dyn AttachChannel>> {
        Err(Error::Unsupported("attach channel"))
    }

    fn sleep(&self, _duration: Duration) {}
}

struct Fixture {
    buffer: Box<[u8]>,
    status: usize,
}

impl Fixture {
    /// `references` copies of `test byte [rip+disp], 6` aimed at one
    /// aligned status byte.
    fn new(references: usize, status: u8) -> Self {
        let mut buffer = vec![0x90u8; BUFFER_SIZE].into_boxed_slice();
        let base = buffer.as_ptr() as usize;
        let status_offset = (CODE_SIZE..).find(|o| (base + o) % 8 == 0).unwrap();
        let status_address = base + status_offset;

        let mut at = 0;
        for _ in 0..references {
            let end = base + at + 7;
            let disp = (status_address as i64 - end as i64) as i32;
            buffer[at..at + 2].copy_from_slice(&[0xF6, 0x05]);
            buffer[at + 2..at + 6].copy_from_slice(&disp.to_le_bytes());
            buffer[at + 6] = 0x06;
            buffer[at + 7..at + 9].copy_from_slice(&[0x75, 0x02]);
            at += 11;
        }
        buffer[status_offset] = status;

        Self {
            buffer,
            status: status_address,
        }
    }

    fn base(&self) -> usize {
        self.buffer.as_ptr() as usize
    }

    fn guard(&self, text: MemoryRegion) -> ProfilerGuard {
        let env = Environment::new(
            Box::new(FakeImage {
                base: self.base(),
                text,
            }),
            Box::new(NativeMemory),
            Box::new(NoChannels),
        );
        let config = Config::default()
            .with_runtime(RuntimeTarget::new("fake-runtime", RuntimeVersion::V2_0_50727));
        ProfilerGuard::with_environment(config, env)
    }

    fn text(&self) -> MemoryRegion {
        MemoryRegion::new(self.base(), CODE_SIZE)
    }

    fn status_byte(&self) -> u8 {
        unsafe { std::ptr::read_volatile(self.status as *const u8) }
    }
}

#[test]
fn test_detects_and_silences_profiler() {
    let fixture = Fixture::new(6, 0b0000_0110);
    let mut guard = fixture.guard(fixture.text());

    assert!(guard.initialize());
    assert_eq!(guard.report().unwrap().status_address, Some(fixture.status));
    assert!(guard.was_profiler_attached());
    assert!(guard.is_profiler_attached());
    assert_eq!(guard.status(), Some(ProfilerStatus::Flags(0b110)));

    assert!(guard.prevent_active_profiler_from_receiving_messages());
    assert_eq!(fixture.status_byte(), 0);
    assert!(!guard.is_profiler_attached());
    assert!(guard.was_profiler_attached());
}

#[test]
fn test_clean_process() {
    let fixture = Fixture::new(8, 0b1000_0001);
    let mut guard = fixture.guard(fixture.text());

    assert!(guard.initialize());
    assert!(!guard.was_profiler_attached());
    assert!(!guard.is_profiler_attached());
    assert!(guard.prevent_active_profiler_from_receiving_messages());
    assert_eq!(fixture.status_byte(), 0b1000_0001);
}

#[test]
fn test_too_few_references() {
    let fixture = Fixture::new(4, 0b0000_0110);
    let mut guard = fixture.guard(fixture.text());

    assert!(!guard.initialize());
    assert!(!guard.is_profiler_attached());
    assert!(!guard.prevent_active_profiler_from_receiving_messages());
    assert_eq!(fixture.status_byte(), 0b110);
}

#[test]
fn test_unmapped_section_is_survived() {
    let fixture = Fixture::new(6, 0b0000_0110);
    let mut guard = fixture.guard(MemoryRegion::new(0x1000, 0x2000));

    assert!(!guard.initialize());
    assert!(!guard.was_profiler_attached());
    assert_eq!(fixture.status_byte(), 0b110);
}
