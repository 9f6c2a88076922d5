//! Variant B: profiler control block.
//!
//! Newer runtimes keep a small global block:
//!
//! ```text
//! +0            opaque pointer
//! +width        event mask (u32)
//! +width + 4    status (u32, 0..=4, 4 = active)
//! ```
//!
//! The status field is found through the compares against 4 sprinkled over
//! the runtime's code; the block base follows from the fixed layout. The
//! block is only half the job: this variant also races the runtime for the
//! attach channel.

use crate::config::{Config, RuntimeVersion};
use crate::detectors::arbiter::{ArbiterReport, AttachArbiter};
use crate::detectors::ProfilerStatus;
use crate::engine::environment::{
    AttachChannel, Environment, PointerWidth, ProcessMemory, ProcessMemoryExt,
};
use crate::scan::signatures::CONTROL_BLOCK_STATUS_CHECKS;
use crate::scan::{MemoryView, SignatureScanner, MIN_CONFIDENCE};

/// Highest status code the runtime uses.
pub const MAX_STATUS_CODE: u32 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlBlock {
    base: usize,
    width: PointerWidth,
}

impl ControlBlock {
    /// Block whose status field lives at `status`.
    pub fn from_status_address(status: usize, width: PointerWidth) -> Option<Self> {
        let base = status.checked_sub(width.bytes() + 4)?;
        Some(Self { base, width })
    }

    pub fn base(&self) -> usize {
        self.base
    }

    pub fn event_mask_address(&self) -> usize {
        self.base + self.width.bytes()
    }

    pub fn status_address(&self) -> usize {
        self.base + self.width.bytes() + 4
    }
}

#[derive(Debug, Default)]
pub struct ControlBlockDetector {
    block: Option<ControlBlock>,
    was_attached: bool,
    arbiter: Option<ArbiterReport>,
    /// Held for the life of the process once won.
    channel: Option<Box<dyn AttachChannel>>,
}

impl ControlBlockDetector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Locates the control block and latches the initial attach state, then
    /// races for the attach channel whether or not the block was found.
    /// Returns whether the block was found; the channel outcome is only
    /// reported.
    pub fn initialize(&mut self, env: &Environment, config: &Config, version: RuntimeVersion) -> bool {
        self.block = Self::locate(env);
        if let Some(block) = self.block {
            self.was_attached = self.is_attached(&*env.memory);
            log::info!(
                "[CONTROL] Control block at {:#x}, attached: {}",
                block.base(),
                self.was_attached
            );
        }

        let (report, channel) = AttachArbiter::new(env, config).run(version);
        self.arbiter = Some(report);
        self.channel = channel;
        self.block.is_some()
    }

    fn locate(env: &Environment) -> Option<ControlBlock> {
        let Some(text) = env.image.section(".text") else {
            log::info!("[CONTROL] {} has no code section", env.image.module_name());
            return None;
        };
        let view = MemoryView::capture(&*env.memory, text)?;

        let memory: &dyn ProcessMemory = &*env.memory;
        let scanner = SignatureScanner::new(&*env.image, memory);
        let tally = scanner.scan(&view, CONTROL_BLOCK_STATUS_CHECKS, |m| {
            memory
                .read_u32(m.address)
                .is_some_and(|code| code <= MAX_STATUS_CODE)
        });

        let Some(status) = tally.pick(MIN_CONFIDENCE) else {
            log::info!(
                "[CONTROL] Status field not found ({} candidates, best count {})",
                tally.len(),
                tally.max_count()
            );
            return None;
        };
        ControlBlock::from_status_address(status, scanner.pointer_width())
    }

    pub fn block(&self) -> Option<ControlBlock> {
        self.block
    }

    pub fn arbiter_report(&self) -> Option<&ArbiterReport> {
        self.arbiter.as_ref()
    }

    pub fn status(&self, memory: &dyn ProcessMemory) -> Option<ProfilerStatus> {
        let block = self.block?;
        memory
            .read_u32(block.status_address())
            .and_then(ProfilerStatus::from_code)
    }

    /// Nonzero status counts as attached, including the transitional codes.
    pub fn is_attached(&self, memory: &dyn ProcessMemory) -> bool {
        let Some(block) = self.block else {
            return false;
        };
        memory
            .read_u32(block.status_address())
            .is_some_and(|code| code != 0)
    }

    pub fn was_attached(&self) -> bool {
        self.was_attached
    }

    pub fn event_mask(&self, memory: &dyn ProcessMemory) -> Option<u32> {
        memory.read_u32(self.block?.event_mask_address())
    }

    /// Marks the profiler as detached so the runtime stops calling into it.
    pub fn mitigate(&self, memory: &dyn ProcessMemory) -> bool {
        match self.block {
            Some(block) => memory.write_u32(block.status_address(), 0),
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detectors::arbiter::{channel_name, ChannelOutcome};
    use crate::test::{CodeBuilder, ListenerExit, SimProcess};

    const TEXT: usize = 0x3000_0000;
    const DATA: usize = 0x3010_0000;
    const BLOCK: usize = DATA + 0x80;

    fn status_at(width: PointerWidth) -> usize {
        BLOCK + width.bytes() + 4
    }

    fn process(width: PointerWidth, references: usize, status: u32) -> SimProcess {
        let sim = SimProcess::new(width);
        sim.map(DATA, 0x1000, true);
        sim.poke_u32(BLOCK + width.bytes(), 0x0000_0F01);
        sim.poke_u32(status_at(width), status);

        let target = status_at(width);
        let mut code = CodeBuilder::new(TEXT, width);
        for i in 0..references {
            match i % 3 {
                0 => code.operand(&[0x83, 0x3D], target, &[0x04], 1),
                1 => code.operand(&[0x8B, 0x05], target, &[0x83, 0xF8, 0x04], 0),
                _ if width == PointerWidth::Four => {
                    code.operand(&[0xA1], target, &[0x83, 0xF8, 0x04], 0)
                }
                _ => code.operand(&[0x83, 0x3D], target, &[0x04], 1),
            };
            code.raw(&[0x74, 0x05]).filler(2);
        }
        code.install(&sim, ".text");
        sim
    }

    fn initialize(sim: &SimProcess) -> ControlBlockDetector {
        let env = sim.environment();
        let mut detector = ControlBlockDetector::new();
        detector.initialize(&env, &Config::default(), RuntimeVersion::V4_0_30319);
        detector
    }

    #[test]
    fn test_block_layout() {
        let block = ControlBlock::from_status_address(0x1010, PointerWidth::Eight).unwrap();
        assert_eq!(block.base(), 0x1004);
        assert_eq!(block.event_mask_address(), 0x100C);
        assert_eq!(block.status_address(), 0x1010);

        let block = ControlBlock::from_status_address(0x1010, PointerWidth::Four).unwrap();
        assert_eq!(block.base(), 0x1008);
        assert!(ControlBlock::from_status_address(4, PointerWidth::Eight).is_none());
    }

    #[test]
    fn test_locates_block_for_both_widths() {
        for width in [PointerWidth::Four, PointerWidth::Eight] {
            let sim = process(width, 6, 0);
            let env = sim.environment();
            let detector = initialize(&sim);
            assert_eq!(detector.block().map(|b| b.base()), Some(BLOCK));
            assert_eq!(detector.event_mask(&*env.memory), Some(0x0F01));
            assert_eq!(detector.status(&*env.memory), Some(ProfilerStatus::Detached));
            assert!(!detector.was_attached());
        }
    }

    #[test]
    fn test_below_threshold_stays_unresolved() {
        let sim = process(PointerWidth::Eight, 4, 4);
        let env = sim.environment();
        let mut detector = ControlBlockDetector::new();
        assert!(!detector.initialize(&env, &Config::default(), RuntimeVersion::V4_0_30319));
        assert!(detector.block().is_none());
        assert!(!detector.is_attached(&*env.memory));
        assert!(!detector.was_attached());
        assert!(!detector.mitigate(&*env.memory));
        assert_eq!(sim.peek_u32(status_at(PointerWidth::Eight)), 4);
    }

    #[test]
    fn test_channel_seized_without_control_block() {
        let sim = process(PointerWidth::Eight, 0, 0);
        let name = channel_name(4242, RuntimeVersion::V4_0_30319);
        sim.runtime_listener(&name, ListenerExit::AfterPoke { sleeps: 1 });

        let env = sim.environment();
        let mut detector = ControlBlockDetector::new();
        assert!(!detector.initialize(&env, &Config::default(), RuntimeVersion::V4_0_30319));
        assert!(detector.block().is_none());
        assert!(!detector.was_attached());

        let report = detector.arbiter_report().unwrap();
        assert_eq!(report.outcome, ChannelOutcome::Evicted { attempts: 2 });
        assert_eq!(sim.open_calls(), 1);
        assert!(sim.channel_exists(&name));

        drop(detector);
        assert!(!sim.channel_exists(&name));
    }

    #[test]
    fn test_free_channel_created_without_control_block() {
        let sim = process(PointerWidth::Four, 2, 0);
        let name = channel_name(4242, RuntimeVersion::V4_0_30319);
        let detector = initialize(&sim);
        assert!(detector.block().is_none());
        assert_eq!(
            detector.arbiter_report().map(|r| r.outcome),
            Some(ChannelOutcome::Created)
        );
        assert!(sim.channel_exists(&name));
    }

    #[test]
    fn test_out_of_range_status_rejected() {
        let sim = process(PointerWidth::Four, 9, 7);
        let detector = initialize(&sim);
        assert!(detector.block().is_none());
    }

    #[test]
    fn test_latch_and_mitigation() {
        let sim = process(PointerWidth::Eight, 6, 4);
        let env = sim.environment();
        let detector = initialize(&sim);
        assert!(detector.was_attached());
        assert!(detector.is_attached(&*env.memory));
        assert_eq!(detector.status(&*env.memory), Some(ProfilerStatus::Active));

        assert!(detector.mitigate(&*env.memory));
        assert_eq!(sim.peek_u32(status_at(PointerWidth::Eight)), 0);
        assert!(!detector.is_attached(&*env.memory));
        assert!(detector.was_attached());

        assert!(detector.mitigate(&*env.memory));
        assert_eq!(sim.peek_u32(status_at(PointerWidth::Eight)), 0);
        assert_eq!(sim.peek_u32(BLOCK + 8), 0x0F01);
    }

    #[test]
    fn test_transitional_status_counts_as_attached() {
        let sim = process(PointerWidth::Four, 6, 1);
        let env = sim.environment();
        let detector = initialize(&sim);
        assert!(detector.was_attached());
        assert_eq!(detector.status(&*env.memory), Some(ProfilerStatus::Detaching));
    }

    #[test]
    fn test_channel_is_retained() {
        let sim = process(PointerWidth::Eight, 6, 0);
        let name = channel_name(4242, RuntimeVersion::V4_0_30319);
        sim.runtime_listener(&name, ListenerExit::AfterPoke { sleeps: 2 });

        let detector = initialize(&sim);
        let report = detector.arbiter_report().unwrap();
        assert_eq!(report.outcome, ChannelOutcome::Evicted { attempts: 3 });
        assert!(sim.channel_exists(&name));

        drop(detector);
        assert!(!sim.channel_exists(&name));
    }

    #[test]
    fn test_channel_failure_does_not_fail_initialization() {
        let sim = process(PointerWidth::Eight, 6, 0);
        let name = channel_name(4242, RuntimeVersion::V4_0_30319);
        sim.runtime_listener(&name, ListenerExit::Never);

        let env = sim.environment();
        let config = Config {
            retry_attempts: 3,
            ..Config::default()
        };
        let mut detector = ControlBlockDetector::new();
        assert!(detector.initialize(&env, &config, RuntimeVersion::V4_0_30319));
        assert!(!detector.arbiter_report().unwrap().owns_channel());
        assert_eq!(sim.sleeps().len(), 3);
    }
}
