//! Attach-Channel Arbiter
//!
//! The runtime accepts late-attaching profilers through a single-instance
//! named channel served by a listener thread. Whoever creates the channel
//! first owns it, so the arbiter tries to create it before the runtime does.
//! If the listener already holds it, the arbiter makes the listener give it
//! up:
//!
//! 1. Switch the listener's threading mode from always-on (2) to lazy (1), so
//!    it exits after serving a request instead of looping.
//! 2. Zero the default of the listener's wait timeout and scramble the
//!    option's name, so a registry override cannot bring the timeout back.
//! 3. Connect once and hang up, which wakes the listener.
//! 4. Retry creation on a bounded budget while the listener shuts down.
//!
//! Steps that find nothing are skipped. The race is lost gracefully: a
//! failure is reported, never retried past the budget.

use rand::Rng;

use crate::config::{Config, RuntimeVersion};
use crate::engine::environment::{
    is_aligned, AttachChannel, Environment, ProcessMemory, ProcessMemoryExt,
};
use crate::engine::protection::ProtectionGuard;
use crate::error::{Error, Result};
use crate::scan::decoder;
use crate::scan::signatures::{ATTACH_CHANNEL_PREFIX, ATTACH_MODE_CHECK, ATTACH_TIMEOUT_OPTION};
use crate::scan::{MemoryView, SignatureScanner};

/// Listener serves requests until the process exits.
pub const ATTACH_MODE_ALWAYS_ON: u32 = 2;
/// Listener exits once idle.
pub const ATTACH_MODE_LAZY: u32 = 1;

/// The mode check is confirmed instruction by instruction, so one validated
/// site is enough.
const ATTACH_MODE_MIN_HITS: u32 = 1;

/// Sections searched for the timeout configuration record, in order.
const RECORD_SECTIONS: [&str; 2] = [".rdata", ".text"];

/// Name of the attach channel the runtime serves for process `pid`.
pub fn channel_name(pid: u32, version: RuntimeVersion) -> String {
    format!("{}{}_v{}", ATTACH_CHANNEL_PREFIX, pid, version)
}

/// How the channel race ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelOutcome {
    /// Nobody held the channel; it was created on the first try.
    Created,
    /// The listener was evicted. `attempts` counts creation attempts after
    /// the listener was poked.
    Evicted { attempts: u32 },
    /// The listener kept the channel.
    Failed { attempts: u32 },
    /// The channel was busy and eviction is disabled.
    Busy,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArbiterReport {
    pub channel: String,
    pub outcome: ChannelOutcome,
    pub mode_downgraded: bool,
    pub timeout_neutralized: bool,
}

impl ArbiterReport {
    pub fn owns_channel(&self) -> bool {
        matches!(
            self.outcome,
            ChannelOutcome::Created | ChannelOutcome::Evicted { .. }
        )
    }
}

pub struct AttachArbiter<'a> {
    env: &'a Environment,
    config: &'a Config,
}

impl<'a> AttachArbiter<'a> {
    pub fn new(env: &'a Environment, config: &'a Config) -> Self {
        Self { env, config }
    }

    /// Runs the race. The returned channel, if any, must be kept open for as
    /// long as attaches should be refused.
    pub fn run(&self, version: RuntimeVersion) -> (ArbiterReport, Option<Box<dyn AttachChannel>>) {
        let name = channel_name(self.env.os.process_id(), version);
        let mut report = ArbiterReport {
            channel: name.clone(),
            outcome: ChannelOutcome::Busy,
            mode_downgraded: false,
            timeout_neutralized: false,
        };

        match self.env.os.create_channel(&name) {
            Ok(channel) => {
                log::info!("[ARBITER] Created {} before the runtime", name);
                report.outcome = ChannelOutcome::Created;
                return (report, Some(channel));
            }
            Err(e) => log::debug!("[ARBITER] {}", e),
        }

        if !self.config.allow_eviction {
            log::info!("[ARBITER] {} is held by the runtime; eviction disabled", name);
            return (report, None);
        }

        report.mode_downgraded = self.downgrade_attach_mode();
        report.timeout_neutralized = self.neutralize_timeout();
        self.poke_listener(&name);

        let (outcome, channel) = self.retry_create(&name);
        report.outcome = outcome;
        match outcome {
            ChannelOutcome::Evicted { attempts } => {
                log::info!("[ARBITER] Evicted listener from {} after {} attempts", name, attempts)
            }
            _ => log::warn!("[ARBITER] Listener kept {}: {:?}", name, outcome),
        }
        (report, channel)
    }

    /// Bounded retry: the configured tries with a sleep after each, then one
    /// last try. Total sleep never exceeds [`crate::config::MAX_RETRY_WAIT`].
    fn retry_create(&self, name: &str) -> (ChannelOutcome, Option<Box<dyn AttachChannel>>) {
        let os = &self.env.os;
        let (budget, interval) = self.config.retry_budget();
        let mut attempts = 0;

        for _ in 0..budget {
            attempts += 1;
            if let Ok(channel) = os.create_channel(name) {
                return (ChannelOutcome::Evicted { attempts }, Some(channel));
            }
            os.sleep(interval);
        }

        attempts += 1;
        match os.create_channel(name) {
            Ok(channel) => (ChannelOutcome::Evicted { attempts }, Some(channel)),
            Err(_) => (ChannelOutcome::Failed { attempts }, None),
        }
    }

    /// Connects and immediately hangs up to wake the listener.
    fn poke_listener(&self, name: &str) {
        match self.env.os.open_channel(name) {
            Ok(channel) => {
                log::debug!("[ARBITER] Poked listener on {}", channel.name());
                drop(channel);
            }
            Err(e) => log::debug!("[ARBITER] Could not poke listener: {}", e),
        }
    }

    /// Finds the threading-mode word through its switch and sets it to lazy.
    fn downgrade_attach_mode(&self) -> bool {
        let env = self.env;
        let Some(view) = env
            .image
            .section(".text")
            .and_then(|text| MemoryView::capture(&*env.memory, text))
        else {
            return false;
        };

        let scanner = SignatureScanner::new(&*env.image, &*env.memory);
        let width = scanner.pointer_width();
        let tally = scanner.scan(&view, ATTACH_MODE_CHECK, |m| {
            decoder::is_attach_mode_switch(m.view.bytes(), m.end, width)
        });
        let Some(address) = tally.pick(ATTACH_MODE_MIN_HITS) else {
            log::debug!("[ARBITER] Attach mode switch not found");
            return false;
        };

        match env.memory.read_u32(address) {
            Some(ATTACH_MODE_ALWAYS_ON) => {
                let written = env.memory.write_u32(address, ATTACH_MODE_LAZY);
                log::debug!("[ARBITER] Attach mode at {:#x} set to lazy: {}", address, written);
                written
            }
            Some(mode) => {
                log::debug!("[ARBITER] Attach mode at {:#x} is {}, left alone", address, mode);
                false
            }
            None => false,
        }
    }

    fn neutralize_timeout(&self) -> bool {
        let Some(record) = self.find_timeout_record() else {
            log::debug!("[ARBITER] Timeout record not found");
            return false;
        };
        match self.patch_timeout_record(record) {
            Ok(()) => {
                log::debug!("[ARBITER] Timeout record at {:#x} neutralized", record);
                true
            }
            Err(e) => {
                log::warn!("[ARBITER] Could not patch timeout record at {:#x}: {}", record, e);
                false
            }
        }
    }

    /// Address of the `{ name, default }` record for the timeout option.
    fn find_timeout_record(&self) -> Option<usize> {
        let env = self.env;
        RECORD_SECTIONS.iter().find_map(|&section| {
            let view = MemoryView::capture(&*env.memory, env.image.section(section)?)?;
            self.scan_for_record(&view)
        })
    }

    fn scan_for_record(&self, view: &MemoryView) -> Option<usize> {
        let width = self.env.pointer_width();
        let step = width.bytes();
        let skip = (step - view.base() % step) % step;

        (skip..view.len()).step_by(step).find_map(|offset| {
            let target = view.read_pointer(offset, width)?;
            (target != 0 && self.names_timeout_option(target)).then(|| view.address_of(offset))
        })
    }

    /// True if `address` holds the option name as NUL-terminated UTF-16,
    /// compared case-insensitively.
    fn names_timeout_option(&self, address: usize) -> bool {
        let expected: Vec<u16> = ATTACH_TIMEOUT_OPTION.encode_utf16().chain([0]).collect();
        let len = expected.len() * 2;
        if !is_aligned(address, 2) || !self.env.image.is_valid_range(address, len) {
            return false;
        }

        let mut raw = vec![0u8; len];
        if !self.env.memory.try_read(address, &mut raw) {
            return false;
        }
        raw.chunks_exact(2)
            .map(|c| u16::from_le_bytes([c[0], c[1]]))
            .zip(&expected)
            .all(|(found, &want)| fold_ascii(found) == fold_ascii(want))
    }

    fn patch_timeout_record(&self, record: usize) -> Result<()> {
        let memory: &dyn ProcessMemory = &*self.env.memory;
        let width = self.env.pointer_width();

        let default_at = record + width.bytes();
        {
            let _guard = ProtectionGuard::elevate(memory, default_at, 4)?;
            if !memory.write_u32(default_at, 0) {
                return Err(Error::WriteFaulted { address: default_at, len: 4 });
            }
        }

        let name_at = memory
            .read_pointer(record, width)
            .ok_or_else(|| Error::NotFound(format!("name pointer at {:#x}", record)))?;
        let scrambled = scrambled_name(ATTACH_TIMEOUT_OPTION.len());
        let _guard = ProtectionGuard::elevate(memory, name_at, scrambled.len())?;
        if !memory.try_write(name_at, &scrambled) {
            return Err(Error::WriteFaulted {
                address: name_at,
                len: scrambled.len(),
            });
        }
        Ok(())
    }
}

fn fold_ascii(unit: u16) -> u16 {
    match unit {
        0x41..=0x5A => unit + 0x20,
        _ => unit,
    }
}

/// `chars` random ASCII letters as UTF-16LE, without terminator.
fn scrambled_name(chars: usize) -> Vec<u8> {
    const LETTERS: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";
    let mut rng = rand::thread_rng();
    (0..chars)
        .map(|_| LETTERS[rng.gen_range(0..LETTERS.len())] as u16)
        .flat_map(u16::to_le_bytes)
        .collect()
}
