//! Runtime profiler models.
//!
//! One module per known layout of the runtime's profiler bookkeeping, plus
//! the attach-channel arbiter used by the newer layout.

pub mod arbiter;
pub mod control_block;
pub mod status_flag;

pub use arbiter::{channel_name, ArbiterReport, AttachArbiter, ChannelOutcome};
pub use control_block::{ControlBlock, ControlBlockDetector};
pub use status_flag::StatusFlagDetector;

/// Bits of the variant A status word that mean attaching, attached or
/// detaching.
pub const STATUS_FLAG_BITS: u8 = 0b110;

/// Current profiler state as read from the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProfilerStatus {
    /// Raw status word of the bit-flag layout.
    Flags(u8),
    Detached,
    Detaching,
    InitializingForStartup,
    InitializingForAttach,
    Active,
}

impl ProfilerStatus {
    /// Maps a control block status code. Codes above 4 do not exist.
    pub fn from_code(code: u32) -> Option<Self> {
        Some(match code {
            0 => ProfilerStatus::Detached,
            1 => ProfilerStatus::Detaching,
            2 => ProfilerStatus::InitializingForStartup,
            3 => ProfilerStatus::InitializingForAttach,
            4 => ProfilerStatus::Active,
            _ => return None,
        })
    }

    pub fn is_attached(self) -> bool {
        match self {
            ProfilerStatus::Flags(bits) => bits & STATUS_FLAG_BITS != 0,
            ProfilerStatus::Detached => false,
            _ => true,
        }
    }
}
