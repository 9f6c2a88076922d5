//! Signature tables.
//!
//! The byte idioms below are tied to particular runtime builds and are the
//! part most likely to need updating when the runtime changes. Each idiom is
//! `prefix, 32-bit operand, suffix`; the operand is an absolute address on
//! 4-byte builds and a RIP-relative displacement on 8-byte builds.

use crate::engine::environment::PointerWidth;

/// Addressing form of the 32-bit operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperandForm {
    /// ModRM `[disp32]`, which becomes `[rip + disp32]` on x64.
    Memory,
    /// `moffs32` of `mov eax, [moffs]`. On x64 the same opcode takes a 64-bit
    /// offset, so the idiom only exists on 4-byte builds.
    Moffs32,
}

#[derive(Debug, Clone, Copy)]
pub struct Idiom {
    pub name: &'static str,
    pub prefix: &'static [u8],
    pub form: OperandForm,
    pub suffix: &'static [u8],
    /// Suffix bytes that still belong to the instruction holding the operand.
    /// RIP-relative targets are computed from the end of that instruction.
    pub tail: usize,
}

impl Idiom {
    /// Total encoded length of the idiom.
    pub fn len(&self) -> usize {
        self.prefix.len() + 4 + self.suffix.len()
    }

    pub fn applies_to(&self, width: PointerWidth) -> bool {
        self.form == OperandForm::Memory || width == PointerWidth::Four
    }
}

/// `test byte [status], 6` on the two-bit profiler status flag.
pub const PROFILER_STATUS_TEST: &[Idiom] = &[Idiom {
    name: "test byte [status], 6",
    prefix: &[0xF6, 0x05],
    form: OperandForm::Memory,
    suffix: &[0x06],
    tail: 1,
}];

/// Loads of the control block status field followed by a compare to 4
/// (attached).
pub const CONTROL_BLOCK_STATUS_CHECKS: &[Idiom] = &[
    Idiom {
        name: "mov eax, [moffs]; cmp eax, 4",
        prefix: &[0xA1],
        form: OperandForm::Moffs32,
        suffix: &[0x83, 0xF8, 0x04],
        tail: 0,
    },
    Idiom {
        name: "mov eax, [status]; cmp eax, 4",
        prefix: &[0x8B, 0x05],
        form: OperandForm::Memory,
        suffix: &[0x83, 0xF8, 0x04],
        tail: 0,
    },
    Idiom {
        name: "cmp dword [status], 4",
        prefix: &[0x83, 0x3D],
        form: OperandForm::Memory,
        suffix: &[0x04],
        tail: 1,
    },
];

/// `cmp dword [mode], 2` at the head of the attach threading-mode switch.
pub const ATTACH_MODE_CHECK: &[Idiom] = &[Idiom {
    name: "cmp dword [mode], 2",
    prefix: &[0x83, 0x3D],
    form: OperandForm::Memory,
    suffix: &[0x02],
    tail: 1,
}];

/// Configuration option bounding how long the attach listener waits for a
/// trigger before exiting.
pub const ATTACH_TIMEOUT_OPTION: &str = "ProfAPIMaxWaitForTriggerMs";

/// Prefix of the runtime's profiler attach channel name.
pub const ATTACH_CHANNEL_PREFIX: &str = "CPFATP_";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_moffs_idiom_is_x86_only() {
        let moffs = &CONTROL_BLOCK_STATUS_CHECKS[0];
        assert!(moffs.applies_to(PointerWidth::Four));
        assert!(!moffs.applies_to(PointerWidth::Eight));
        assert!(CONTROL_BLOCK_STATUS_CHECKS[1..]
            .iter()
            .all(|i| i.applies_to(PointerWidth::Eight)));
    }

    #[test]
    fn test_idiom_lengths() {
        assert_eq!(PROFILER_STATUS_TEST[0].len(), 7);
        assert_eq!(CONTROL_BLOCK_STATUS_CHECKS[1].len(), 9);
        assert_eq!(ATTACH_MODE_CHECK[0].len(), 7);
    }
}
