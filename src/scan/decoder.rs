//! Mini x86/x64 decoder.
//!
//! Not a disassembler. It recognizes exactly the handful of encodings needed
//! to confirm the attach threading-mode check, which compiles to a switch on
//! a small integer:
//!
//! ```text
//! cmp   dword [mode], 2
//! jz    ...
//! test  reg, reg        ; or sub reg, reg
//! jz    ...
//! dec   reg
//! jz    ...
//! dec   reg
//! ```
//!
//! Every predicate either consumes one whole instruction or leaves the cursor
//! where it was.

use crate::engine::environment::PointerWidth;

/// Read position inside a code snapshot.
#[derive(Debug, Clone)]
pub struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
    width: PointerWidth,
}

impl<'a> Cursor<'a> {
    pub fn new(bytes: &'a [u8], pos: usize, width: PointerWidth) -> Self {
        Self { bytes, pos, width }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    fn byte(&self, ahead: usize) -> Option<u8> {
        self.bytes.get(self.pos.checked_add(ahead)?).copied()
    }

    /// Skips an optional REX prefix (0x40-0x4F). Only 8-byte builds have one;
    /// on 4-byte builds those bytes are `inc`/`dec` and are left alone.
    ///
    /// Returns the prefix, or 0 when none was skipped.
    pub fn skip_width_prefix(&mut self) -> u8 {
        if self.width != PointerWidth::Eight {
            return 0;
        }
        match self.byte(0) {
            Some(rex @ 0x40..=0x4F) => {
                self.pos += 1;
                rex
            }
            _ => 0,
        }
    }

    /// Skips `jz rel8` (`74 xx`) or `jz rel32` (`0F 84 xx xx xx xx`).
    pub fn skip_conditional_jump_zero(&mut self) -> bool {
        match (self.byte(0), self.byte(1)) {
            (Some(0x74), Some(_)) => {
                self.pos += 2;
                true
            }
            (Some(0x0F), Some(0x84)) if self.byte(5).is_some() => {
                self.pos += 6;
                true
            }
            _ => false,
        }
    }

    /// Skips `test r, r` (`85 /r`) or `sub r, r` (`29 /r`, `2B /r`) where both
    /// operands are the same register. Returns that register.
    pub fn skip_test_same_register(&mut self) -> Option<u8> {
        let start = self.pos;
        let rex = self.skip_width_prefix();

        let matched = match (self.byte(0), self.byte(1)) {
            (Some(0x85 | 0x29 | 0x2B), Some(modrm)) if modrm >> 6 == 0b11 => {
                let reg = ((modrm >> 3) & 7) | ((rex >> 2) & 1) << 3;
                let rm = (modrm & 7) | (rex & 1) << 3;
                (reg == rm).then_some(rm)
            }
            _ => None,
        };

        match matched {
            Some(register) => {
                self.pos += 2;
                Some(register)
            }
            None => {
                self.pos = start;
                None
            }
        }
    }

    /// Skips a single-register decrement: `48+r` (4-byte builds only) or
    /// `FF /1` with a register operand. Returns the register.
    pub fn skip_decrement_register(&mut self) -> Option<u8> {
        if self.width == PointerWidth::Four {
            if let Some(op @ 0x48..=0x4F) = self.byte(0) {
                self.pos += 1;
                return Some(op & 7);
            }
        }

        let start = self.pos;
        let rex = self.skip_width_prefix();
        match (self.byte(0), self.byte(1)) {
            (Some(0xFF), Some(modrm)) if modrm & 0xF8 == 0xC8 => {
                self.pos += 2;
                Some((modrm & 7) | (rex & 1) << 3)
            }
            _ => {
                self.pos = start;
                None
            }
        }
    }
}

/// Validates the instruction chain that follows `cmp dword [mode], 2`.
///
/// `pos` is the offset of the first byte after the compare. The same register
/// must be tested and then decremented twice.
pub fn is_attach_mode_switch(bytes: &[u8], pos: usize, width: PointerWidth) -> bool {
    let mut cursor = Cursor::new(bytes, pos, width);

    if !cursor.skip_conditional_jump_zero() {
        return false;
    }
    let Some(register) = cursor.skip_test_same_register() else {
        return false;
    };
    if !cursor.skip_conditional_jump_zero() {
        return false;
    }
    if cursor.skip_decrement_register() != Some(register) {
        return false;
    }
    if !cursor.skip_conditional_jump_zero() {
        return false;
    }
    cursor.skip_decrement_register() == Some(register)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_width_prefix_only_on_eight_byte_builds() {
        let bytes = [0x48, 0xFF, 0xC8];
        let mut wide = Cursor::new(&bytes, 0, PointerWidth::Eight);
        assert_eq!(wide.skip_width_prefix(), 0x48);
        assert_eq!(wide.position(), 1);

        let mut narrow = Cursor::new(&bytes, 0, PointerWidth::Four);
        assert_eq!(narrow.skip_width_prefix(), 0);
        assert_eq!(narrow.position(), 0);
    }

    #[test]
    fn test_conditional_jump_forms() {
        let short = [0x74, 0x10];
        let mut c = Cursor::new(&short, 0, PointerWidth::Four);
        assert!(c.skip_conditional_jump_zero());
        assert_eq!(c.position(), 2);

        let near = [0x0F, 0x84, 0x00, 0x01, 0x00, 0x00];
        let mut c = Cursor::new(&near, 0, PointerWidth::Eight);
        assert!(c.skip_conditional_jump_zero());
        assert_eq!(c.position(), 6);

        // jnz and a truncated near jump are rejected.
        for bytes in [&[0x75, 0x10][..], &[0x0F, 0x84, 0x00, 0x01][..]] {
            let mut c = Cursor::new(bytes, 0, PointerWidth::Four);
            assert!(!c.skip_conditional_jump_zero());
            assert_eq!(c.position(), 0);
        }
    }

    #[test]
    fn test_same_register_test_and_sub() {
        // test eax, eax / sub ecx, ecx / sub edx, edx (2B form)
        for (bytes, reg) in [([0x85, 0xC0], 0), ([0x29, 0xC9], 1), ([0x2B, 0xD2], 2)] {
            let mut c = Cursor::new(&bytes, 0, PointerWidth::Four);
            assert_eq!(c.skip_test_same_register(), Some(reg));
            assert_eq!(c.position(), 2);
        }

        // test eax, ecx is not a self test.
        let mut c = Cursor::new(&[0x85, 0xC8], 0, PointerWidth::Four);
        assert_eq!(c.skip_test_same_register(), None);
        assert_eq!(c.position(), 0);
    }

    #[test]
    fn test_same_register_with_rex() {
        // test r8d, r8d
        let bytes = [0x45, 0x85, 0xC0];
        let mut c = Cursor::new(&bytes, 0, PointerWidth::Eight);
        assert_eq!(c.skip_test_same_register(), Some(8));
        assert_eq!(c.position(), 3);

        // REX.B only: test eax, r8d
        let bytes = [0x41, 0x85, 0xC0];
        let mut c = Cursor::new(&bytes, 0, PointerWidth::Eight);
        assert_eq!(c.skip_test_same_register(), None);
        assert_eq!(c.position(), 0);
    }

    #[test]
    fn test_decrement_forms() {
        // dec ecx, one-byte form on 4-byte builds
        let mut c = Cursor::new(&[0x49], 0, PointerWidth::Four);
        assert_eq!(c.skip_decrement_register(), Some(1));

        // dec eax, FF /1
        let mut c = Cursor::new(&[0xFF, 0xC8], 0, PointerWidth::Four);
        assert_eq!(c.skip_decrement_register(), Some(0));
        assert_eq!(c.position(), 2);

        // dec r9 on 8-byte builds
        let mut c = Cursor::new(&[0x49, 0xFF, 0xC9], 0, PointerWidth::Eight);
        assert_eq!(c.skip_decrement_register(), Some(9));
        assert_eq!(c.position(), 3);

        // 0x49 alone is a REX prefix on 8-byte builds, not a decrement.
        let mut c = Cursor::new(&[0x49, 0x90], 0, PointerWidth::Eight);
        assert_eq!(c.skip_decrement_register(), None);
        assert_eq!(c.position(), 0);

        // inc eax (FF /0) is rejected.
        let mut c = Cursor::new(&[0xFF, 0xC0], 0, PointerWidth::Four);
        assert_eq!(c.skip_decrement_register(), None);
    }

    #[test]
    fn test_attach_mode_switch_chain() {
        // jz; test eax,eax; jz near; dec eax; jz; dec eax
        let x86 = [
            0x74, 0x20, 0x85, 0xC0, 0x0F, 0x84, 0x10, 0x00, 0x00, 0x00, 0x48, 0x74, 0x08, 0x48,
        ];
        assert!(is_attach_mode_switch(&x86, 0, PointerWidth::Four));

        // Same chain on x64 with FF /1 decrements.
        let x64 = [
            0x74, 0x20, 0x85, 0xC0, 0x74, 0x10, 0xFF, 0xC8, 0x74, 0x08, 0xFF, 0xC8,
        ];
        assert!(is_attach_mode_switch(&x64, 0, PointerWidth::Eight));

        // The one-byte decrement does not exist on x64.
        assert!(!is_attach_mode_switch(&x86, 0, PointerWidth::Eight));
    }

    #[test]
    fn test_attach_mode_switch_requires_one_register() {
        // test eax,eax then dec ecx
        let mixed = [0x74, 0x20, 0x85, 0xC0, 0x74, 0x10, 0x49, 0x74, 0x08, 0x49];
        assert!(!is_attach_mode_switch(&mixed, 0, PointerWidth::Four));

        // Truncated chain
        let short = [0x74, 0x20, 0x85, 0xC0, 0x74, 0x10, 0x48];
        assert!(!is_attach_mode_switch(&short, 0, PointerWidth::Four));
    }
}
