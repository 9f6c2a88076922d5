//! Signature Scanner
//!
//! Walks a code snapshot one byte at a time and tries every idiom of a
//! signature table at each offset. A literal match yields the address the
//! instruction references; the address becomes a candidate only if it is
//! 4-byte aligned, inside a range the image inspector vouches for, and
//! survives a trial read-then-store of its own value through the
//! fault-tolerant probe.

use crate::engine::environment::{is_aligned, ImageInspector, PointerWidth, ProcessMemory};
use crate::scan::signatures::{Idiom, OperandForm};
use crate::scan::tally::{CandidateTally, EARLY_STOP};
use crate::scan::view::MemoryView;

/// One literal idiom match whose operand resolved to a plausible address.
#[derive(Debug, Clone, Copy)]
pub struct Match<'v> {
    pub view: &'v MemoryView,
    pub idiom: &'static Idiom,
    /// Offset of the first idiom byte in the view.
    pub offset: usize,
    /// Offset just past the idiom.
    pub end: usize,
    /// Resolved operand address.
    pub address: usize,
}

pub struct SignatureScanner<'a> {
    image: &'a dyn ImageInspector,
    memory: &'a dyn ProcessMemory,
    width: PointerWidth,
    early_stop: u32,
}

impl<'a> SignatureScanner<'a> {
    pub fn new(image: &'a dyn ImageInspector, memory: &'a dyn ProcessMemory) -> Self {
        Self {
            image,
            memory,
            width: image.pointer_width(),
            early_stop: EARLY_STOP,
        }
    }

    /// Stops scanning once a candidate reaches `hits`.
    pub fn with_early_stop(mut self, hits: u32) -> Self {
        self.early_stop = hits.max(1);
        self
    }

    pub fn pointer_width(&self) -> PointerWidth {
        self.width
    }

    /// Resolves the operand of `idiom` matched at `offset`.
    pub fn resolve(&self, view: &MemoryView, offset: usize, idiom: &Idiom) -> Option<usize> {
        let operand_at = offset.checked_add(idiom.prefix.len())?;
        match (self.width, idiom.form) {
            (PointerWidth::Four, _) => view.read_u32(operand_at).map(|a| a as usize),
            (PointerWidth::Eight, OperandForm::Memory) => {
                let displacement = view.read_i32(operand_at)?;
                let next = view.address_of(operand_at + 4 + idiom.tail);
                next.checked_add_signed(displacement as isize)
            }
            (PointerWidth::Eight, OperandForm::Moffs32) => None,
        }
    }

    /// Structural validation of a resolved address.
    pub fn accepts(&self, address: usize) -> bool {
        is_aligned(address, 4) && self.image.is_valid_range(address, 4) && self.trial_access(address)
    }

    /// Reads the word and stores the same value back. A fault on either side
    /// rejects the address.
    fn trial_access(&self, address: usize) -> bool {
        let mut word = [0u8; 4];
        self.memory.try_read(address, &mut word) && self.memory.try_write(address, &word)
    }

    /// Scans `view` for `idioms`. `filter` gets the final say on every
    /// structurally valid match.
    pub fn scan<F>(&self, view: &MemoryView, idioms: &'static [Idiom], mut filter: F) -> CandidateTally
    where
        F: FnMut(&Match<'_>) -> bool,
    {
        let mut tally = CandidateTally::new();
        let idioms: Vec<&'static Idiom> = idioms.iter().filter(|i| i.applies_to(self.width)).collect();
        if idioms.is_empty() {
            return tally;
        }

        for offset in 0..view.len() {
            for &idiom in &idioms {
                if !view.matches_at(offset, idiom.prefix)
                    || !view.matches_at(offset + idiom.prefix.len() + 4, idiom.suffix)
                {
                    continue;
                }
                let Some(address) = self.resolve(view, offset, idiom) else {
                    continue;
                };
                if !self.accepts(address) {
                    continue;
                }

                let m = Match {
                    view,
                    idiom,
                    offset,
                    end: offset + idiom.len(),
                    address,
                };
                if !filter(&m) {
                    continue;
                }

                if tally.record(address) >= self.early_stop {
                    log::debug!(
                        "[SCAN] Early stop: {:#x} reached {} hits via '{}'",
                        address,
                        self.early_stop,
                        idiom.name
                    );
                    return tally;
                }
            }
        }

        log::debug!(
            "[SCAN] {} candidates in {:#x}+{:#x}, best count {}",
            tally.len(),
            view.base(),
            view.len(),
            tally.max_count()
        );
        tally
    }
}
