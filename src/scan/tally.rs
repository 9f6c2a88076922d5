//! Hit counting and disambiguation.
//!
//! Coincidental byte matches in a multi-megabyte code section are common, but
//! they rarely point at the same address twice. The real structure is
//! referenced from many call sites, so the address with the most hits wins,
//! provided it clears a minimum count.

use std::collections::HashMap;

/// Fewest hits a winner needs before it is trusted.
pub const MIN_CONFIDENCE: u32 = 5;

/// Hit count at which a scan may stop early.
pub const EARLY_STOP: u32 = 50;

/// Candidate addresses and their hit counts, in first-seen order.
#[derive(Debug, Default, Clone)]
pub struct CandidateTally {
    entries: Vec<(usize, u32)>,
    index: HashMap<usize, usize>,
}

impl CandidateTally {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records one hit and returns the new count for `address`.
    pub fn record(&mut self, address: usize) -> u32 {
        match self.index.get(&address) {
            Some(&slot) => {
                self.entries[slot].1 += 1;
                self.entries[slot].1
            }
            None => {
                self.index.insert(address, self.entries.len());
                self.entries.push((address, 1));
                1
            }
        }
    }

    pub fn count(&self, address: usize) -> u32 {
        self.index
            .get(&address)
            .map_or(0, |&slot| self.entries[slot].1)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Highest count recorded so far.
    pub fn max_count(&self) -> u32 {
        self.entries.iter().map(|&(_, n)| n).max().unwrap_or(0)
    }

    /// Address with the strictly greatest count. Which of several tied
    /// addresses is returned is unspecified.
    pub fn best(&self) -> Option<(usize, u32)> {
        let mut best: Option<(usize, u32)> = None;
        for &(address, count) in &self.entries {
            if best.map_or(true, |(_, n)| count > n) {
                best = Some((address, count));
            }
        }
        best
    }

    /// The winning address, or `None` if it has fewer than `min_count` hits.
    pub fn pick(&self, min_count: u32) -> Option<usize> {
        match self.best() {
            Some((address, count)) if count >= min_count => Some(address),
            _ => None,
        }
    }
}
