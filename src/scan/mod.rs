//! Signature scanning: code snapshots, the mini decoder, idiom tables, the
//! scanner itself and the disambiguating tally.

pub mod decoder;
pub mod scanner;
pub mod signatures;
pub mod tally;
pub mod view;

pub use scanner::{Match, SignatureScanner};
pub use tally::{CandidateTally, MIN_CONFIDENCE};
pub use view::MemoryView;
