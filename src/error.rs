use thiserror::Error;

/// Failure of one of the fallible steps behind the public surface.
///
/// None of these ever reach the host through the facade functions; the
/// coordinator logs them and turns them into a boolean outcome.
#[derive(Error, Debug)]
pub enum Error {
    /// An OS call failed with an `io::Error` (maps file, sockets).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The named attach channel could not be created or opened.
    #[error("attach channel '{name}' unavailable (os error {code})")]
    ChannelUnavailable {
        /// Channel name without any platform prefix
        name: String,
        /// Raw OS error code reported by the platform
        code: i32,
    },

    /// Changing the protection of a memory range failed.
    #[error("could not change protection of {len:#x} bytes at {address:#x} (os error {code})")]
    Protection {
        /// First byte of the range
        address: usize,
        /// Length of the range in bytes
        len: usize,
        /// Raw OS error code reported by the platform
        code: i32,
    },

    /// A store faulted even though the range had been made writable.
    #[error("write of {len:#x} bytes at {address:#x} faulted")]
    WriteFaulted {
        /// First byte of the range
        address: usize,
        /// Length of the range in bytes
        len: usize,
    },

    /// A line of `/proc/self/maps` did not have the expected shape.
    #[error("malformed maps line: {0}")]
    MapsParse(String),

    /// The requested module or section is not present in this process.
    #[error("{0} not found")]
    NotFound(String),

    /// The current target has no backend for this operation.
    #[error("operation not supported on this platform: {0}")]
    Unsupported(&'static str),
}

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;
