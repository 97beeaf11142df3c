use std::time::Duration;

/// Errors raised by the framing layer.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// A byte write ended in the middle of a word; the residue was dropped.
    #[error("unaligned write: {dropped} trailing byte(s) dropped")]
    Alignment { dropped: usize },

    /// The transport reported a hard failure. Fatal for the owning task.
    #[error("transport {op} failed after {transferred} of {expected} bytes")]
    TransportFailed {
        op: &'static str,
        transferred: usize,
        expected: usize,
    },

    /// The transport timed out before the whole packet was written.
    #[error("transport {op} timed out after {timeout:?} ({transferred} of {expected} bytes)")]
    Timeout {
        op: &'static str,
        timeout: Duration,
        transferred: usize,
        expected: usize,
    },

    /// A received header declared more body words than the receive buffer holds.
    #[error("declared frame length {declared} words exceeds receive capacity {capacity}")]
    Overflow { declared: usize, capacity: usize },

    /// The frame callback panicked.
    #[error("frame callback failed: {0}")]
    Callback(String),

    /// Message ids are 3 bits wide.
    #[error("message id {0} out of range (max 7)")]
    InvalidMessageId(u8),

    /// Body does not fit the header's length field.
    #[error("frame body too long ({words} words, max {max})")]
    BodyTooLong { words: usize, max: usize },

    /// An I/O error outside the data path (e.g. spawning the reader thread).
    #[error("frame I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, FrameError>;
