//! Bounded-timeout byte pipes.
//!
//! The framing layer only needs two primitives from the link to the device:
//! a blocking read and a blocking write, each bounded by a timeout and each
//! reporting a byte count plus a tri-state [`TransferStatus`]. The [`Pipe`]
//! trait captures exactly that. Implementations provided here:
//! - [`UnixPipe`]: Unix domain socket stand-in for a USB3 bulk pipe
//! - [`MemoryPipe`]: in-process loopback pair

pub mod error;
pub mod memory;
pub mod traits;

#[cfg(unix)]
pub mod uds;

pub use error::{Result, TransportError};
pub use memory::MemoryPipe;
pub use traits::{Pipe, Transfer, TransferStatus};

#[cfg(unix)]
pub use uds::{PipeListener, UnixPipe};
