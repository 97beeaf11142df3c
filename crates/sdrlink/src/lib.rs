//! Message/stream framing for SDR/FPGA devices on USB3 bulk pipes.
//!
//! A host and an FPGA exchange two kinds of frames over one bulk pipe pair:
//! short control messages tagged with a 3-bit id, and long sample streams.
//!
//! # Crate Structure
//!
//! - [`transport`]: the `Pipe` abstraction plus Unix-socket and in-memory pipes
//! - [`frame`]: header codec, outbound packetizer, inbound demultiplexer and
//!   the background reader

/// Re-export transport types.
pub mod transport {
    pub use sdrlink_transport::*;
}

/// Re-export frame types.
pub mod frame {
    pub use sdrlink_frame::*;
}
