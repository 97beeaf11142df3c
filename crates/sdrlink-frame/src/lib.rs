//! Message/stream framing over a USB3 bulk pipe.
//!
//! Two frame kinds share one byte channel. Every frame starts with a 32-bit
//! little-endian header word:
//! - Message frames (bit 31 set) carry a 3-bit id and up to 255 body words
//! - Stream frames (bit 31 clear) carry up to 65535 sample words, id 0
//!
//! Outbound words are batched by the [`Packetizer`]; inbound bytes are
//! reassembled by the [`Demultiplexer`], driven on a background thread by an
//! [`InboundStream`].

pub mod counters;
pub mod demux;
pub mod error;
pub mod header;
pub mod packetizer;
pub mod stream;

pub use counters::{LinkCounters, Throughput, ThroughputMonitor, MIN_REPORT_INTERVAL};
pub use demux::{Demultiplexer, FeedSummary, ParseState, DEFAULT_RECEIVE_CAPACITY};
pub use error::{FrameError, Result};
pub use header::{
    decode_header, encode_message, encode_stream, Frame, Header, MAX_MESSAGE_ID,
    MAX_MESSAGE_WORDS, MAX_STREAM_WORDS, WORD_SIZE,
};
pub use packetizer::{Packetizer, PacketizerConfig, StreamBatcher, DEFAULT_STREAM_CAPACITY};
pub use stream::{FrameHandler, InboundStream, ReaderConfig, ReaderExit, StreamStats};
