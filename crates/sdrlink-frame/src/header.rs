use bytes::{BufMut, BytesMut};

use crate::error::{FrameError, Result};

/// Size of one protocol word in bytes.
pub const WORD_SIZE: usize = 4;

/// Largest message id (3-bit field).
pub const MAX_MESSAGE_ID: u8 = 7;

/// Largest message body (8-bit length field).
pub const MAX_MESSAGE_WORDS: usize = u8::MAX as usize;

/// Largest stream body (16-bit length field).
pub const MAX_STREAM_WORDS: usize = u16::MAX as usize;

const KIND_BIT: u32 = 1 << 31;
const MESSAGE_ID_SHIFT: u32 = 28;
const MESSAGE_ID_MASK: u32 = 0x7;
const MESSAGE_NUM_SHIFT: u32 = 20;
const MESSAGE_NUM_MASK: u32 = 0xFF;
const STREAM_NUM_MASK: u32 = 0xFFFF;

/// Decoded frame header.
///
/// Header word layout:
/// ```text
///  31  30..28  27..20  19..0
/// ┌───┬───────┬───────┬──────────┐
/// │ 1 │  id   │  num  │ reserved │   Message
/// └───┴───────┴───────┴──────────┘
///  31  30..16          15..0
/// ┌───┬───────────────┬──────────┐
/// │ 0 │   reserved    │   num    │   Stream
/// └───┴───────────────┴──────────┘
/// ```
/// `num` is the number of body words following the header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Header {
    Message { id: u8, num: u8 },
    Stream { num: u16 },
}

impl Header {
    /// Build a message header, rejecting ids wider than 3 bits.
    pub fn message(id: u8, num: u8) -> Result<Self> {
        if id > MAX_MESSAGE_ID {
            return Err(FrameError::InvalidMessageId(id));
        }
        Ok(Self::Message { id, num })
    }

    pub fn stream(num: u16) -> Self {
        Self::Stream { num }
    }

    /// Decode a header word. Total: every bit pattern is one of the two kinds,
    /// reserved bits are ignored.
    pub fn decode(word: u32) -> Self {
        if word & KIND_BIT != 0 {
            Self::Message {
                id: ((word >> MESSAGE_ID_SHIFT) & MESSAGE_ID_MASK) as u8,
                num: ((word >> MESSAGE_NUM_SHIFT) & MESSAGE_NUM_MASK) as u8,
            }
        } else {
            Self::Stream {
                num: (word & STREAM_NUM_MASK) as u16,
            }
        }
    }

    /// Encode into a header word with all reserved bits zero.
    pub fn encode(self) -> u32 {
        match self {
            Self::Message { id, num } => {
                KIND_BIT
                    | ((u32::from(id) & MESSAGE_ID_MASK) << MESSAGE_ID_SHIFT)
                    | (u32::from(num) << MESSAGE_NUM_SHIFT)
            }
            Self::Stream { num } => u32::from(num),
        }
    }

    /// Message id; stream frames report 0.
    pub fn id(self) -> u8 {
        match self {
            Self::Message { id, .. } => id,
            Self::Stream { .. } => 0,
        }
    }

    /// Number of body words that follow this header.
    pub fn body_words(self) -> usize {
        match self {
            Self::Message { num, .. } => usize::from(num),
            Self::Stream { num } => usize::from(num),
        }
    }

    pub fn is_message(self) -> bool {
        matches!(self, Self::Message { .. })
    }
}

/// Encode a message header word.
pub fn encode_message(id: u8, num: u8) -> Result<u32> {
    Header::message(id, num).map(Header::encode)
}

/// Encode a stream header word.
pub fn encode_stream(num: u16) -> u32 {
    Header::stream(num).encode()
}

/// Decode a header word.
pub fn decode_header(word: u32) -> Header {
    Header::decode(word)
}

/// A header plus its body words.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub header: Header,
    pub body: Vec<u32>,
}

impl Frame {
    /// Build a message frame; the body length becomes the header's `num`.
    pub fn message(id: u8, body: Vec<u32>) -> Result<Self> {
        let num = u8::try_from(body.len()).map_err(|_| FrameError::BodyTooLong {
            words: body.len(),
            max: MAX_MESSAGE_WORDS,
        })?;
        Ok(Self {
            header: Header::message(id, num)?,
            body,
        })
    }

    /// Build a stream frame; the body length becomes the header's `num`.
    pub fn stream(body: Vec<u32>) -> Result<Self> {
        let num = u16::try_from(body.len()).map_err(|_| FrameError::BodyTooLong {
            words: body.len(),
            max: MAX_STREAM_WORDS,
        })?;
        Ok(Self {
            header: Header::stream(num),
            body,
        })
    }

    /// Message id; stream frames report 0.
    pub fn id(&self) -> u8 {
        self.header.id()
    }

    /// Total wire size in bytes (header + body).
    pub fn wire_size(&self) -> usize {
        (1 + self.body.len()) * WORD_SIZE
    }

    /// Append the wire encoding to `dst`.
    pub fn encode(&self, dst: &mut BytesMut) {
        dst.reserve(self.wire_size());
        dst.put_u32_le(self.header.encode());
        for word in &self.body {
            dst.put_u32_le(*word);
        }
    }
}
