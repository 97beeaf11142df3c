use tracing::{debug, warn};

use crate::error::{FrameError, Result};
use crate::header::{Frame, Header, WORD_SIZE};

/// Default receive buffer size in words, including one slot for the header.
pub const DEFAULT_RECEIVE_CAPACITY: usize = 1024;

/// Where the demultiplexer is within the current frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseState {
    AwaitingHeader,
    AccumulatingMessage { id: u8, expected: usize },
    AccumulatingStream { expected: usize },
}

/// Reassembles frames from an inbound word stream.
///
/// Feed it one word at a time with [`Demultiplexer::push`], or raw bytes
/// with [`Demultiplexer::feed`]. A header whose declared body does not fit
/// the receive buffer is rejected with [`FrameError::Overflow`] and the
/// parser goes straight back to waiting for a header.
#[derive(Debug)]
pub struct Demultiplexer {
    state: ParseState,
    body: Vec<u32>,
    capacity: usize,
    partial: [u8; WORD_SIZE],
    partial_len: usize,
}

/// Counts from one [`Demultiplexer::feed`] call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FeedSummary {
    pub frames: usize,
    pub overflows: usize,
}

impl Demultiplexer {
    /// Create a demultiplexer with the default receive capacity.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_RECEIVE_CAPACITY)
    }

    /// Create a demultiplexer whose receive buffer holds `capacity` words,
    /// header slot included.
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            state: ParseState::AwaitingHeader,
            body: Vec::with_capacity(capacity - 1),
            capacity,
            partial: [0; WORD_SIZE],
            partial_len: 0,
        }
    }

    /// Largest body length accepted.
    pub fn max_body_words(&self) -> usize {
        self.capacity - 1
    }

    pub fn state(&self) -> ParseState {
        self.state
    }

    /// Consume one word. Returns a frame when this word completes one.
    pub fn push(&mut self, word: u32) -> Result<Option<Frame>> {
        match self.state {
            ParseState::AwaitingHeader => self.start_frame(Header::decode(word)),
            ParseState::AccumulatingMessage { expected, .. }
            | ParseState::AccumulatingStream { expected } => {
                self.body.push(word);
                if self.body.len() < expected {
                    return Ok(None);
                }
                let header = match self.state {
                    ParseState::AccumulatingMessage { id, expected } => Header::Message {
                        id,
                        num: expected as u8,
                    },
                    _ => Header::Stream {
                        num: expected as u16,
                    },
                };
                self.state = ParseState::AwaitingHeader;
                let body = std::mem::replace(&mut self.body, Vec::with_capacity(self.capacity - 1));
                Ok(Some(Frame { header, body }))
            }
        }
    }

    fn start_frame(&mut self, header: Header) -> Result<Option<Frame>> {
        let expected = header.body_words();
        if expected == 0 {
            return Ok(Some(Frame {
                header,
                body: Vec::new(),
            }));
        }

        if expected > self.max_body_words() {
            return Err(FrameError::Overflow {
                declared: expected,
                capacity: self.max_body_words(),
            });
        }

        self.body.clear();
        self.state = match header {
            Header::Message { id, .. } => ParseState::AccumulatingMessage { id, expected },
            Header::Stream { .. } => ParseState::AccumulatingStream { expected },
        };
        Ok(None)
    }

    /// Consume raw little-endian bytes and hand every completed frame to
    /// `on_frame`.
    ///
    /// Chunks need not be word-aligned: a trailing partial word is held until
    /// the next call. Overflowing headers are logged and skipped.
    pub fn feed<F>(&mut self, bytes: &[u8], mut on_frame: F) -> FeedSummary
    where
        F: FnMut(Frame),
    {
        let mut summary = FeedSummary::default();
        let mut rest = bytes;

        if self.partial_len > 0 {
            let take = (WORD_SIZE - self.partial_len).min(rest.len());
            self.partial[self.partial_len..self.partial_len + take].copy_from_slice(&rest[..take]);
            self.partial_len += take;
            rest = &rest[take..];
            if self.partial_len < WORD_SIZE {
                return summary;
            }
            self.partial_len = 0;
            let word = u32::from_le_bytes(self.partial);
            self.dispatch(word, &mut on_frame, &mut summary);
        }

        let chunks = rest.chunks_exact(WORD_SIZE);
        let tail = chunks.remainder();
        for chunk in chunks {
            let word = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
            self.dispatch(word, &mut on_frame, &mut summary);
        }

        self.partial[..tail.len()].copy_from_slice(tail);
        self.partial_len = tail.len();
        summary
    }

    fn dispatch<F>(&mut self, word: u32, on_frame: &mut F, summary: &mut FeedSummary)
    where
        F: FnMut(Frame),
    {
        match self.push(word) {
            Ok(Some(frame)) => {
                debug!(id = frame.id(), words = frame.body.len(), "frame received");
                summary.frames += 1;
                on_frame(frame);
            }
            Ok(None) => {}
            Err(err) => {
                warn!(error = %err, header = %format!("{word:#010x}"), "dropping frame header");
                summary.overflows += 1;
            }
        }
    }

    /// Discard any partial frame and return to waiting for a header.
    pub fn reset(&mut self) {
        self.state = ParseState::AwaitingHeader;
        self.body.clear();
        self.partial_len = 0;
    }
}

impl Default for Demultiplexer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use bytes::BytesMut;

    use super::*;
    use crate::header::{encode_message, encode_stream};

    fn wire(frames: &[Frame]) -> Vec<u8> {
        let mut buf = BytesMut::new();
        for frame in frames {
            frame.encode(&mut buf);
        }
        buf.to_vec()
    }

    fn collect(demux: &mut Demultiplexer, bytes: &[u8]) -> (Vec<Frame>, FeedSummary) {
        let mut frames = Vec::new();
        let summary = demux.feed(bytes, |f| frames.push(f));
        (frames, summary)
    }

    #[test]
    fn empty_message_is_delivered_immediately() {
        let mut demux = Demultiplexer::new();
        let frame = demux.push(encode_message(4, 0).unwrap()).unwrap().unwrap();

        assert_eq!(frame.id(), 4);
        assert!(frame.body.is_empty());
        assert_eq!(demux.state(), ParseState::AwaitingHeader);
    }

    #[test]
    fn message_accumulates_body() {
        let mut demux = Demultiplexer::new();
        assert!(demux.push(encode_message(7, 2).unwrap()).unwrap().is_none());
        assert_eq!(
            demux.state(),
            ParseState::AccumulatingMessage { id: 7, expected: 2 }
        );
        assert!(demux.push(13).unwrap().is_none());

        let frame = demux.push(7).unwrap().unwrap();
        assert_eq!(frame.header, Header::Message { id: 7, num: 2 });
        assert_eq!(frame.body, vec![13, 7]);
        assert_eq!(demux.state(), ParseState::AwaitingHeader);
    }

    #[test]
    fn stream_reports_id_zero() {
        let mut demux = Demultiplexer::new();
        demux.push(encode_stream(1)).unwrap();
        assert_eq!(demux.state(), ParseState::AccumulatingStream { expected: 1 });

        let frame = demux.push(0xDEAD_BEEF).unwrap().unwrap();
        assert_eq!(frame.id(), 0);
        assert_eq!(frame.body, vec![0xDEAD_BEEF]);
    }

    #[test]
    fn empty_stream_is_delivered_immediately() {
        let mut demux = Demultiplexer::new();
        let frame = demux.push(encode_stream(0)).unwrap().unwrap();
        assert_eq!(frame.header, Header::Stream { num: 0 });
        assert_eq!(demux.state(), ParseState::AwaitingHeader);
    }

    #[test]
    fn consecutive_frames_arrive_in_order() {
        let sent = vec![
            Frame::message(4, vec![]).unwrap(),
            Frame::stream((0..1023u32).map(|i| (i % 4096) + ((i % 4096) << 16)).collect())
                .unwrap(),
            Frame::message(6, vec![]).unwrap(),
            Frame::message(7, vec![13, 7]).unwrap(),
        ];

        let mut demux = Demultiplexer::new();
        let (frames, summary) = collect(&mut demux, &wire(&sent));

        assert_eq!(frames, sent);
        assert_eq!(summary.frames, 4);
        assert_eq!(summary.overflows, 0);
    }

    #[test]
    fn overflow_is_rejected_and_parser_resumes() {
        let mut demux = Demultiplexer::new();
        let err = demux.push(encode_stream(1024)).unwrap_err();
        assert!(matches!(
            err,
            FrameError::Overflow {
                declared: 1024,
                capacity: 1023
            }
        ));
        assert_eq!(demux.state(), ParseState::AwaitingHeader);

        let frame = demux.push(encode_message(1, 0).unwrap()).unwrap().unwrap();
        assert_eq!(frame.id(), 1);
    }

    #[test]
    fn overflow_in_byte_feed_yields_no_frame() {
        let mut bytes = encode_stream(5000).to_le_bytes().to_vec();
        bytes.extend(wire(&[Frame::message(2, vec![99]).unwrap()]));

        let mut demux = Demultiplexer::new();
        let (frames, summary) = collect(&mut demux, &bytes);

        assert_eq!(summary.overflows, 1);
        assert_eq!(frames, vec![Frame::message(2, vec![99]).unwrap()]);
    }

    #[test]
    fn largest_fitting_frame_is_accepted() {
        let mut demux = Demultiplexer::with_capacity(4);
        let sent = Frame::stream(vec![1, 2, 3]).unwrap();
        let (frames, summary) = collect(&mut demux, &wire(&[sent.clone()]));
        assert_eq!(frames, vec![sent]);
        assert_eq!(summary.overflows, 0);

        assert!(demux.push(encode_message(0, 4).unwrap()).is_err());
    }

    #[test]
    fn byte_at_a_time_feed() {
        let sent = vec![
            Frame::message(3, vec![0x1111_1111, 0x8888_8888]).unwrap(),
            Frame::stream(vec![5, 6, 7]).unwrap(),
        ];
        let bytes = wire(&sent);

        let mut demux = Demultiplexer::new();
        let mut frames = Vec::new();
        for byte in &bytes {
            demux.feed(std::slice::from_ref(byte), |f| frames.push(f));
        }
        assert_eq!(frames, sent);
    }

    #[test]
    fn odd_chunk_boundaries() {
        let sent = vec![
            Frame::stream(vec![1, 2, 3, 4, 5]).unwrap(),
            Frame::message(5, vec![0xCAFE_F00D]).unwrap(),
        ];
        let bytes = wire(&sent);

        let mut demux = Demultiplexer::new();
        let mut frames = Vec::new();
        for chunk in bytes.chunks(7) {
            demux.feed(chunk, |f| frames.push(f));
        }
        assert_eq!(frames, sent);
    }

    #[test]
    fn reset_discards_partial_frame() {
        let mut demux = Demultiplexer::new();
        demux.push(encode_stream(3)).unwrap();
        demux.push(1).unwrap();
        demux.feed(&[0xAA, 0xBB], |_| panic!("no frame expected"));

        demux.reset();
        assert_eq!(demux.state(), ParseState::AwaitingHeader);
        let frame = demux.push(encode_message(2, 0).unwrap()).unwrap();
        assert!(frame.is_some());
    }
}
