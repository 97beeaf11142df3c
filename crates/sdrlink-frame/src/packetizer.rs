use std::io;
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use sdrlink_transport::{Pipe, TransferStatus};
use tracing::{debug, trace, warn};

use crate::counters::LinkCounters;
use crate::error::{FrameError, Result};
use crate::header::{Frame, MAX_STREAM_WORDS, WORD_SIZE};

/// Default number of words batched into one stream frame.
pub const DEFAULT_STREAM_CAPACITY: usize = 1023;

const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_millis(1000);

/// Configuration for the outbound packetizer.
#[derive(Debug, Clone)]
pub struct PacketizerConfig {
    /// Words per stream frame. Clamped to `1..=65535`.
    pub capacity: usize,
    /// Timeout for each transport write.
    pub write_timeout: Duration,
}

impl Default for PacketizerConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_STREAM_CAPACITY,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
        }
    }
}

/// Batches stream words into frames of at most `capacity` words.
///
/// Pure state machine with no I/O: a full batch is only emitted when one
/// more word arrives, so writing exactly `capacity` words leaves them
/// pending until [`StreamBatcher::take`].
#[derive(Debug)]
pub struct StreamBatcher {
    pending: Vec<u32>,
    capacity: usize,
}

impl StreamBatcher {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.clamp(1, MAX_STREAM_WORDS);
        Self {
            pending: Vec::with_capacity(capacity),
            capacity,
        }
    }

    /// Append one word. Returns the full batch if it had to be flushed to
    /// make room.
    pub fn push(&mut self, word: u32) -> Option<Frame> {
        let flushed = if self.pending.len() == self.capacity {
            self.take()
        } else {
            None
        };
        self.pending.push(word);
        flushed
    }

    /// Emit whatever is pending as one stream frame.
    pub fn take(&mut self) -> Option<Frame> {
        if self.pending.is_empty() {
            return None;
        }
        let body = std::mem::replace(&mut self.pending, Vec::with_capacity(self.capacity));
        // Length is bounded by `capacity <= MAX_STREAM_WORDS`.
        Frame::stream(body).ok()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Writes message frames and batched stream frames to a [`Pipe`].
///
/// Every frame goes out as a single transport write. Pending stream words
/// are flushed before a message is sent, and once more when the packetizer
/// is closed or dropped.
///
/// A write that stops part way through a frame leaves the receiver out of
/// sync. Such a write is reported as [`FrameError::TransportFailed`] and the
/// packetizer refuses every later frame.
pub struct Packetizer<T: Pipe> {
    pipe: T,
    batcher: StreamBatcher,
    scratch: BytesMut,
    config: PacketizerConfig,
    counters: Arc<LinkCounters>,
    // Partial word carried between `io::Write::write` calls.
    carry: [u8; WORD_SIZE],
    carry_len: usize,
    // Send failure hit after `io::Write::write` had already consumed bytes.
    deferred: Option<FrameError>,
    torn: bool,
    closed: bool,
}

impl<T: Pipe> Packetizer<T> {
    /// Create a packetizer with default configuration.
    pub fn new(pipe: T) -> Self {
        Self::with_config(pipe, PacketizerConfig::default())
    }

    /// Create a packetizer with explicit configuration.
    pub fn with_config(pipe: T, config: PacketizerConfig) -> Self {
        let batcher = StreamBatcher::new(config.capacity);
        Self {
            pipe,
            scratch: BytesMut::with_capacity((batcher.capacity() + 1) * WORD_SIZE),
            batcher,
            config,
            counters: Arc::new(LinkCounters::default()),
            carry: [0; WORD_SIZE],
            carry_len: 0,
            deferred: None,
            torn: false,
            closed: false,
        }
    }

    /// Share byte counters with a reporting task.
    pub fn with_counters(mut self, counters: Arc<LinkCounters>) -> Self {
        self.counters = counters;
        self
    }

    /// Append stream words, flushing a frame each time the batch fills up.
    pub fn write_words(&mut self, words: &[u32]) -> Result<()> {
        for &word in words {
            self.push_word(word)?;
        }
        Ok(())
    }

    /// Append little-endian stream bytes.
    ///
    /// Whole words are accepted. A trailing partial word is dropped, pending
    /// words are flushed and [`FrameError::Alignment`] is returned.
    pub fn write_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        let chunks = bytes.chunks_exact(WORD_SIZE);
        let residue = chunks.remainder().len();
        for chunk in chunks {
            self.push_word(u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))?;
        }

        if residue != 0 {
            warn!(dropped = residue, "unaligned stream data");
            self.flush()?;
            return Err(FrameError::Alignment { dropped: residue });
        }
        Ok(())
    }

    /// Send pending stream words as one frame. No-op when nothing is pending.
    pub fn flush(&mut self) -> Result<()> {
        match self.batcher.take() {
            Some(frame) => self.send_packet(&frame),
            None => Ok(()),
        }
    }

    /// Send a message frame. Pending stream words go out first.
    pub fn send_message(&mut self, id: u8, body: &[u32]) -> Result<()> {
        let frame = Frame::message(id, body.to_vec())?;
        self.flush()?;
        self.send_packet(&frame)
    }

    /// Flush pending words and mark the packetizer closed.
    ///
    /// Bytes left over from [`io::Write`] that never made up a whole word are
    /// dropped and reported as [`FrameError::Alignment`].
    pub fn close(mut self) -> Result<()> {
        self.finish()
    }

    /// True once a frame was torn on the wire. Every later send fails.
    pub fn is_failed(&self) -> bool {
        self.torn
    }

    fn finish(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        let dropped = std::mem::take(&mut self.carry_len);
        let flushed = self.flush();
        if let Some(err) = self.deferred.take() {
            return Err(err);
        }
        flushed?;
        if dropped != 0 {
            warn!(dropped, "unaligned stream data at close");
            return Err(FrameError::Alignment { dropped });
        }
        Ok(())
    }

    fn push_word(&mut self, word: u32) -> Result<()> {
        match self.batcher.push(word) {
            Some(frame) => self.send_packet(&frame),
            None => Ok(()),
        }
    }

    fn send_packet(&mut self, frame: &Frame) -> Result<()> {
        self.scratch.clear();
        frame.encode(&mut self.scratch);
        let expected = self.scratch.len();

        if self.torn {
            return Err(FrameError::TransportFailed {
                op: "write",
                transferred: 0,
                expected,
            });
        }

        debug!(
            id = frame.id(),
            message = frame.header.is_message(),
            words = frame.body.len() + 1,
            "sending packet"
        );
        trace!(words = ?frame.body, "packet body");

        let transfer = self.pipe.write(&self.scratch, self.config.write_timeout);
        self.counters.record_tx(transfer.bytes);

        match transfer.status {
            TransferStatus::Ok => Ok(()),
            TransferStatus::Timeout if transfer.bytes == 0 => Err(FrameError::Timeout {
                op: "write",
                timeout: self.config.write_timeout,
                transferred: 0,
                expected,
            }),
            TransferStatus::Timeout if transfer.bytes >= expected => Ok(()),
            TransferStatus::Timeout | TransferStatus::Error => {
                self.torn = true;
                warn!(
                    transferred = transfer.bytes,
                    expected, "pipe write failed, packetizer disabled"
                );
                Err(FrameError::TransportFailed {
                    op: "write",
                    transferred: transfer.bytes,
                    expected,
                })
            }
        }
    }

    /// Stream words waiting for the next flush.
    pub fn pending_words(&self) -> usize {
        self.batcher.len()
    }

    /// Shared byte counters.
    pub fn counters(&self) -> &Arc<LinkCounters> {
        &self.counters
    }

    /// Current packetizer configuration.
    pub fn config(&self) -> &PacketizerConfig {
        &self.config
    }
}

impl<T: Pipe> Drop for Packetizer<T> {
    fn drop(&mut self) {
        if let Err(err) = self.finish() {
            warn!(error = %err, "final flush failed");
        }
    }
}

/// Byte-stream adapter, so readers can be copied straight into the
/// packetizer with `std::io::copy`.
///
/// Chunks need not be word aligned: a partial word is carried into the next
/// call. `flush` only emits whole words. A send failure after some bytes
/// were taken is reported by the next `write` or `flush`.
impl<T: Pipe> io::Write for Packetizer<T> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if let Some(err) = self.deferred.take() {
            return Err(into_io_error(err));
        }
        for (consumed, &byte) in buf.iter().enumerate() {
            self.carry[self.carry_len] = byte;
            self.carry_len += 1;
            if self.carry_len < WORD_SIZE {
                continue;
            }
            self.carry_len = 0;
            // The word is queued even when the batch ahead of it failed.
            if let Err(err) = self.push_word(u32::from_le_bytes(self.carry)) {
                self.deferred = Some(err);
                return Ok(consumed + 1);
            }
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        if let Some(err) = self.deferred.take() {
            return Err(into_io_error(err));
        }
        Packetizer::flush(self).map_err(into_io_error)
    }
}

fn into_io_error(err: FrameError) -> io::Error {
    let kind = match &err {
        FrameError::Alignment { .. } => io::ErrorKind::InvalidInput,
        FrameError::Timeout { .. } => io::ErrorKind::TimedOut,
        FrameError::TransportFailed { .. } => io::ErrorKind::BrokenPipe,
        _ => io::ErrorKind::Other,
    };
    io::Error::new(kind, err)
}
