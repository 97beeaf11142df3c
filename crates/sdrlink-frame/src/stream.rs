use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use sdrlink_transport::{Pipe, TransferStatus};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::counters::LinkCounters;
use crate::demux::{Demultiplexer, DEFAULT_RECEIVE_CAPACITY};
use crate::error::{FrameError, Result};
use crate::header::{Frame, WORD_SIZE};

const DEFAULT_READ_TIMEOUT: Duration = Duration::from_millis(100);
const DEFAULT_CHUNK_SIZE: usize = 16 * 1024;

/// Receives every frame assembled by an [`InboundStream`].
///
/// Runs on the stream's reader thread, in arrival order. A handler that
/// blocks stalls the reader; a handler that panics is isolated and counted
/// in [`StreamStats::callback_faults`].
pub trait FrameHandler: Send + 'static {
    fn on_frame(&mut self, id: u8, body: Vec<u32>);
}

impl<F> FrameHandler for F
where
    F: FnMut(u8, Vec<u32>) + Send + 'static,
{
    fn on_frame(&mut self, id: u8, body: Vec<u32>) {
        self(id, body)
    }
}

/// Configuration for the inbound reader.
#[derive(Debug, Clone)]
pub struct ReaderConfig {
    /// Timeout for each transport read; bounds how long cancellation takes.
    pub read_timeout: Duration,
    /// Bytes requested per transport read.
    pub chunk_size: usize,
    /// Receive buffer size in words, header slot included.
    pub capacity: usize,
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self {
            read_timeout: DEFAULT_READ_TIMEOUT,
            chunk_size: DEFAULT_CHUNK_SIZE,
            capacity: DEFAULT_RECEIVE_CAPACITY,
        }
    }
}

/// Why the reader thread ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReaderExit {
    /// Cancelled by the owner or through the shared token.
    Cancelled,
    /// The transport reported an error; the shared token was cancelled.
    TransportFailed { transferred: usize },
}

/// Diagnostics shared between the reader thread and the stream owner.
#[derive(Debug, Default)]
pub struct StreamStats {
    frames: AtomicU64,
    overflows: AtomicU64,
    callback_faults: AtomicU64,
}

impl StreamStats {
    /// Frames handed to the handler.
    pub fn frames(&self) -> u64 {
        self.frames.load(Ordering::Relaxed)
    }

    /// Headers rejected because the declared length did not fit.
    pub fn overflows(&self) -> u64 {
        self.overflows.load(Ordering::Relaxed)
    }

    /// Handler invocations that panicked.
    pub fn callback_faults(&self) -> u64 {
        self.callback_faults.load(Ordering::Relaxed)
    }
}

/// An inbound pipe drained by a dedicated reader thread.
///
/// The thread reads from the pipe, feeds a [`Demultiplexer`] and calls the
/// handler once per frame. On a transport error it cancels the token passed
/// to [`InboundStream::spawn`], so every task sharing that token stops too.
/// Dropping the stream cancels and joins its thread without touching the
/// shared token.
pub struct InboundStream {
    local: CancellationToken,
    handle: Option<JoinHandle<ReaderExit>>,
    stats: Arc<StreamStats>,
}

impl InboundStream {
    /// Start reading `pipe` on a new thread.
    pub fn spawn<T, H>(
        pipe: T,
        handler: H,
        config: ReaderConfig,
        counters: Arc<LinkCounters>,
        cancel: &CancellationToken,
    ) -> Result<Self>
    where
        T: Pipe + Send + 'static,
        H: FrameHandler,
    {
        let shared = cancel.clone();
        let local = cancel.child_token();
        let stats = Arc::new(StreamStats::default());

        let reader = Reader {
            demux: Demultiplexer::with_capacity(config.capacity),
            config,
            shared,
            local: local.clone(),
            counters,
            stats: Arc::clone(&stats),
        };

        let handle = std::thread::Builder::new()
            .name("sdrlink-reader".to_string())
            .spawn(move || reader.run(pipe, handler))?;

        Ok(Self {
            local,
            handle: Some(handle),
            stats,
        })
    }

    /// Diagnostics for this stream.
    pub fn stats(&self) -> &StreamStats {
        &self.stats
    }

    /// Whether the reader thread has ended.
    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().is_none_or(JoinHandle::is_finished)
    }

    /// Cancel the reader and wait for it to end.
    ///
    /// Returns the transport failure if the reader had already stopped
    /// because of one.
    pub fn stop(mut self) -> Result<()> {
        self.local.cancel();
        self.wait()
    }

    /// Wait for the reader to end on its own (shared cancellation or a
    /// transport failure).
    pub fn join(mut self) -> Result<()> {
        self.wait()
    }

    fn wait(&mut self) -> Result<()> {
        let Some(handle) = self.handle.take() else {
            return Ok(());
        };
        match handle.join() {
            Ok(ReaderExit::Cancelled) => Ok(()),
            Ok(ReaderExit::TransportFailed { transferred }) => Err(FrameError::TransportFailed {
                op: "read",
                transferred,
                expected: 0,
            }),
            Err(_) => Err(FrameError::Callback("reader thread panicked".to_string())),
        }
    }
}

impl Drop for InboundStream {
    fn drop(&mut self) {
        self.local.cancel();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

struct Reader {
    demux: Demultiplexer,
    config: ReaderConfig,
    shared: CancellationToken,
    local: CancellationToken,
    counters: Arc<LinkCounters>,
    stats: Arc<StreamStats>,
}

impl Reader {
    fn run<T: Pipe, H: FrameHandler>(mut self, mut pipe: T, mut handler: H) -> ReaderExit {
        let mut buf = vec![0u8; self.config.chunk_size.max(WORD_SIZE)];
        info!(
            capacity = self.config.capacity,
            timeout = ?self.config.read_timeout,
            "reader started"
        );

        loop {
            if self.local.is_cancelled() {
                debug!("reader cancelled");
                return ReaderExit::Cancelled;
            }

            let transfer = pipe.read(&mut buf, self.config.read_timeout);
            match transfer.status {
                TransferStatus::Ok | TransferStatus::Timeout => {
                    if transfer.bytes > 0 {
                        self.counters.record_rx(transfer.bytes);
                        self.consume(&buf[..transfer.bytes], &mut handler);
                    }
                }
                TransferStatus::Error => {
                    warn!(bytes = transfer.bytes, "transport read failed; stopping");
                    self.shared.cancel();
                    return ReaderExit::TransportFailed {
                        transferred: transfer.bytes,
                    };
                }
            }
        }
    }

    fn consume<H: FrameHandler>(&mut self, bytes: &[u8], handler: &mut H) {
        let stats = &self.stats;
        let summary = self.demux.feed(bytes, |frame| deliver(&mut *handler, frame, stats));
        self.stats
            .frames
            .fetch_add(summary.frames as u64, Ordering::Relaxed);
        self.stats
            .overflows
            .fetch_add(summary.overflows as u64, Ordering::Relaxed);
    }
}

fn deliver<H: FrameHandler>(handler: &mut H, frame: Frame, stats: &StreamStats) {
    let id = frame.id();
    let outcome = catch_unwind(AssertUnwindSafe(|| handler.on_frame(id, frame.body)));
    if let Err(panic) = outcome {
        let message = panic
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| panic.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "non-string panic payload".to_string());
        let err = FrameError::Callback(message);
        warn!(id, error = %err, "frame handler panicked");
        stats.callback_faults.fetch_add(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::mpsc;
    use std::time::Instant;

    use bytes::BytesMut;
    use sdrlink_transport::{MemoryPipe, Transfer};

    use super::*;
    use crate::header::encode_stream;
    use crate::packetizer::Packetizer;

    const WAIT: Duration = Duration::from_secs(5);

    /// Replays a fixed script of reads, then times out forever.
    struct ScriptedPipe {
        script: VecDeque<(Vec<u8>, TransferStatus)>,
    }

    impl ScriptedPipe {
        fn new(script: Vec<(Vec<u8>, TransferStatus)>) -> Self {
            Self {
                script: script.into(),
            }
        }
    }

    impl Pipe for ScriptedPipe {
        fn write(&mut self, buf: &[u8], _timeout: Duration) -> Transfer {
            Transfer::ok(buf.len())
        }

        fn read(&mut self, buf: &mut [u8], timeout: Duration) -> Transfer {
            match self.script.pop_front() {
                Some((bytes, status)) => {
                    buf[..bytes.len()].copy_from_slice(&bytes);
                    Transfer::new(bytes.len(), status)
                }
                None => {
                    std::thread::sleep(timeout);
                    Transfer::timeout(0)
                }
            }
        }
    }

    fn fast_config() -> ReaderConfig {
        ReaderConfig {
            read_timeout: Duration::from_millis(5),
            ..ReaderConfig::default()
        }
    }

    fn wire(frames: &[Frame]) -> Vec<u8> {
        let mut buf = BytesMut::new();
        for frame in frames {
            frame.encode(&mut buf);
        }
        buf.to_vec()
    }

    fn channel_handler() -> (impl FrameHandler, mpsc::Receiver<(u8, Vec<u32>)>) {
        let (tx, rx) = mpsc::channel();
        let handler = move |id: u8, body: Vec<u32>| {
            let _ = tx.send((id, body));
        };
        (handler, rx)
    }

    #[test]
    fn delivers_frames_in_arrival_order() {
        let sent = vec![
            Frame::message(4, vec![]).unwrap(),
            Frame::stream((0..1023).collect()).unwrap(),
            Frame::message(6, vec![]).unwrap(),
            Frame::message(7, vec![13, 7]).unwrap(),
        ];
        let pipe = ScriptedPipe::new(vec![(wire(&sent), TransferStatus::Ok)]);
        let (handler, rx) = channel_handler();
        let cancel = CancellationToken::new();

        let stream =
            InboundStream::spawn(pipe, handler, fast_config(), LinkCounters::new(), &cancel)
                .unwrap();

        for expected in &sent {
            let (id, body) = rx.recv_timeout(WAIT).unwrap();
            assert_eq!(id, expected.id());
            assert_eq!(&body, &expected.body);
        }
        assert_eq!(stream.stats().frames(), 4);
        stream.stop().unwrap();
        assert!(!cancel.is_cancelled());
    }

    #[test]
    fn timeout_bytes_are_still_consumed() {
        let bytes = wire(&[Frame::message(2, vec![5]).unwrap()]);
        let pipe = ScriptedPipe::new(vec![
            (Vec::new(), TransferStatus::Timeout),
            (bytes[..5].to_vec(), TransferStatus::Timeout),
            (bytes[5..].to_vec(), TransferStatus::Ok),
        ]);
        let (handler, rx) = channel_handler();
        let cancel = CancellationToken::new();
        let _stream =
            InboundStream::spawn(pipe, handler, fast_config(), LinkCounters::new(), &cancel)
                .unwrap();

        assert_eq!(rx.recv_timeout(WAIT).unwrap(), (2, vec![5]));
    }

    #[test]
    fn transport_error_cancels_shared_token() {
        let pipe = ScriptedPipe::new(vec![(Vec::new(), TransferStatus::Error)]);
        let cancel = CancellationToken::new();
        let stream = InboundStream::spawn(
            pipe,
            |_: u8, _: Vec<u32>| {},
            fast_config(),
            LinkCounters::new(),
            &cancel,
        )
        .unwrap();

        let err = stream.join().unwrap_err();
        assert!(matches!(err, FrameError::TransportFailed { op: "read", .. }));
        assert!(cancel.is_cancelled());
    }

    #[test]
    fn shared_cancellation_stops_reader() {
        let cancel = CancellationToken::new();
        let stream = InboundStream::spawn(
            ScriptedPipe::new(Vec::new()),
            |_: u8, _: Vec<u32>| {},
            fast_config(),
            LinkCounters::new(),
            &cancel,
        )
        .unwrap();

        cancel.cancel();
        let deadline = Instant::now() + WAIT;
        while !stream.is_finished() {
            assert!(Instant::now() < deadline, "reader did not stop");
            std::thread::sleep(Duration::from_millis(5));
        }
        stream.join().unwrap();
    }

    #[test]
    fn overflow_is_counted_and_stream_recovers() {
        let mut bytes = encode_stream(2000).to_le_bytes().to_vec();
        bytes.extend(wire(&[Frame::message(1, vec![8]).unwrap()]));
        let pipe = ScriptedPipe::new(vec![(bytes, TransferStatus::Ok)]);
        let (handler, rx) = channel_handler();
        let cancel = CancellationToken::new();
        let stream =
            InboundStream::spawn(pipe, handler, fast_config(), LinkCounters::new(), &cancel)
                .unwrap();

        assert_eq!(rx.recv_timeout(WAIT).unwrap(), (1, vec![8]));
        stream.stop().unwrap();
    }

    #[test]
    fn panicking_handler_is_isolated() {
        let frames = vec![
            Frame::message(1, vec![]).unwrap(),
            Frame::message(2, vec![]).unwrap(),
        ];
        let pipe = ScriptedPipe::new(vec![(wire(&frames), TransferStatus::Ok)]);
        let (tx, rx) = mpsc::channel();
        let handler = move |id: u8, _body: Vec<u32>| {
            if id == 1 {
                panic!("bad frame");
            }
            let _ = tx.send(id);
        };
        let cancel = CancellationToken::new();
        let stream =
            InboundStream::spawn(pipe, handler, fast_config(), LinkCounters::new(), &cancel)
                .unwrap();

        assert_eq!(rx.recv_timeout(WAIT).unwrap(), 2);
        assert_eq!(stream.stats().callback_faults(), 1);
        assert_eq!(stream.stats().frames(), 2);
        stream.stop().unwrap();
    }

    #[test]
    fn counts_received_bytes() {
        let bytes = wire(&[Frame::message(3, vec![1, 2]).unwrap()]);
        let pipe = ScriptedPipe::new(vec![(bytes, TransferStatus::Ok)]);
        let (handler, rx) = channel_handler();
        let counters = LinkCounters::new();
        let cancel = CancellationToken::new();
        let stream = InboundStream::spawn(
            pipe,
            handler,
            fast_config(),
            Arc::clone(&counters),
            &cancel,
        )
        .unwrap();

        rx.recv_timeout(WAIT).unwrap();
        stream.stop().unwrap();
        assert_eq!(counters.snapshot().rx_bytes, 12);
    }

    #[test]
    fn packetizer_to_stream_over_memory_pipe() {
        let (host, device) = MemoryPipe::pair();
        let (handler, rx) = channel_handler();
        let cancel = CancellationToken::new();
        let stream =
            InboundStream::spawn(device, handler, fast_config(), LinkCounters::new(), &cancel)
                .unwrap();

        let mut packetizer = Packetizer::new(host);
        let samples: Vec<u32> = (0..1500).collect();
        packetizer.write_words(&samples).unwrap();
        packetizer.send_message(5, &[0xABCD]).unwrap();

        let (id, first) = rx.recv_timeout(WAIT).unwrap();
        assert_eq!((id, first.len()), (0, 1023));
        let (id, second) = rx.recv_timeout(WAIT).unwrap();
        assert_eq!((id, second.len()), (0, 477));
        assert_eq!([first, second].concat(), samples);
        assert_eq!(rx.recv_timeout(WAIT).unwrap(), (5, vec![0xABCD]));

        stream.stop().unwrap();
        packetizer.close().unwrap();
    }

    #[test]
    fn drop_joins_reader_without_cancelling_parent() {
        let cancel = CancellationToken::new();
        let stream = InboundStream::spawn(
            ScriptedPipe::new(Vec::new()),
            |_: u8, _: Vec<u32>| {},
            fast_config(),
            LinkCounters::new(),
            &cancel,
        )
        .unwrap();
        drop(stream);
        assert!(!cancel.is_cancelled());
    }
}
