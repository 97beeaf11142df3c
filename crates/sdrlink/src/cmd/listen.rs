use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::time::Duration;

use sdrlink_frame::{FrameError, InboundStream, LinkCounters, ReaderConfig, ThroughputMonitor};
use sdrlink_transport::PipeListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::cmd::{install_ctrlc_handler, parse_duration, ListenArgs};
use crate::exit::{frame_error, transport_error, CliResult, SUCCESS};
use crate::output::{print_frame, OutputFormat};

const POLL: Duration = Duration::from_millis(50);

pub fn run(args: ListenArgs, format: OutputFormat) -> CliResult<i32> {
    let config = ReaderConfig {
        read_timeout: parse_duration(&args.read_timeout)?,
        capacity: args.capacity,
        ..ReaderConfig::default()
    };
    let stats_interval = parse_duration(&args.stats_interval)?;

    let shutdown = CancellationToken::new();
    install_ctrlc_handler(shutdown.clone())?;

    let listener =
        PipeListener::bind(&args.path).map_err(|err| transport_error("bind failed", err))?;

    let counters = LinkCounters::new();
    let _monitor = if args.stats {
        Some(
            ThroughputMonitor::spawn(counters.clone(), stats_interval, &shutdown)
                .map_err(|err| frame_error("stats monitor failed", FrameError::Io(err)))?,
        )
    } else {
        None
    };

    let mut printer = Printer::new(args.ids, args.count, format);

    while !shutdown.is_cancelled() {
        let Some(pipe) = listener
            .accept_timeout(POLL)
            .map_err(|err| transport_error("accept failed", err))?
        else {
            continue;
        };
        info!("device connected");

        // A closed connection cancels only this token; the listener keeps going.
        let connection = shutdown.child_token();
        let (tx, rx) = mpsc::channel();
        let stream = InboundStream::spawn(
            pipe,
            move |id: u8, body: Vec<u32>| {
                let _ = tx.send((id, body));
            },
            config.clone(),
            counters.clone(),
            &connection,
        )
        .map_err(|err| frame_error("reader start failed", err))?;

        let done = printer.drain(&rx, &connection);
        let overflows = stream.stats().overflows();
        if overflows > 0 {
            warn!(overflows, "oversized frame headers were skipped");
        }
        if done {
            return Ok(SUCCESS);
        }

        match stream.join() {
            Ok(()) => {}
            Err(FrameError::TransportFailed { .. }) => info!("device disconnected"),
            Err(err) => return Err(frame_error("receive failed", err)),
        }
        if printer.drain_ready(&rx) {
            return Ok(SUCCESS);
        }
    }

    Ok(SUCCESS)
}

/// Prints frames that pass the id filter and counts them against `--count`.
pub(crate) struct Printer {
    ids: Option<Vec<u8>>,
    remaining: Option<usize>,
    format: OutputFormat,
}

impl Printer {
    pub(crate) fn new(ids: Option<Vec<u8>>, count: Option<usize>, format: OutputFormat) -> Self {
        Self {
            ids,
            remaining: count,
            format,
        }
    }

    /// Print frames until the connection ends. Returns `true` once `--count`
    /// frames have been printed.
    fn drain(&mut self, rx: &Receiver<(u8, Vec<u32>)>, connection: &CancellationToken) -> bool {
        while !connection.is_cancelled() {
            match rx.recv_timeout(POLL) {
                Ok((id, body)) => {
                    if self.print(id, &body) {
                        return true;
                    }
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        self.drain_ready(rx)
    }

    /// Print frames already queued.
    fn drain_ready(&mut self, rx: &Receiver<(u8, Vec<u32>)>) -> bool {
        while let Ok((id, body)) = rx.try_recv() {
            if self.print(id, &body) {
                return true;
            }
        }
        false
    }

    /// Print one frame. Returns `true` once `--count` frames have been
    /// printed.
    pub(crate) fn print(&mut self, id: u8, body: &[u32]) -> bool {
        if let Some(ids) = &self.ids {
            if !ids.contains(&id) {
                return false;
            }
        }
        print_frame(id, body, self.format);

        match self.remaining.as_mut() {
            Some(remaining) => {
                *remaining = remaining.saturating_sub(1);
                *remaining == 0
            }
            None => false,
        }
    }
}
