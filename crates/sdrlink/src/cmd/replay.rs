use std::fs::File;
use std::io::{self, Read};

use sdrlink_frame::{Demultiplexer, Frame, ParseState};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::cmd::listen::Printer;
use crate::cmd::{install_ctrlc_handler, ReplayArgs};
use crate::exit::{io_error, CliError, CliResult, SUCCESS, USAGE};
use crate::output::OutputFormat;

/// Counts from one replay run.
#[derive(Debug, Default, PartialEq, Eq)]
struct ReplaySummary {
    bytes: u64,
    frames: usize,
    overflows: usize,
    /// Input ended part way through a frame.
    truncated: bool,
}

pub fn run(args: ReplayArgs, format: OutputFormat) -> CliResult<i32> {
    if args.chunk == 0 {
        return Err(CliError::new(USAGE, "chunk size must be greater than zero"));
    }
    let mut file = File::open(&args.file)
        .map_err(|err| io_error(&format!("failed opening {}", args.file.display()), err))?;

    let shutdown = CancellationToken::new();
    install_ctrlc_handler(shutdown.clone())?;

    let mut demux = Demultiplexer::with_capacity(args.capacity);
    let mut printer = Printer::new(args.ids, args.count, format);
    let summary = replay(&mut file, args.chunk, &mut demux, &shutdown, |frame| {
        printer.print(frame.id(), &frame.body)
    })
    .map_err(|err| io_error("replay failed", err))?;

    if summary.overflows > 0 {
        warn!(
            overflows = summary.overflows,
            "oversized frame headers were skipped"
        );
    }
    if summary.truncated {
        warn!("capture ends inside a frame");
    }
    info!(
        bytes = summary.bytes,
        frames = summary.frames,
        "replay finished"
    );
    Ok(SUCCESS)
}

/// Feed `reader` to `demux` in `chunk`-byte reads until the input ends,
/// `cancel` fires or `on_frame` returns `true`.
fn replay<R, F>(
    reader: &mut R,
    chunk: usize,
    demux: &mut Demultiplexer,
    cancel: &CancellationToken,
    mut on_frame: F,
) -> io::Result<ReplaySummary>
where
    R: Read,
    F: FnMut(Frame) -> bool,
{
    let mut buf = vec![0u8; chunk.max(1)];
    let mut summary = ReplaySummary::default();
    let mut done = false;

    while !done && !cancel.is_cancelled() {
        let n = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        };
        summary.bytes += n as u64;

        let fed = demux.feed(&buf[..n], |frame| {
            if !done {
                done = on_frame(frame);
            }
        });
        summary.frames += fed.frames;
        summary.overflows += fed.overflows;
    }

    summary.truncated = !done && demux.state() != ParseState::AwaitingHeader;
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use sdrlink_frame::{encode_message, encode_stream};

    use super::*;

    fn wire(words: &[u32]) -> Vec<u8> {
        words.iter().flat_map(|w| w.to_le_bytes()).collect()
    }

    fn capture() -> Vec<u8> {
        wire(&[
            encode_message(3, 2).unwrap(),
            1,
            2,
            encode_stream(3),
            5,
            6,
            7,
            encode_message(7, 0).unwrap(),
        ])
    }

    #[test]
    fn odd_chunks_decode_every_frame() {
        let mut demux = Demultiplexer::new();
        let mut frames = Vec::new();
        let summary = replay(
            &mut Cursor::new(capture()),
            5,
            &mut demux,
            &CancellationToken::new(),
            |frame| {
                frames.push((frame.id(), frame.body));
                false
            },
        )
        .unwrap();

        assert_eq!(
            frames,
            vec![(3, vec![1, 2]), (0, vec![5, 6, 7]), (7, vec![])]
        );
        assert_eq!(summary.bytes, 32);
        assert_eq!(summary.frames, 3);
        assert!(!summary.truncated);
    }

    #[test]
    fn stops_once_handler_is_done() {
        let mut demux = Demultiplexer::new();
        let mut seen = 0;
        replay(
            &mut Cursor::new(capture()),
            4096,
            &mut demux,
            &CancellationToken::new(),
            |_| {
                seen += 1;
                true
            },
        )
        .unwrap();
        assert_eq!(seen, 1);
    }

    #[test]
    fn truncated_capture_is_flagged() {
        let mut bytes = capture();
        bytes.extend(wire(&[encode_stream(4), 1]));

        let mut demux = Demultiplexer::new();
        let summary = replay(
            &mut Cursor::new(bytes),
            64,
            &mut demux,
            &CancellationToken::new(),
            |_| false,
        )
        .unwrap();
        assert_eq!(summary.frames, 3);
        assert!(summary.truncated);
    }

    #[test]
    fn oversized_headers_are_counted() {
        let bytes = wire(&[encode_stream(100), encode_message(1, 0).unwrap()]);
        let mut demux = Demultiplexer::with_capacity(16);
        let mut ids = Vec::new();
        let summary = replay(
            &mut Cursor::new(bytes),
            3,
            &mut demux,
            &CancellationToken::new(),
            |frame| {
                ids.push(frame.id());
                false
            },
        )
        .unwrap();
        assert_eq!(summary.overflows, 1);
        assert_eq!(ids, vec![1]);
    }

    #[test]
    fn cancelled_replay_reads_nothing() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let mut demux = Demultiplexer::new();
        let summary =
            replay(&mut Cursor::new(capture()), 4, &mut demux, &cancel, |_| false).unwrap();
        assert_eq!(summary, ReplaySummary::default());
    }
}
