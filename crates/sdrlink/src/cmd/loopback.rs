use std::sync::mpsc::{self, RecvTimeoutError};
use std::time::Duration;

use sdrlink_frame::{
    Frame, FrameError, InboundStream, LinkCounters, Packetizer, ReaderConfig,
    DEFAULT_STREAM_CAPACITY,
};
use sdrlink_transport::{MemoryPipe, Pipe};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::cmd::{install_ctrlc_handler, parse_duration, ramp, LoopbackArgs};
use crate::exit::{frame_error, CliError, CliResult, DATA_INVALID, FAILURE, SUCCESS, TIMEOUT};
use crate::output::{print_frame, OutputFormat};

/// The sequence a device emits for its self-test: an empty message 4, one
/// full stream frame of ramp words, an empty message 6 and message 7 with
/// body `[13, 7]`.
pub fn test_pattern() -> CliResult<Vec<Frame>> {
    let frames = vec![
        Frame::message(4, Vec::new()),
        Frame::stream(ramp(DEFAULT_STREAM_CAPACITY)),
        Frame::message(6, Vec::new()),
        Frame::message(7, vec![13, 7]),
    ];
    frames
        .into_iter()
        .collect::<Result<Vec<_>, FrameError>>()
        .map_err(|err| frame_error("test pattern", err))
}

fn send_pattern<P: Pipe>(
    packetizer: &mut Packetizer<P>,
    pattern: &[Frame],
) -> Result<(), FrameError> {
    for frame in pattern {
        if frame.header.is_message() {
            packetizer.send_message(frame.id(), &frame.body)?;
        } else {
            packetizer.write_words(&frame.body)?;
        }
    }
    packetizer.flush()
}

pub fn run(args: LoopbackArgs, format: OutputFormat) -> CliResult<i32> {
    let timeout = parse_duration(&args.timeout)?;
    let pattern = test_pattern()?;

    let shutdown = CancellationToken::new();
    install_ctrlc_handler(shutdown.clone())?;

    let (host, device) = MemoryPipe::pair();
    let counters = LinkCounters::new();
    let (tx, rx) = mpsc::channel();
    let stream = InboundStream::spawn(
        device,
        move |id: u8, body: Vec<u32>| {
            let _ = tx.send((id, body));
        },
        ReaderConfig::default(),
        counters.clone(),
        &shutdown,
    )
    .map_err(|err| frame_error("reader start failed", err))?;
    let mut packetizer = Packetizer::new(host).with_counters(counters.clone());

    for round in 0..args.repeat {
        send_pattern(&mut packetizer, &pattern).map_err(|err| frame_error("send failed", err))?;

        for expected in &pattern {
            let (id, body) = match rx.recv_timeout(timeout) {
                Ok(frame) => frame,
                Err(RecvTimeoutError::Timeout) => {
                    return Err(CliError::new(
                        TIMEOUT,
                        format!("no frame within {timeout:?} (round {round})"),
                    ))
                }
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(CliError::new(FAILURE, "reader stopped unexpectedly"))
                }
            };
            print_frame(id, &body, format);
            verify(expected, id, &body)?;
        }
    }

    // Stop the reader first: closing the host end would otherwise surface
    // as a transport failure on the device end.
    stream
        .stop()
        .map_err(|err| frame_error("reader failed", err))?;
    packetizer
        .close()
        .map_err(|err| frame_error("close failed", err))?;

    let totals = counters.snapshot();
    info!(
        rounds = args.repeat,
        tx_bytes = totals.tx_bytes,
        rx_bytes = totals.rx_bytes,
        "loopback passed"
    );
    Ok(SUCCESS)
}

fn verify(expected: &Frame, id: u8, body: &[u32]) -> CliResult<()> {
    if expected.id() == id && expected.body == body {
        return Ok(());
    }
    Err(CliError::new(
        DATA_INVALID,
        format!(
            "unexpected frame: got id {id} with {} words, expected id {} with {} words",
            body.len(),
            expected.id(),
            expected.body.len()
        ),
    ))
}

#[cfg(test)]
mod tests {
    use sdrlink_frame::{Demultiplexer, Header};

    use super::*;

    #[test]
    fn pattern_matches_device_self_test() {
        let pattern = test_pattern().unwrap();
        assert_eq!(pattern.len(), 4);
        assert_eq!(pattern[0].header, Header::Message { id: 4, num: 0 });
        assert_eq!(pattern[1].header, Header::Stream { num: 1023 });
        assert_eq!(pattern[1].body[2], 0x0002_0002);
        assert_eq!(pattern[1].body[1022], 0x03FE_03FE);
        assert_eq!(pattern[3].body, vec![13, 7]);
    }

    #[test]
    fn send_pattern_produces_identical_wire_frames() {
        let pattern = test_pattern().unwrap();
        let (host, mut device) = MemoryPipe::pair();
        let mut packetizer = Packetizer::new(host);
        send_pattern(&mut packetizer, &pattern).unwrap();

        let mut demux = Demultiplexer::new();
        let mut received = Vec::new();
        let mut buf = vec![0u8; 64 * 1024];
        while received.len() < pattern.len() {
            let transfer = device.read(&mut buf, Duration::from_millis(100));
            assert!(transfer.bytes > 0, "pattern truncated");
            demux.feed(&buf[..transfer.bytes], |f| received.push(f));
        }
        assert_eq!(received, pattern);
    }

    #[test]
    fn verify_rejects_wrong_body() {
        let expected = Frame::message(7, vec![13, 7]).unwrap();
        assert!(verify(&expected, 7, &[13, 7]).is_ok());
        assert_eq!(verify(&expected, 7, &[13]).unwrap_err().code, DATA_INVALID);
        assert_eq!(verify(&expected, 6, &[13, 7]).unwrap_err().code, DATA_INVALID);
    }
}
