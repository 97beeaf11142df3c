use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use comfy_table::{presets::UTF8_FULL, Table};
use sdrlink_frame::{
    encode_stream, LinkCounters, Throughput, ThroughputMonitor, DEFAULT_STREAM_CAPACITY,
};
use sdrlink_transport::{Pipe, TransferStatus, UnixPipe};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cmd::{install_ctrlc_handler, parse_duration, ramp, BenchArgs, BenchMode};
use crate::exit::{transport_error, CliError, CliResult, INTERNAL, SUCCESS, TRANSPORT_ERROR};
use crate::output::OutputFormat;

/// Bytes per bulk transfer.
const BUFFER_LEN: usize = 32 * 1024;

const POLL: Duration = Duration::from_millis(50);

/// How a transfer loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoopExit {
    Cancelled,
    TransportFailed,
}

#[derive(Debug, Serialize)]
struct BenchReport {
    mode: &'static str,
    seconds: f64,
    tx_bytes: u64,
    rx_bytes: u64,
    tx_mbps: f64,
    rx_mbps: f64,
}

pub fn run(args: BenchArgs, format: OutputFormat) -> CliResult<i32> {
    let interval = parse_duration(&args.interval)?;
    let timeout = parse_duration(&args.timeout)?;
    let duration = args.duration.as_deref().map(parse_duration).transpose()?;

    let shutdown = CancellationToken::new();
    install_ctrlc_handler(shutdown.clone())?;

    let pipe =
        UnixPipe::connect(&args.path).map_err(|err| transport_error("connect failed", err))?;

    // Workers stop on Ctrl-C, at the deadline or when either direction fails.
    let run = shutdown.child_token();
    let counters = LinkCounters::new();
    let totals = LinkCounters::new();
    let sink_totals = Arc::clone(&totals);
    let monitor = ThroughputMonitor::spawn_with(counters.clone(), interval, &run, move |t| {
        sink_totals.record_tx(t.tx_bytes as usize);
        sink_totals.record_rx(t.rx_bytes as usize);
        info!(
            "TX:{:.2}MB/s RX:{:.2}MB/s total:{:.2}MB",
            t.tx_mbps(interval),
            t.rx_mbps(interval),
            t.total_bytes() as f64 / 1_000_000.0
        );
    })
    .map_err(|err| CliError::new(INTERNAL, format!("stats monitor failed: {err}")))?;

    let started = Instant::now();
    let mut workers = Vec::new();
    match args.mode {
        BenchMode::Write => workers.push(spawn_writer(pipe, timeout, &counters, &run)?),
        BenchMode::Read => workers.push(spawn_reader(pipe, timeout, &counters, &run)?),
        BenchMode::Both => {
            let reader = pipe
                .try_clone()
                .map_err(|err| transport_error("pipe clone failed", err))?;
            workers.push(spawn_reader(reader, timeout, &counters, &run)?);
            workers.push(spawn_writer(pipe, timeout, &counters, &run)?);
        }
    }

    while !run.is_cancelled() {
        if duration.is_some_and(|limit| started.elapsed() >= limit) {
            debug!("bench duration reached");
            break;
        }
        thread::sleep(POLL);
    }
    run.cancel();

    let mut failed = false;
    for worker in workers {
        match worker.join() {
            Ok(LoopExit::Cancelled) => {}
            Ok(LoopExit::TransportFailed) => failed = true,
            Err(_) => return Err(CliError::new(INTERNAL, "bench worker panicked")),
        }
    }
    let elapsed = started.elapsed();
    monitor.stop();

    let rest = counters.take();
    totals.record_tx(rest.tx_bytes as usize);
    totals.record_rx(rest.rx_bytes as usize);
    let report = report(args.mode, elapsed, totals.snapshot());
    info!(
        tx_bytes = report.tx_bytes,
        rx_bytes = report.rx_bytes,
        "bench finished"
    );
    print_report(&report, format);

    if failed {
        return Err(CliError::new(TRANSPORT_ERROR, "pipe failed during bench"));
    }
    Ok(SUCCESS)
}

fn spawn_writer(
    mut pipe: UnixPipe,
    timeout: Duration,
    counters: &Arc<LinkCounters>,
    cancel: &CancellationToken,
) -> CliResult<JoinHandle<LoopExit>> {
    let counters = Arc::clone(counters);
    let cancel = cancel.clone();
    thread::Builder::new()
        .name("sdrlink-bench-write".to_string())
        .spawn(move || write_loop(&mut pipe, timeout, &counters, &cancel))
        .map_err(|err| CliError::new(INTERNAL, format!("failed to spawn writer: {err}")))
}

fn spawn_reader(
    mut pipe: UnixPipe,
    timeout: Duration,
    counters: &Arc<LinkCounters>,
    cancel: &CancellationToken,
) -> CliResult<JoinHandle<LoopExit>> {
    let counters = Arc::clone(counters);
    let cancel = cancel.clone();
    thread::Builder::new()
        .name("sdrlink-bench-read".to_string())
        .spawn(move || read_loop(&mut pipe, timeout, &counters, &cancel))
        .map_err(|err| CliError::new(INTERNAL, format!("failed to spawn reader: {err}")))
}

/// One bulk buffer of back-to-back full stream frames, so a framing peer
/// stays in sync while it drains the traffic.
fn test_buffer() -> Vec<u8> {
    let frame_words = DEFAULT_STREAM_CAPACITY + 1;
    let header = encode_stream(DEFAULT_STREAM_CAPACITY as u16);
    let body = ramp(DEFAULT_STREAM_CAPACITY);

    let mut buf = Vec::with_capacity(BUFFER_LEN);
    for _ in 0..BUFFER_LEN / (frame_words * 4) {
        buf.extend_from_slice(&header.to_le_bytes());
        for word in &body {
            buf.extend_from_slice(&word.to_le_bytes());
        }
    }
    buf
}

/// Write the test buffer until `cancel` fires or the pipe fails. A failure
/// cancels `cancel` so the other direction stops too.
fn write_loop<P: Pipe>(
    pipe: &mut P,
    timeout: Duration,
    counters: &LinkCounters,
    cancel: &CancellationToken,
) -> LoopExit {
    let buf = test_buffer();
    while !cancel.is_cancelled() {
        let transfer = pipe.write(&buf, timeout);
        counters.record_tx(transfer.bytes);
        if transfer.status == TransferStatus::Error {
            warn!(written = transfer.bytes, "bench write failed");
            cancel.cancel();
            return LoopExit::TransportFailed;
        }
    }
    debug!("bench writer stopped");
    LoopExit::Cancelled
}

/// Read bulk buffers until `cancel` fires or the pipe fails.
fn read_loop<P: Pipe>(
    pipe: &mut P,
    timeout: Duration,
    counters: &LinkCounters,
    cancel: &CancellationToken,
) -> LoopExit {
    let mut buf = vec![0u8; BUFFER_LEN];
    while !cancel.is_cancelled() {
        let transfer = pipe.read(&mut buf, timeout);
        counters.record_rx(transfer.bytes);
        if transfer.status == TransferStatus::Error {
            warn!("bench read failed");
            cancel.cancel();
            return LoopExit::TransportFailed;
        }
    }
    debug!("bench reader stopped");
    LoopExit::Cancelled
}

fn report(mode: BenchMode, elapsed: Duration, totals: Throughput) -> BenchReport {
    BenchReport {
        mode: match mode {
            BenchMode::Write => "write",
            BenchMode::Read => "read",
            BenchMode::Both => "both",
        },
        seconds: elapsed.as_secs_f64(),
        tx_bytes: totals.tx_bytes,
        rx_bytes: totals.rx_bytes,
        tx_mbps: totals.tx_mbps(elapsed),
        rx_mbps: totals.rx_mbps(elapsed),
    }
}

fn print_report(report: &BenchReport, format: OutputFormat) {
    match format {
        OutputFormat::Json => println!(
            "{}",
            serde_json::to_string(report).unwrap_or_else(|_| "{}".to_string())
        ),
        OutputFormat::Table => {
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_header(vec![
                    "MODE", "SECONDS", "TX BYTES", "RX BYTES", "TX MB/s", "RX MB/s",
                ])
                .add_row(vec![
                    report.mode.to_string(),
                    format!("{:.2}", report.seconds),
                    report.tx_bytes.to_string(),
                    report.rx_bytes.to_string(),
                    format!("{:.2}", report.tx_mbps),
                    format!("{:.2}", report.rx_mbps),
                ]);
            println!("{table}");
        }
        OutputFormat::Pretty => println!(
            "{} {:.2}s TX:{:.2}MB/s RX:{:.2}MB/s ({} / {} bytes)",
            report.mode,
            report.seconds,
            report.tx_mbps,
            report.rx_mbps,
            report.tx_bytes,
            report.rx_bytes
        ),
        OutputFormat::Raw => println!("{} {}", report.tx_bytes, report.rx_bytes),
    }
}
