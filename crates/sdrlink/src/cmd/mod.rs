use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Subcommand, ValueEnum};
use tokio_util::sync::CancellationToken;

use crate::exit::{CliError, CliResult, INTERNAL, USAGE};
use crate::output::OutputFormat;

pub mod bench;
pub mod doctor;
pub mod envinfo;
pub mod listen;
pub mod loopback;
pub mod replay;
pub mod send;
pub mod version;

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Connect to a pipe and send stream words or one message.
    Send(SendArgs),
    /// Accept connections and print received frames.
    Listen(ListenArgs),
    /// Push the canned test pattern through an in-memory pipe.
    Loopback(LoopbackArgs),
    /// Decode frames from a captured byte file.
    Replay(ReplayArgs),
    /// Measure raw pipe throughput with back-to-back bulk transfers.
    Bench(BenchArgs),
    /// Show version information.
    Version(VersionArgs),
    /// Run local environment health checks.
    Doctor(DoctorArgs),
    /// Print build and environment diagnostics.
    Envinfo(EnvinfoArgs),
}

pub fn run(command: Command, format: OutputFormat) -> CliResult<i32> {
    match command {
        Command::Send(args) => send::run(args, format),
        Command::Listen(args) => listen::run(args, format),
        Command::Loopback(args) => loopback::run(args, format),
        Command::Replay(args) => replay::run(args, format),
        Command::Bench(args) => bench::run(args, format),
        Command::Version(args) => version::run(args),
        Command::Doctor(args) => doctor::run(args, format),
        Command::Envinfo(args) => envinfo::run(args, format),
    }
}

#[derive(Args, Debug)]
pub struct SendArgs {
    /// Socket path to connect to.
    pub path: PathBuf,
    /// Send a message with this id (0-7); --words becomes its body.
    #[arg(long, short = 'm', value_parser = clap::value_parser!(u8).range(0..=7))]
    pub message: Option<u8>,
    /// Words to send, comma-separated (decimal or 0x-prefixed hex).
    #[arg(
        long,
        value_delimiter = ',',
        value_parser = parse_word,
        conflicts_with_all = ["ramp", "file"]
    )]
    pub words: Option<Vec<u32>>,
    /// Stream N words of the ramp test pattern.
    #[arg(long, value_name = "N", conflicts_with_all = ["words", "file", "message"])]
    pub ramp: Option<usize>,
    /// Stream the raw little-endian contents of a file.
    #[arg(long, conflicts_with_all = ["words", "ramp", "message"])]
    pub file: Option<PathBuf>,
    /// Words per stream frame.
    #[arg(long, env = "SDRLINK_CAPACITY", default_value = "1023")]
    pub capacity: usize,
    /// Timeout for each pipe write (e.g. 1s, 500ms).
    #[arg(long, env = "SDRLINK_WRITE_TIMEOUT", default_value = "1000ms")]
    pub write_timeout: String,
}

#[derive(Args, Debug)]
pub struct ListenArgs {
    /// Socket path to bind.
    pub path: PathBuf,
    /// Only print frames with these ids (comma-separated; streams are id 0).
    #[arg(long, value_delimiter = ',')]
    pub ids: Option<Vec<u8>>,
    /// Exit after printing N frames.
    #[arg(long)]
    pub count: Option<usize>,
    /// Log receive throughput while listening.
    #[arg(long)]
    pub stats: bool,
    /// Throughput reporting interval (e.g. 1s, 250ms).
    #[arg(long, default_value = "1s")]
    pub stats_interval: String,
    /// Timeout for each pipe read (e.g. 100ms).
    #[arg(long, env = "SDRLINK_READ_TIMEOUT", default_value = "100ms")]
    pub read_timeout: String,
    /// Receive buffer size in words, header slot included.
    #[arg(long, env = "SDRLINK_RECEIVE_CAPACITY", default_value = "1024")]
    pub capacity: usize,
}

#[derive(Args, Debug)]
pub struct LoopbackArgs {
    /// Send the test pattern this many times.
    #[arg(long, default_value = "1")]
    pub repeat: usize,
    /// Maximum time to wait for each frame (e.g. 5s, 500ms).
    #[arg(long, default_value = "5s")]
    pub timeout: String,
}

#[derive(Args, Debug)]
pub struct ReplayArgs {
    /// Captured inbound bytes, as read from the device.
    pub file: PathBuf,
    /// Bytes fed to the parser per read.
    #[arg(long, default_value = "4096")]
    pub chunk: usize,
    /// Only print frames with these ids (comma-separated; streams are id 0).
    #[arg(long, value_delimiter = ',')]
    pub ids: Option<Vec<u8>>,
    /// Stop after printing N frames.
    #[arg(long)]
    pub count: Option<usize>,
    /// Receive buffer size in words, header slot included.
    #[arg(long, env = "SDRLINK_RECEIVE_CAPACITY", default_value = "1024")]
    pub capacity: usize,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum BenchMode {
    Write,
    Read,
    Both,
}

#[derive(Args, Debug)]
pub struct BenchArgs {
    /// Socket path to connect to.
    pub path: PathBuf,
    /// Which direction(s) to exercise.
    #[arg(long, value_enum, default_value = "write")]
    pub mode: BenchMode,
    /// Throughput reporting interval (e.g. 1s, 250ms).
    #[arg(long, default_value = "1s")]
    pub interval: String,
    /// Stop after this long; runs until Ctrl-C when omitted.
    #[arg(long)]
    pub duration: Option<String>,
    /// Timeout for each bulk transfer (e.g. 1s, 500ms).
    #[arg(long, default_value = "1000ms")]
    pub timeout: String,
}

#[derive(Args, Debug)]
pub struct VersionArgs {
    /// Show extended build provenance.
    #[arg(long)]
    pub extended: bool,
}

#[derive(Args, Debug, Default)]
pub struct DoctorArgs {}

#[derive(Args, Debug, Default)]
pub struct EnvinfoArgs {}

/// Parse `500ms`, `2s` or a bare number of seconds.
pub fn parse_duration(input: &str) -> CliResult<Duration> {
    let input = input.trim();
    if input.is_empty() {
        return Err(CliError::new(USAGE, "duration must not be empty"));
    }

    let (number, millis) = if let Some(num) = input.strip_suffix("ms") {
        (num, true)
    } else if let Some(num) = input.strip_suffix('s') {
        (num, false)
    } else {
        (input, false)
    };

    let value: u64 = number
        .parse()
        .map_err(|_| CliError::new(USAGE, format!("invalid duration value: {input}")))?;

    if value == 0 {
        return Err(CliError::new(USAGE, "duration must be greater than zero"));
    }

    if millis {
        Ok(Duration::from_millis(value))
    } else {
        Ok(Duration::from_secs(value))
    }
}

/// Parse a decimal or `0x`-prefixed hex word.
pub fn parse_word(input: &str) -> Result<u32, String> {
    let input = input.trim();
    let parsed = match input
        .strip_prefix("0x")
        .or_else(|| input.strip_prefix("0X"))
    {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => input.parse(),
    };
    parsed.map_err(|err| format!("invalid word {input:?}: {err}"))
}

/// The device test ramp: word `i` carries `v` in both halves, `v = i % 4096`.
pub fn ramp(len: usize) -> Vec<u32> {
    (0..len)
        .map(|i| {
            let v = (i % 4096) as u32;
            v + (v << 16)
        })
        .collect()
}

/// Cancel `token` on Ctrl-C.
pub fn install_ctrlc_handler(token: CancellationToken) -> CliResult<()> {
    ctrlc::set_handler(move || token.cancel())
        .map_err(|err| CliError::new(INTERNAL, format!("signal handler setup failed: {err}")))
}
