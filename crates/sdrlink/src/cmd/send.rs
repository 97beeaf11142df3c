use std::fs::File;
use std::io;

use comfy_table::{presets::UTF8_FULL, Table};
use sdrlink_frame::{LinkCounters, Packetizer, PacketizerConfig, WORD_SIZE};
use sdrlink_transport::{Pipe, UnixPipe};
use serde::Serialize;
use tracing::info;

use crate::cmd::{parse_duration, ramp, SendArgs};
use crate::exit::{frame_error, io_error, transport_error, CliResult, SUCCESS};
use crate::output::OutputFormat;

/// What one `send` invocation put on the wire.
#[derive(Debug, Serialize)]
struct SendReport {
    kind: &'static str,
    id: u8,
    words: usize,
    bytes: u64,
}

enum Payload {
    Message { id: u8, body: Vec<u32> },
    Words(Vec<u32>),
    File(File),
}

pub fn run(args: SendArgs, format: OutputFormat) -> CliResult<i32> {
    let config = PacketizerConfig {
        capacity: args.capacity,
        write_timeout: parse_duration(&args.write_timeout)?,
    };
    let payload = resolve_payload(&args)?;

    let pipe = UnixPipe::connect(&args.path).map_err(|err| transport_error("connect failed", err))?;
    let counters = LinkCounters::new();
    let mut packetizer = Packetizer::with_config(pipe, config).with_counters(counters.clone());

    let (kind, id, words) = match payload {
        Payload::Message { id, body } => {
            packetizer
                .send_message(id, &body)
                .map_err(|err| frame_error("send failed", err))?;
            ("message", id, body.len())
        }
        Payload::Words(words) => {
            packetizer
                .write_words(&words)
                .map_err(|err| frame_error("send failed", err))?;
            ("stream", 0, words.len())
        }
        Payload::File(mut file) => ("stream", 0, copy_words(&mut file, &mut packetizer)?),
    };
    packetizer
        .close()
        .map_err(|err| frame_error("flush failed", err))?;

    let report = SendReport {
        kind,
        id,
        words,
        bytes: counters.snapshot().tx_bytes,
    };
    info!(kind, words, bytes = report.bytes, "send complete");
    print_report(&report, format);
    Ok(SUCCESS)
}

fn resolve_payload(args: &SendArgs) -> CliResult<Payload> {
    if let Some(id) = args.message {
        return Ok(Payload::Message {
            id,
            body: args.words.clone().unwrap_or_default(),
        });
    }
    if let Some(words) = &args.words {
        return Ok(Payload::Words(words.clone()));
    }
    if let Some(len) = args.ramp {
        return Ok(Payload::Words(ramp(len)));
    }
    if let Some(path) = &args.file {
        let file = File::open(path)
            .map_err(|err| io_error(&format!("failed opening {}", path.display()), err))?;
        return Ok(Payload::File(file));
    }
    Ok(Payload::Words(Vec::new()))
}

/// Stream a reader through the packetizer. Returns the number of whole
/// words taken; a trailing partial word is reported when the packetizer is
/// closed.
fn copy_words<R: io::Read, P: Pipe>(
    reader: &mut R,
    packetizer: &mut Packetizer<P>,
) -> CliResult<usize> {
    let copied = io::copy(reader, packetizer).map_err(|err| io_error("send failed", err))?;
    Ok(copied as usize / WORD_SIZE)
}

fn print_report(report: &SendReport, format: OutputFormat) {
    match format {
        OutputFormat::Json => println!(
            "{}",
            serde_json::to_string(report).unwrap_or_else(|_| "{}".to_string())
        ),
        OutputFormat::Table => {
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_header(vec!["KIND", "ID", "WORDS", "BYTES"])
                .add_row(vec![
                    report.kind.to_string(),
                    report.id.to_string(),
                    report.words.to_string(),
                    report.bytes.to_string(),
                ]);
            println!("{table}");
        }
        OutputFormat::Pretty => println!(
            "sent {} id={} words={} bytes={}",
            report.kind, report.id, report.words, report.bytes
        ),
        OutputFormat::Raw => println!("{}", report.bytes),
    }
}
