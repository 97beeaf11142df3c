use std::io::{IsTerminal, Write};
use std::time::{SystemTime, UNIX_EPOCH};

use clap::ValueEnum;
use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};
use serde::Serialize;

/// Words shown in table/pretty previews before eliding the rest.
const PREVIEW_WORDS: usize = 8;

#[derive(Clone, Debug, Copy, ValueEnum)]
pub enum OutputFormat {
    Json,
    Table,
    Pretty,
    Raw,
}

impl OutputFormat {
    pub fn default_for_stdout() -> Self {
        if std::io::stdout().is_terminal() {
            Self::Table
        } else {
            Self::Json
        }
    }
}

#[derive(Serialize)]
struct FrameOutput<'a> {
    id: u8,
    words: usize,
    body: &'a [u32],
    timestamp: String,
}

pub fn print_frame(id: u8, body: &[u32], format: OutputFormat) {
    match format {
        OutputFormat::Json => {
            let out = FrameOutput {
                id,
                words: body.len(),
                body,
                timestamp: now_unix_seconds(),
            };
            println!(
                "{}",
                serde_json::to_string(&out).unwrap_or_else(|_| "{}".to_string())
            );
        }
        OutputFormat::Table => {
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(vec!["ID", "WORDS", "DATA"])
                .add_row(vec![
                    id.to_string(),
                    body.len().to_string(),
                    body_preview(body),
                ]);
            println!("{table}");
        }
        OutputFormat::Pretty => {
            println!("id={id} words={} data={}", body.len(), body_preview(body));
        }
        OutputFormat::Raw => {
            let bytes: Vec<u8> = body.iter().flat_map(|w| w.to_le_bytes()).collect();
            print_raw(&bytes);
        }
    }
}

pub fn print_raw(data: &[u8]) {
    let mut out = std::io::stdout();
    let _ = out.write_all(data);
    let _ = out.flush();
}

fn body_preview(body: &[u32]) -> String {
    let mut shown: Vec<String> = body
        .iter()
        .take(PREVIEW_WORDS)
        .map(|w| format!("{w:#010x}"))
        .collect();
    if body.len() > PREVIEW_WORDS {
        shown.push(format!("... +{}", body.len() - PREVIEW_WORDS));
    }
    shown.join(" ")
}

fn now_unix_seconds() -> String {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs().to_string())
        .unwrap_or_else(|_| "0".to_string())
}
