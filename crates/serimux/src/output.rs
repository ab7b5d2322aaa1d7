use std::io::{IsTerminal, Write};

use clap::ValueEnum;
use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};
use serde::Serialize;

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

/// Outcome of `serimux connect`.
#[derive(Debug, Serialize)]
pub struct ConnectReport {
    pub service: String,
    pub verdict: &'static str,
    pub accepted: bool,
    pub sent_size: usize,
    pub reply: Option<String>,
    pub reply_size: usize,
}

/// Traffic counters printed when `serimux remote` stops.
#[derive(Debug, Default, Serialize)]
pub struct RemoteReport {
    pub accepted: u64,
    pub refused: u64,
    pub echoed_frames: u64,
    pub echoed_bytes: u64,
    pub disconnects: u64,
}

pub fn print_connect(report: &ConnectReport, reply: &[u8], format: OutputFormat) {
    match format {
        OutputFormat::Json => print_json(report),
        OutputFormat::Table => {
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(vec!["SERVICE", "VERDICT", "SENT", "REPLY"])
                .add_row(vec![
                    report.service.clone(),
                    report.verdict.to_string(),
                    report.sent_size.to_string(),
                    report.reply.clone().unwrap_or_default(),
                ]);
            println!("{table}");
        }
        OutputFormat::Pretty => {
            println!(
                "service={} verdict={} sent={} reply={}",
                report.service,
                report.verdict,
                report.sent_size,
                report.reply.as_deref().unwrap_or("-")
            );
        }
        OutputFormat::Raw => {
            if report.sent_size == 0 {
                print_raw(report.verdict.as_bytes());
            } else {
                print_raw(reply);
            }
        }
    }
}

pub fn print_remote(report: &RemoteReport, format: OutputFormat) {
    match format {
        OutputFormat::Json => print_json(report),
        OutputFormat::Table => {
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(vec!["ACCEPTED", "REFUSED", "FRAMES", "BYTES", "DISCONNECTS"])
                .add_row(vec![
                    report.accepted.to_string(),
                    report.refused.to_string(),
                    report.echoed_frames.to_string(),
                    report.echoed_bytes.to_string(),
                    report.disconnects.to_string(),
                ]);
            println!("{table}");
        }
        OutputFormat::Pretty | OutputFormat::Raw => {
            println!(
                "accepted={} refused={} echoed_frames={} echoed_bytes={} disconnects={}",
                report.accepted,
                report.refused,
                report.echoed_frames,
                report.echoed_bytes,
                report.disconnects
            );
        }
    }
}

pub fn print_json<T: Serialize>(value: &T) {
    println!(
        "{}",
        serde_json::to_string(value).unwrap_or_else(|_| "{}".to_string())
    );
}

pub fn print_raw(data: &[u8]) {
    let mut out = std::io::stdout();
    let _ = out.write_all(data);
    let _ = out.flush();
}

pub fn payload_preview(payload: &[u8]) -> String {
    match std::str::from_utf8(payload) {
        Ok(text) => text.to_string(),
        Err(_) => format!("<binary {} bytes>", payload.len()),
    }
}
