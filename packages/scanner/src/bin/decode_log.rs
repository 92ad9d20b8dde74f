//! decode-log: decode contract log entries against a scan config.
//!
//! ```
//! decode-log --config <config.json> [--log <log.json>]
//! ```
//!
//! The log file holds one log object or an array of them, in either the
//! scanner's camelCase layout or the node's PascalCase layout. Reads stdin
//! when `--log` is omitted.

use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use serde::Deserialize;
use tracing::info;

use viewer_scan::config::ScanConfig;
use viewer_scan::decoder::EventLogDecoder;
use viewer_scan::logging;
use viewer_scan::transaction::Log;

#[derive(Parser)]
#[command(name = "decode-log", about = "Decode contract log payloads into JSON", version)]
struct Cli {
    /// Scan config with the contract schema table
    #[arg(short, long)]
    config: PathBuf,

    /// Log JSON file (default: stdin)
    #[arg(short, long)]
    log: Option<PathBuf>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum LogInput {
    One(Log),
    Many(Vec<Log>),
}

fn main() -> Result<()> {
    logging::init();
    let cli = Cli::parse();

    let config = ScanConfig::from_file(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    let decoder = EventLogDecoder::new(Arc::new(config));

    let raw = match &cli.log {
        Some(path) => std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?,
        None => {
            let mut buf = String::new();
            std::io::stdin().read_to_string(&mut buf).context("reading stdin")?;
            buf
        }
    };
    let input: LogInput = serde_json::from_str(&raw).context("parsing log JSON")?;
    let logs = match input {
        LogInput::One(log) => vec![log],
        LogInput::Many(logs) => logs,
    };

    let mut decoded = Vec::with_capacity(logs.len());
    for log in &logs {
        let event = decoder
            .decode_log(log)
            .with_context(|| format!("decoding {} from {}", log.name, log.address))?;
        decoded.push(event);
    }
    info!("Decoded {} log(s)", decoded.len());

    let output = if decoded.len() == 1 {
        serde_json::to_string_pretty(&decoded[0])?
    } else {
        serde_json::to_string_pretty(&decoded)?
    };
    println!("{output}");
    Ok(())
}
