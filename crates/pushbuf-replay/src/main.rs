#![forbid(unsafe_code)]

use std::fs::File;
use std::io::{self, BufReader, Write};
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;

use pushbuf_channel::WrapperConfig;
use pushbuf_replay::{format_entry, read_script, replay};

#[derive(Debug, Parser)]
#[command(
    name = "pushbuf-replay",
    about = "Replay a channel operation script and print what the leaf channel saw"
)]
struct Args {
    /// JSON script to replay.
    #[arg(value_name = "SCRIPT")]
    script: PathBuf,

    /// Wrapper config as JSON. Falls back to the environment when omitted.
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Print the full report as JSON instead of one line per trace entry.
    #[arg(long)]
    json: bool,
}

fn load_config(path: Option<&PathBuf>) -> Result<WrapperConfig> {
    let Some(path) = path else {
        return Ok(WrapperConfig::global().clone());
    };
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("read config {}", path.display()))?;
    WrapperConfig::from_json(&raw).with_context(|| format!("parse config {}", path.display()))
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(io::stderr)
        .init();

    let args = Args::parse();
    let config = load_config(args.config.as_ref())?;

    let file = File::open(&args.script)
        .with_context(|| format!("open script {}", args.script.display()))?;
    let script = read_script(BufReader::new(file))
        .with_context(|| format!("load script {}", args.script.display()))?;
    tracing::debug!(ops = script.ops.len(), layers = ?config.layers, "replaying script");

    let report = replay(&script, &config).context("replay failed")?;

    let stdout = io::stdout();
    let mut out = stdout.lock();
    if args.json {
        serde_json::to_writer_pretty(&mut out, &report)?;
        writeln!(out)?;
        return Ok(());
    }

    for (index, entry) in report.trace.iter().enumerate() {
        writeln!(out, "{index:4} {}", format_entry(entry))?;
    }
    for notification in &report.notifications {
        writeln!(
            out,
            "notify engine={:?} put={} gp_put={}",
            notification.engine, notification.pointers.put, notification.pointers.gp_put
        )?;
    }
    for resolution in &report.resolutions {
        writeln!(
            out,
            "resolve #{} {:x?} -> {:?}",
            resolution.op_index, resolution.classes, resolution.result
        )?;
    }
    if let Some(stats) = report.atom_stats {
        writeln!(
            out,
            "atoms replayed={} raw_blocks={} deferred={}",
            stats.atoms_replayed, stats.raw_blocks_emitted, stats.ops_deferred
        )?;
    }
    Ok(())
}
