use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::Parser;
use spidet::{io, logging, ActivationFunction, ThresholdConfig, ThresholdGenerator};
use tracing::info;

#[derive(Parser)]
#[command(
    name = "rescore",
    about = "Re-threshold stored activation functions without re-running NMF"
)]
struct Args {
    /// Decomposition safetensors written by `spidet`
    #[arg(long, conflicts_with = "table")]
    functions: Option<PathBuf>,

    /// Row-per-pattern activation CSV (`label,v0,v1,...`)
    #[arg(long, requires = "sfreq")]
    table: Option<PathBuf>,

    /// Sample rate of the CSV rows in Hz
    #[arg(long)]
    sfreq: Option<f64>,

    /// Timestamp of the first CSV column
    #[arg(long, default_value_t = 0.0)]
    start_timestamp: f64,

    /// Fixed threshold; computed per activation when absent
    #[arg(long)]
    threshold: Option<f64>,

    /// Robust-deviation multiplier of the computed threshold
    #[arg(long, default_value_t = 5.0)]
    scale: f64,

    /// Minimum event duration in seconds
    #[arg(long, default_value_t = 0.0)]
    min_duration: f64,

    /// Merge events closer than this many seconds
    #[arg(long, default_value_t = 0.0)]
    min_gap: f64,

    /// Drop events touching the first or last sample
    #[arg(long)]
    drop_boundary: bool,

    /// Events CSV output (stdout when absent)
    #[arg(long)]
    output: Option<PathBuf>,
}

fn load(args: &Args) -> Result<Vec<ActivationFunction>> {
    match (&args.functions, &args.table) {
        (Some(path), _) => io::load_activation_functions(path),
        (None, Some(path)) => {
            let f = File::open(path).with_context(|| format!("opening {}", path.display()))?;
            let sfreq = args.sfreq.context("--sfreq is required with --table")?;
            io::read_activation_table(BufReader::new(f), args.start_timestamp, sfreq)
        }
        (None, None) => bail!("one of --functions or --table is required"),
    }
}

fn main() -> Result<()> {
    logging::init_tracing();
    let args = Args::parse();
    let afs = load(&args)?;

    let generator = ThresholdGenerator::new(ThresholdConfig {
        scale: args.scale,
        min_duration: args.min_duration,
        min_gap: args.min_gap,
        drop_boundary_events: args.drop_boundary,
    });
    let mut events = Vec::new();
    for af in &afs {
        let found = match args.threshold {
            Some(t) => generator.find_events(af, t),
            None => generator.detect(af),
        }
        .with_context(|| format!("thresholding {}", af.unique_id))?;
        info!(function = %af.unique_id, events = found.len(), "rescored");
        events.extend(found);
    }

    let writer: Box<dyn Write> = match &args.output {
        Some(p) => {
            let f = File::create(p).with_context(|| format!("creating {}", p.display()))?;
            Box::new(BufWriter::new(f))
        }
        None => Box::new(std::io::stdout().lock()),
    };
    io::write_events(writer, &events)?;
    Ok(())
}
