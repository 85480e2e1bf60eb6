use std::fs::File;
use std::io::BufWriter;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use spidet::{detect_spikes, io, logging, DetectionConfig, RankPolicy, SparseFactor};
use tracing::info;

#[derive(Parser)]
#[command(name = "spidet", about = "NMF spike detection on an iEEG recording")]
struct Args {
    /// Recording safetensors (`data` [C, T], `sfreq`, optional `ch_names`)
    #[arg(long)]
    input: PathBuf,

    /// Decomposition safetensors output (W, H and function metadata)
    #[arg(long)]
    output: PathBuf,

    /// Events CSV output
    #[arg(long)]
    events: PathBuf,

    /// JSON detection config; flags below override its fields
    #[arg(long)]
    config: Option<PathBuf>,

    /// Timestamp of the first sample (seconds since the Unix epoch)
    #[arg(long, default_value_t = 0.0)]
    start_timestamp: f64,

    /// Smallest rank to factorize
    #[arg(long)]
    k_min: Option<usize>,

    /// Largest rank to factorize
    #[arg(long)]
    k_max: Option<usize>,

    /// NMF runs per rank
    #[arg(long)]
    runs: Option<usize>,

    /// Target sparseness in [0, 1] (enables the sparse rule)
    #[arg(long)]
    sparseness: Option<f64>,

    /// Put the sparseness constraint on H instead of W
    #[arg(long)]
    sparse_activations: bool,

    #[arg(long)]
    seed: Option<u64>,

    /// Rank policy: all, lowest_error, stability, consensus_cdf
    #[arg(long)]
    rank_policy: Option<String>,

    /// Prefix of the unique function ids
    #[arg(long)]
    id_prefix: Option<String>,

    /// Also write the activations as a row-per-pattern CSV
    #[arg(long)]
    activations_csv: Option<PathBuf>,

    /// Also write rank summaries and run diagnostics as JSON
    #[arg(long)]
    summary: Option<PathBuf>,
}

fn load_config(args: &Args) -> Result<DetectionConfig> {
    let mut cfg: DetectionConfig = match &args.config {
        Some(p) => {
            let text =
                std::fs::read_to_string(p).with_context(|| format!("reading {}", p.display()))?;
            serde_json::from_str(&text).with_context(|| format!("parsing {}", p.display()))?
        }
        None => DetectionConfig::default(),
    };
    let (k_min, k_max) = cfg.nmf.rank_range;
    cfg.nmf.rank_range = (args.k_min.unwrap_or(k_min), args.k_max.unwrap_or(k_max));
    if let Some(n) = args.runs {
        cfg.nmf.n_runs = n;
    }
    if args.sparseness.is_some() {
        cfg.nmf.sparseness = args.sparseness;
    }
    if args.sparse_activations {
        cfg.nmf.sparse_factor = SparseFactor::Activation;
    }
    if let Some(seed) = args.seed {
        cfg.nmf.seed = seed;
    }
    if let Some(policy) = &args.rank_policy {
        let value = serde_json::Value::String(policy.clone());
        cfg.rank_policy = serde_json::from_value::<RankPolicy>(value)
            .with_context(|| format!("unknown rank policy '{policy}'"))?;
    }
    if let Some(prefix) = &args.id_prefix {
        cfg.id_prefix = prefix.clone();
    }
    Ok(cfg)
}

fn main() -> Result<()> {
    logging::init_tracing();
    let args = Args::parse();
    let cfg = load_config(&args)?;

    let traces = io::load_traces(&args.input, args.start_timestamp)?;
    info!(
        channels = traces.len(),
        samples = traces.first().map_or(0, |t| t.len()),
        "loaded {}",
        args.input.display()
    );

    let out = detect_spikes(&traces, &cfg)?;

    let basis: Vec<_> = out.basis().cloned().collect();
    let activations: Vec<_> = out.activations().cloned().collect();
    io::write_functions(&args.output, &basis, &activations)?;
    println!("Written {} functions → {}", activations.len(), args.output.display());

    let events: Vec<_> = out.events.iter().flatten().cloned().collect();
    let f = File::create(&args.events)
        .with_context(|| format!("creating {}", args.events.display()))?;
    io::write_events(BufWriter::new(f), &events)?;
    println!("Written {} events → {}", events.len(), args.events.display());

    if let Some(path) = &args.activations_csv {
        let f = File::create(path).with_context(|| format!("creating {}", path.display()))?;
        io::write_activation_table(BufWriter::new(f), &activations)?;
    }
    if let Some(path) = &args.summary {
        let summary = serde_json::json!({
            "energy_rate": out.energy_rate,
            "ranks": out.ranks,
            "runs": out.runs,
            "warnings": out.warnings,
        });
        std::fs::write(path, serde_json::to_vec_pretty(&summary)?)
            .with_context(|| format!("writing {}", path.display()))?;
    }
    Ok(())
}
