//! faasim - serverless control-plane simulator.
//!
//! # Usage
//!
//! ```bash
//! # One worker, two functions, a minute of steady load
//! faasim --mode test
//!
//! # Synthetic DAG with duplicated execution
//! faasim --mode benchmark --width 3 --depth 1 --rps 2 --invocations 1000 \
//!        --config.policy.DUP_EXECUTION
//!
//! # Workflow bundle on harvest VMs
//! faasim --mode trace --trace data/trace_dags.json --rps 1 \
//!        --config configs/harvest.toml --config.harvestvm.NUM_HVMS=4
//! ```

use std::error::Error;
use std::sync::Arc;
use std::time::Instant;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use faasim_common::config::{ConfigOverride, SimConfig, extract_overrides};

mod cli;
mod modes;
mod output;

use cli::{Args, Mode};

fn main() {
    let (rest, overrides) = match extract_overrides(std::env::args()) {
        Ok(split) => split,
        Err(err) => {
            eprintln!("faasim: {err}");
            std::process::exit(2);
        }
    };
    let args = Args::parse_from(rest);

    if let Err(err) = setup_tracing(&args) {
        eprintln!("faasim: failed to set up logging: {err}");
        std::process::exit(2);
    }

    let started = Instant::now();
    if let Err(err) = run(&args, &overrides) {
        error!("{err}");
        std::process::exit(2);
    }
    info!(elapsed = ?started.elapsed(), "simulation complete");
}

fn setup_tracing(args: &Args) -> Result<(), Box<dyn Error>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    match &args.logfile {
        Some(path) => {
            let file = std::fs::File::create(path)?;
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(Arc::new(file))
                .with_ansi(false)
                .init();
        }
        None => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
        }
    }
    Ok(())
}

fn run(args: &Args, overrides: &[ConfigOverride]) -> Result<(), Box<dyn Error>> {
    let mut cfg = SimConfig::load(args.config.as_deref())?;
    for ov in overrides {
        cfg.apply_override(ov)?;
    }
    cfg.validate()?;

    if args.width > 1 && args.depth > 1 {
        return Err("hybrid workflows (width and depth both > 1) are not supported".into());
    }
    if args.width >= args.invocations || args.depth >= args.invocations {
        return Err("DAG size exceeds the total number of invocations".into());
    }
    if args.rps <= 0.0 {
        return Err("rps must be positive".into());
    }
    if args.display_dags() {
        info!("task DAG display is not available in this build");
    }

    match args.mode {
        Mode::Test => modes::run_test(cfg, args),
        Mode::Rps => modes::run_rps(cfg, args),
        Mode::Dag => modes::run_dag(cfg, args),
        Mode::Benchmark => modes::run_benchmark(cfg, args),
        Mode::Trace => modes::run_trace(cfg, args),
    }
}
