//! Command-line surface.

use std::path::PathBuf;

use clap::{Parser, ValueEnum};

/// Shared PRNG seed: arrivals, placement tie-breaks, preemption victims,
/// system-tax jitter and survival draws all consume one stream.
pub const SIMULATION_SEED: u64 = 42;

/// Simulation mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Mode {
    /// Two functions, one worker, one minute of steady load.
    Test,
    /// RPS sweep over a single worker.
    Rps,
    /// Workflow definitions driven by an invocation trace.
    Dag,
    /// Synthetic balanced-tree DAG at a fixed arrival rate.
    Benchmark,
    /// Serialized DAG bundle sampled into Poisson arrivals.
    Trace,
}

/// faasim - serverless control-plane simulator
#[derive(Parser, Debug)]
#[command(name = "faasim")]
#[command(version)]
#[command(about = "Discrete-event simulator of a Knative-style serverless control plane")]
#[command(long_about = None)]
pub struct Args {
    /// Simulation mode
    #[arg(long, value_enum)]
    pub mode: Mode,

    /// Path to the DAG bundle to simulate (trace mode)
    #[arg(long, default_value = "data/trace_dags.json")]
    pub trace: PathBuf,

    /// Simulate a fixed Harvest VM hash from the trace
    #[arg(long)]
    pub hvm: Option<String>,

    /// Log file path (stderr when unset)
    #[arg(long)]
    pub logfile: Option<PathBuf>,

    /// Display the task DAGs before simulating
    #[arg(long)]
    pub display: bool,

    /// Opposite of --display
    #[arg(long)]
    pub nodisplay: bool,

    /// Number of normal VMs
    #[arg(long, default_value_t = 2)]
    pub vm: u32,

    /// Number of cores per VM
    #[arg(long, default_value_t = 40)]
    pub cores: u32,

    /// Number of stages in the task DAG (dag mode)
    #[arg(long, default_value_t = 8)]
    pub stages: usize,

    /// Total number of invocations in the task DAG
    #[arg(long, default_value_t = 4096)]
    pub invocations: usize,

    /// Width of the task DAG (benchmark mode)
    #[arg(long, default_value_t = 1)]
    pub width: usize,

    /// Depth of the task DAG (benchmark mode)
    #[arg(long, default_value_t = 1)]
    pub depth: usize,

    /// Requests per second arrival rate
    #[arg(long, default_value_t = 1.0)]
    pub rps: f64,

    /// Configuration file (TOML); defaults apply when unset
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Root directory of dag-mode workload inputs
    #[arg(long, default_value = "workloads")]
    pub workloads: PathBuf,

    /// Output directory for the result traces
    #[arg(long, default_value = "data/results")]
    pub outdir: PathBuf,
}

impl Args {
    pub fn display_dags(&self) -> bool {
        self.display && !self.nodisplay
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_invocation_parses() {
        let args = Args::parse_from(["faasim", "--mode", "test"]);
        assert_eq!(args.mode, Mode::Test);
        assert_eq!(args.vm, 2);
        assert_eq!(args.cores, 40);
        assert!(!args.display_dags());
    }

    #[test]
    fn unknown_mode_is_rejected() {
        assert!(Args::try_parse_from(["faasim", "--mode", "bogus"]).is_err());
        assert!(Args::try_parse_from(["faasim"]).is_err());
    }

    #[test]
    fn benchmark_dimensions_parse() {
        let args = Args::parse_from([
            "faasim",
            "--mode",
            "benchmark",
            "--width",
            "3",
            "--depth",
            "3",
            "--rps",
            "2",
            "--invocations",
            "1000",
        ]);
        assert_eq!(args.mode, Mode::Benchmark);
        assert_eq!((args.width, args.depth), (3, 3));
        assert_eq!(args.rps, 2.0);
    }
}
