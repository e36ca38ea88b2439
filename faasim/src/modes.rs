//! Mode drivers: build a cluster, generate load, drain, dump.

use std::collections::BTreeMap;
use std::error::Error;
use std::path::Path;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{info, warn};

use faasim_common::config::SimConfig;
use faasim_common::harvestvm::{CoresTable, SurvivalModel};
use faasim_common::workload::{
    Dag, DagBundle, generate_balanced_dag, generate_exp_arrival_times_milli,
    load_invocation_trace, load_workflows, sample_with_replacement,
};
use faasim_engine::cluster::{Cluster, HvmModels};
use faasim_engine::function::{Function, Request};
use faasim_engine::loadgen::{drain, drive_arrivals, functions_from_dags, root_requests};

use crate::cli::{Args, SIMULATION_SEED};
use crate::output;

type AnyError = Box<dyn Error>;

/// Virtual-time budget for the post-generation drain [ticks].
const DRAIN_BUDGET_TICKS: u64 = 7_200_000;

/// Load the Harvest-VM artifacts and attach the fleet, when configured.
fn setup_harvest(cluster: &mut Cluster, args: &Args) -> Result<(), AnyError> {
    if !cluster.cfg.harvestvm.use_harvestvm {
        return Ok(());
    }
    let cores = CoresTable::load(Path::new(&cluster.cfg.harvestvm.cores_table_path))?;
    let survival = match SurvivalModel::load(Path::new(&cluster.cfg.harvestvm.survival_model_path))
    {
        Ok(model) => Some(model),
        Err(err) => {
            warn!(%err, "survival model unavailable; using the hazard estimate");
            None
        }
    };
    cluster.enable_harvest_fleet(HvmModels { survival, cores }, args.hvm.as_deref());
    Ok(())
}

fn finish(cluster: &mut Cluster, args: &Args) -> Result<(), AnyError> {
    if !drain(cluster, DRAIN_BUDGET_TICKS) {
        warn!("simulation did not quiesce; dumping partial results");
    }
    let key = output::result_key(
        args.width,
        args.depth,
        args.invocations,
        &cluster.cfg.policy,
    );
    output::dump(cluster, &args.outdir, &key)?;
    Ok(())
}

// ─── test ───────────────────────────────────────────────────────────

/// Two functions round-robin on one 16-core worker, 1 rps for a minute.
pub fn run_test(cfg: SimConfig, args: &Args) -> Result<(), AnyError> {
    const RUNTIME_MILLI: u64 = 1_000;
    const MEMORY_MIB: u64 = 170;
    const NUM_FUNCTIONS: usize = 2;
    let iat_milli = 1_000u64;
    let num_invocations = 60usize;

    let functions: Vec<Function> = (0..NUM_FUNCTIONS)
        .map(|i| Function::new(format!("func-{i}"), 1))
        .collect();
    let rng = StdRng::seed_from_u64(SIMULATION_SEED);
    let mut cluster = Cluster::new(cfg, functions, BTreeMap::new(), rng);
    cluster.add_node("worker-0", 16, 64 * 1024);
    setup_harvest(&mut cluster, args)?;
    cluster.set_rps(1.0);
    let max_duration = cluster.cfg.request.max_duration_sec * 1_000;

    let arrivals: Vec<u64> = (0..num_invocations as u64).map(|i| i * iat_milli).collect();
    drive_arrivals(&mut cluster, &arrivals, |cluster, idx| {
        let dest = format!("func-{}", idx % NUM_FUNCTIONS);
        let now = cluster.now();
        cluster.ingress_accept(Request::new(
            idx as u64,
            "",
            &dest,
            RUNTIME_MILLI,
            MEMORY_MIB,
            now,
            1.0,
            max_duration,
        ));
    });

    finish(&mut cluster, args)
}

// ─── rps ────────────────────────────────────────────────────────────

/// Sweep the offered load over a single worker, 60 s per step.
pub fn run_rps(cfg: SimConfig, args: &Args) -> Result<(), AnyError> {
    const RUNTIME_MILLI: u64 = 1_000;
    const MEMORY_MIB: u64 = 170;
    const NUM_FUNCTIONS: u64 = 10;
    const NUM_CORES: u32 = 16;
    const RPS_START: u64 = 1;
    const RPS_END: u64 = 18;
    const SLOT_MILLI: u64 = 60_000;

    let functions: Vec<Function> = (0..NUM_FUNCTIONS)
        .map(|i| Function::new(format!("func-{i}"), 1))
        .collect();
    let rng = StdRng::seed_from_u64(SIMULATION_SEED);
    let mut cluster = Cluster::new(cfg, functions, BTreeMap::new(), rng);
    cluster.add_node("worker-0", NUM_CORES, 64 * 1024);
    setup_harvest(&mut cluster, args)?;
    let max_duration = cluster.cfg.request.max_duration_sec * 1_000;

    let mut inv_index = 0u64;
    for rps in RPS_START..=RPS_END {
        info!(rps, "rps sweep step");
        cluster.set_rps(rps as f64);
        let iat_milli = 1_000 / rps;
        let base = cluster.now();

        let arrivals: Vec<u64> = (0..)
            .map(|k| base + k * iat_milli)
            .take_while(|t| *t < base + SLOT_MILLI)
            .collect();
        drive_arrivals(&mut cluster, &arrivals, |cluster, _| {
            let dest = format!("func-{}", inv_index % NUM_FUNCTIONS);
            let now = cluster.now();
            // Execution time is only fully used once the worker saturates.
            let duration = if rps > NUM_CORES as u64 {
                RUNTIME_MILLI
            } else {
                cluster.rng.gen_range(RUNTIME_MILLI - 100..=RUNTIME_MILLI)
            };
            cluster.ingress_accept(Request::new(
                inv_index,
                "",
                &dest,
                duration,
                MEMORY_MIB,
                now,
                rps as f64,
                max_duration,
            ));
            inv_index += 1;
        });

        // Idle out the remainder of the slot.
        while cluster.now() < base + SLOT_MILLI {
            cluster.tick();
            cluster.advance(1);
        }
    }

    finish(&mut cluster, args)
}

// ─── benchmark ──────────────────────────────────────────────────────

/// Synthetic balanced-tree DAG at a Poisson arrival rate.
pub fn run_benchmark(cfg: SimConfig, args: &Args) -> Result<(), AnyError> {
    let dag = generate_balanced_dag("gen_dag", args.width, args.depth, 1_000, 170)?;
    let total_flows = if args.width == 1 {
        args.invocations / args.depth
    } else {
        args.invocations / args.width
    };
    info!(
        total_flows,
        invocations = total_flows * dag.num_nodes(),
        "benchmark workload"
    );

    let mut rng = StdRng::seed_from_u64(SIMULATION_SEED);
    let arrivals = generate_exp_arrival_times_milli(&mut rng, args.rps, total_flows);

    let functions = functions_from_dags([&dag]);
    let mut dags = BTreeMap::new();
    dags.insert(dag.name().to_string(), dag);
    let mut cluster = Cluster::new(cfg, functions, dags, rng);
    // No normal workers: the harvest fleet carries the load when enabled.
    setup_harvest(&mut cluster, args)?;
    cluster.set_rps(args.rps);
    let rps = args.rps;

    drive_arrivals(&mut cluster, &arrivals, |cluster, idx| {
        cluster.add_flow(idx as u64, "gen_dag");
        let now = cluster.now();
        let requests = root_requests(
            idx as u64,
            &cluster.state.dags["gen_dag"],
            rps,
            now,
            &cluster.cfg,
        );
        for request in requests {
            cluster.ingress_accept(request);
        }
    });

    finish(&mut cluster, args)
}

// ─── trace ──────────────────────────────────────────────────────────

/// Sample workflows from a serialized DAG bundle into Poisson arrivals.
pub fn run_trace(cfg: SimConfig, args: &Args) -> Result<(), AnyError> {
    const SAMPLED_FLOWS: usize = 1_000;

    info!(trace = %args.trace.display(), "loading workflows");
    let dag_pool = DagBundle::load(&args.trace)?;
    if dag_pool.is_empty() {
        return Err("DAG bundle is empty".into());
    }
    for dag in &dag_pool {
        dag.single_root()?;
        for name in dag.node_names() {
            let spec = dag.spec(name).expect("node without spec");
            if spec.vcpu > args.cores {
                return Err(format!("function {name} exceeds the worker core count").into());
            }
        }
    }

    let mut rng = StdRng::seed_from_u64(SIMULATION_SEED);
    let samples = sample_with_replacement(&mut rng, dag_pool.len(), SAMPLED_FLOWS);
    info!(flows = samples.len(), dags = dag_pool.len(), "sampled workflows");
    let arrivals = generate_exp_arrival_times_milli(&mut rng, args.rps, samples.len());

    let sampled: Vec<&Dag> = samples.iter().map(|i| &dag_pool[*i]).collect();
    let functions = functions_from_dags(sampled.iter().copied());
    let mut dags: BTreeMap<String, Dag> = BTreeMap::new();
    for dag in &sampled {
        dags.entry(dag.name().to_string()).or_insert_with(|| (*dag).clone());
    }
    let flow_dags: Vec<String> = sampled.iter().map(|d| d.name().to_string()).collect();

    let mut cluster = Cluster::new(cfg, functions, dags, rng);
    for i in 0..args.vm {
        cluster.add_node(&format!("node-{i}"), args.cores, 192 * 1024);
    }
    setup_harvest(&mut cluster, args)?;
    cluster.set_rps(args.rps);
    let rps = args.rps;

    drive_arrivals(&mut cluster, &arrivals, |cluster, idx| {
        let dag_name = &flow_dags[idx];
        cluster.add_flow(idx as u64, dag_name);
        let now = cluster.now();
        let requests = root_requests(
            idx as u64,
            &cluster.state.dags[dag_name],
            rps,
            now,
            &cluster.cfg,
        );
        for request in requests {
            cluster.ingress_accept(request);
        }
    });

    finish(&mut cluster, args)
}

// ─── dag ────────────────────────────────────────────────────────────

/// Workflow definitions driven by an invocation trace.
pub fn run_dag(cfg: SimConfig, args: &Args) -> Result<(), AnyError> {
    const NUM_WORKERS: u32 = 32;
    const NUM_CORES: u32 = 32;

    let dag_stem = format!("test_parallel_s{}_m170_t1000", args.stages);
    let dag_path = args.workloads.join("dags").join(format!("{dag_stem}.json"));
    let inv_path = args.workloads.join("invocation").join(format!(
        "test_harvest_json{dag_stem}_invoke{}_poisson1000.csv",
        args.invocations
    ));

    let dags = load_workflows(&dag_path)?;
    let records = load_invocation_trace(&inv_path)?;
    if records.is_empty() {
        return Err("invocation trace is empty".into());
    }

    let functions = functions_from_dags(dags.values());
    let rng = StdRng::seed_from_u64(SIMULATION_SEED);
    let mut cluster = Cluster::new(cfg, functions, dags, rng);
    for i in 0..NUM_WORKERS {
        cluster.add_node(&format!("node-{i}"), NUM_CORES, 64 * 1024);
    }
    setup_harvest(&mut cluster, args)?;

    // Skip ahead to just before the first invocation.
    cluster.advance(records[0].timestamp.saturating_sub(1));

    let times: Vec<u64> = records.iter().map(|r| r.timestamp).collect();
    let mut flow_id = 0u64;
    let mut inv_count = 0u64;
    let mut prev_ts = 0u64;

    drive_arrivals(&mut cluster, &times, |cluster, idx| {
        let record = &records[idx];
        let now = cluster.now();
        inv_count += record.num_invocations as u64;
        let rps = (inv_count as f64 / (now - prev_ts + 1) as f64 * 1_000.0).round() / 1_000.0;
        prev_ts = now;
        cluster.set_rps(rps);

        for _ in 0..record.num_invocations {
            cluster.add_flow(flow_id, &record.dag_name);
            let requests = root_requests(
                flow_id,
                &cluster.state.dags[&record.dag_name],
                rps,
                now,
                &cluster.cfg,
            );
            for request in requests {
                cluster.ingress_accept(request);
            }
            flow_id += 1;
        }
    });

    finish(&mut cluster, args)
}
