//! Load generation: arrival-schedule driving and drain loops.
//!
//! All drivers share the same shape: advance 1 ms per iteration, inject
//! every root request whose arrival time equals the current tick (the
//! clock does not advance across same-millisecond arrivals), then keep
//! ticking until the cluster quiesces.

use tracing::warn;

use faasim_common::config::SimConfig;
use faasim_common::workload::Dag;

use crate::cluster::Cluster;
use crate::function::{Function, Request};

/// Register one function per DAG node across all DAGs.
///
/// DAG node names are pre-qualified by the loaders, so colliding names
/// across repeated samples of the same DAG simply merge.
pub fn functions_from_dags<'a>(dags: impl IntoIterator<Item = &'a Dag>) -> Vec<Function> {
    let mut functions = Vec::new();
    let mut seen = std::collections::BTreeSet::new();
    for dag in dags {
        for name in dag.node_names() {
            if seen.insert(name.clone()) {
                let spec = dag.spec(name).expect("node without spec");
                functions.push(Function::new(name, spec.vcpu));
            }
        }
    }
    functions
}

/// Root requests of one flow over `dag`, at the current virtual time.
pub fn root_requests(
    flow_id: u64,
    dag: &Dag,
    rps: f64,
    now: u64,
    cfg: &SimConfig,
) -> Vec<Request> {
    dag.roots()
        .into_iter()
        .map(|root| {
            let spec = dag.spec(root).expect("root without spec");
            Request::new(
                flow_id,
                dag.name(),
                root,
                spec.duration_milli,
                spec.memory_mib,
                now,
                rps,
                cfg.request.max_duration_sec * 1_000,
            )
        })
        .collect()
}

/// Drive the cluster through an ascending arrival schedule.
///
/// `on_arrival` fires once per schedule entry, at a tick whose virtual
/// time equals that entry.
pub fn drive_arrivals<F>(cluster: &mut Cluster, arrival_times: &[u64], mut on_arrival: F)
where
    F: FnMut(&mut Cluster, usize),
{
    let mut idx = 0;
    while idx < arrival_times.len() {
        let now = cluster.now();
        while idx < arrival_times.len() && arrival_times[idx] == now {
            on_arrival(cluster, idx);
            idx += 1;
        }
        cluster.tick();
        cluster.advance(1);
    }
}

/// Tick until the cluster quiesces; `max_ticks` bounds runaway runs.
/// Returns whether the cluster actually finished.
pub fn drain(cluster: &mut Cluster, max_ticks: u64) -> bool {
    let mut ticks = 0;
    while !cluster.is_finished() {
        if ticks >= max_ticks {
            warn!(
                clock = cluster.now(),
                live_flows = cluster.state.flows.len(),
                "drain budget exhausted before quiescence"
            );
            return false;
        }
        cluster.tick();
        cluster.advance(1);
        ticks += 1;
    }
    true
}

// ─── Tests ──────────────────────────────────────────────────────────
