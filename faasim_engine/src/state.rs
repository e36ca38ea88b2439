//! Global simulation state and the DAG flow engine.
//!
//! [`SimState`] is the single shared record every component reads: the
//! registered DAGs, the live flows with their dependency counters, the
//! released-request queue, and the per-request completion bookkeeping
//! needed by duplicated execution. It is owned by the cluster and threaded
//! through the tick pipeline as part of [`TickCtx`].

use std::collections::{BTreeMap, HashMap};

use rand::rngs::StdRng;
use tracing::debug;

use faasim_common::config::SimConfig;
use faasim_common::harvestvm::SurvivalModel;
use faasim_common::workload::Dag;

use crate::breaker::Breaker;
use crate::function::{Function, Request};
use crate::instance::InstanceIdGen;
use crate::records::RequestRecord;

/// Capacity of the released-request queue.
const RELEASED_QUEUE_CAPACITY: usize = 1_000_000;

// ─── Flow ───────────────────────────────────────────────────────────

/// One invocation of a DAG, tracked by per-function predecessor counters.
///
/// A function is eligible to fire exactly when its counter reaches zero.
#[derive(Debug, Clone)]
pub struct Flow {
    pub dag_name: String,
    /// function -> number of unfinished predecessors.
    pub counters: BTreeMap<String, usize>,
    pub leaves: Vec<String>,
    pub num_dependencies: usize,
}

impl Flow {
    pub fn new(dag: &Dag) -> Self {
        let counters = dag
            .node_names()
            .iter()
            .map(|f| (f.clone(), dag.predecessors(f).len()))
            .collect();
        Self {
            dag_name: dag.name().to_string(),
            counters,
            leaves: dag.leaves().iter().map(|s| s.to_string()).collect(),
            num_dependencies: dag.num_edges(),
        }
    }

    /// Share of dependency edges already discharged.
    pub fn completion_rate(&self) -> f64 {
        if self.num_dependencies == 0 {
            return 0.0;
        }
        let unfinished: usize = self.counters.values().copied().sum();
        (self.num_dependencies - unfinished) as f64 / self.num_dependencies as f64
    }
}

// ─── Global State ───────────────────────────────────────────────────

/// Process-wide simulation state.
#[derive(Debug)]
pub struct SimState {
    pub dags: BTreeMap<String, Dag>,
    pub flows: HashMap<u64, Flow>,
    /// DAG successors waiting for ingress.
    pub released: Breaker<Request>,
    /// Successful completions per `req_id` (replicas share the id).
    pub finished: HashMap<String, u32>,
    /// Failed completions per `req_id`.
    pub failed: HashMap<String, u32>,
    /// Current offered load, carried into result records.
    pub rps: f64,
}

impl SimState {
    pub fn new(dags: BTreeMap<String, Dag>) -> Self {
        Self {
            dags,
            flows: HashMap::new(),
            released: Breaker::new("State", RELEASED_QUEUE_CAPACITY),
            finished: HashMap::new(),
            failed: HashMap::new(),
            rps: 0.0,
        }
    }

    /// Register a new flow for one invocation of `dag_name`.
    pub fn add_flow(&mut self, flow_id: u64, dag_name: &str) {
        let dag = self.dags.get(dag_name).expect("flow over unregistered DAG");
        self.flows.insert(flow_id, Flow::new(dag));
    }

    /// Discharge the dependency edges of a completed request.
    ///
    /// Invoked when an instance stops a request. Successors whose counter
    /// reaches zero are constructed and pushed onto the released queue; the
    /// driver ingresses them on the network-delay cadence. Only the first
    /// successful completion of a `req_id` releases successors — replica
    /// completions are bookkeeping only. A failed completion settles the
    /// flow (deletes it) once every replica has reported.
    pub fn dereference(&mut self, request: &Request, now: u64, cfg: &SimConfig) {
        debug!(clock = now, req_id = %request.req_id, "dereferenced");
        if self.dags.is_empty() {
            // Flow tracking is only active in DAG-driven modes.
            return;
        }
        if !self.flows.contains_key(&request.flow_id) {
            // The flow settled while this request was in flight (a replica
            // or a failure got there first).
            return;
        }

        if request.failed {
            debug!(req_id = %request.req_id, "request failed");
            *self.failed.entry(request.req_id.clone()).or_default() += 1;
            let reported = self.failed.get(&request.req_id).copied().unwrap_or(0)
                + self.finished.get(&request.req_id).copied().unwrap_or(0);
            if reported >= request.num_replicas {
                // Last chance of execution gone: the whole flow is dead.
                self.flows.remove(&request.flow_id);
            }
            return;
        }

        let completions = {
            let entry = self.finished.entry(request.req_id.clone()).or_default();
            *entry += 1;
            *entry
        };

        let flow = self.flows.get_mut(&request.flow_id).expect("flow vanished");
        if flow.counters.values().copied().sum::<usize>() == 0 {
            // Every function of the flow has been released; the finishing
            // request is a leaf. Drop the flow for cheap completion checks.
            self.flows.remove(&request.flow_id);
            return;
        }
        if completions > 1 {
            return;
        }

        let dag = self.dags.get(&request.dag_name).expect("unregistered DAG");
        for successor in dag.successors(&request.dest) {
            let counter = flow
                .counters
                .get_mut(successor)
                .expect("successor missing from flow counters");
            *counter -= 1;
            if *counter == 0 {
                let spec = dag.spec(successor).expect("successor without spec");
                self.released.enqueue(Request::new(
                    request.flow_id,
                    &request.dag_name,
                    successor,
                    spec.duration_milli,
                    spec.memory_mib,
                    now,
                    self.rps,
                    cfg.request.max_duration_sec * 1_000,
                ));
            }
        }
    }
}

// ─── Tick Context ───────────────────────────────────────────────────

/// Mutable slices of the cluster threaded through one tick.
///
/// Components must not assume another has run this tick unless it is
/// earlier in the documented pipeline.
pub struct TickCtx<'a> {
    pub now: u64,
    pub cfg: &'a SimConfig,
    pub rng: &'a mut StdRng,
    pub state: &'a mut SimState,
    pub sink: &'a mut Vec<RequestRecord>,
    pub survival: Option<&'a SurvivalModel>,
    pub functions: &'a BTreeMap<String, Function>,
    pub ids: &'a mut InstanceIdGen,
}

// ─── Tests ──────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use faasim_common::workload::generate_balanced_dag;

    fn diamond_state() -> SimState {
        // F0 -> {F1, F2} -> F3
        let dag = generate_balanced_dag("d", 2, 1, 100, 170).unwrap();
        let mut dags = BTreeMap::new();
        dags.insert("d".to_string(), dag);
        SimState::new(dags)
    }

    fn finished_request(flow_id: u64, dest: &str) -> Request {
        let mut req = Request::new(flow_id, "d", dest, 100, 170, 0, 1.0, 900_000);
        req.start(0);
        req.advance(100);
        req.finish(100, 5);
        req
    }

    #[test]
    fn flow_counters_follow_predecessors() {
        let state = {
            let mut s = diamond_state();
            s.add_flow(0, "d");
            s
        };
        let flow = &state.flows[&0];
        assert_eq!(flow.counters["F0"], 0);
        assert_eq!(flow.counters["F1"], 1);
        assert_eq!(flow.counters["F2"], 1);
        assert_eq!(flow.counters["F3"], 2);
        assert_eq!(flow.num_dependencies, 4);
        assert_eq!(flow.completion_rate(), 0.0);
    }

    #[test]
    fn dereference_releases_ready_successors() {
        let cfg = SimConfig::default();
        let mut state = diamond_state();
        state.add_flow(0, "d");

        let root = finished_request(0, "F0");
        state.dereference(&root, 100, &cfg);

        // Both fan-out functions became ready.
        assert_eq!(state.released.len(), 2);
        assert_eq!(state.flows[&0].counters["F1"], 0);
        assert_eq!(state.flows[&0].counters["F3"], 2);

        // One branch done: the join stays blocked.
        let left = finished_request(0, "F1");
        state.dereference(&left, 200, &cfg);
        assert_eq!(state.released.len(), 2);
        assert_eq!(state.flows[&0].counters["F3"], 1);

        // Second branch releases the join.
        let right = finished_request(0, "F2");
        state.dereference(&right, 300, &cfg);
        assert_eq!(state.released.len(), 3);
        let join = state.released.iter().last().unwrap();
        assert_eq!(join.dest, "F3");
        assert_eq!(join.arrival_time, 300);

        // The join finishing settles the flow.
        let join = finished_request(0, "F3");
        state.dereference(&join, 400, &cfg);
        assert!(state.flows.is_empty());
    }

    #[test]
    fn failed_request_kills_the_flow() {
        let cfg = SimConfig::default();
        let mut state = diamond_state();
        state.add_flow(0, "d");

        let mut root = finished_request(0, "F0");
        root.failed = true;
        state.dereference(&root, 100, &cfg);

        assert!(state.flows.is_empty());
        assert!(state.released.is_empty());
        assert_eq!(state.failed["0-F0"], 1);
    }

    #[test]
    fn replica_completion_does_not_release_twice() {
        let cfg = SimConfig::default();
        let mut state = diamond_state();
        state.add_flow(0, "d");

        let mut root = finished_request(0, "F0");
        root.num_replicas = 2;
        state.dereference(&root, 100, &cfg);
        assert_eq!(state.released.len(), 2);

        // The twin replica finishes later: bookkeeping only.
        state.dereference(&root.clone(), 150, &cfg);
        assert_eq!(state.released.len(), 2);
        assert_eq!(state.finished["0-F0"], 2);
        assert_eq!(state.flows[&0].counters["F1"], 0);
    }

    #[test]
    fn dup_flow_settles_after_both_replicas_report() {
        let cfg = SimConfig::default();
        let mut state = diamond_state();
        state.add_flow(0, "d");

        let mut ok = finished_request(0, "F0");
        ok.num_replicas = 2;
        state.dereference(&ok, 100, &cfg);
        assert!(state.flows.contains_key(&0));

        let mut bad = ok.clone();
        bad.failed = true;
        state.dereference(&bad, 150, &cfg);
        // finished + failed == num_replicas -> settled.
        assert!(state.flows.is_empty());
    }

    #[test]
    fn late_completion_after_settlement_is_ignored() {
        let cfg = SimConfig::default();
        let mut state = diamond_state();
        // No flow registered at all.
        let req = finished_request(9, "F0");
        state.dereference(&req, 100, &cfg);
        assert!(state.finished.is_empty());
        assert!(state.released.is_empty());
    }
}
