//! Cluster orchestration: the tick loop tying every component together.
//!
//! One tick runs a fixed pipeline at the current virtual time: maintain
//! the Harvest-VM fleet, run all instances (which may finish requests and
//! release DAG successors), then on their respective cadences drain the
//! throttler queues, ingress one released request, evaluate the
//! autoscaler, place instances, reconcile the node controllers, snapshot
//! concurrency, and append a metrics record.

use std::collections::{BTreeMap, BTreeSet};

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use tracing::{debug, error, info};

use faasim_common::config::SimConfig;
use faasim_common::harvestvm::{CoresTable, SurvivalModel};
use faasim_common::workload::Dag;

use crate::autoscaler::Autoscaler;
use crate::clock::Clock;
use crate::function::{Function, Request};
use crate::harvest::HvmRuntime;
use crate::instance::{InstanceId, InstanceIdGen, InstanceStatus};
use crate::node::{Node, NodeId};
use crate::records::{ClusterRecord, RequestRecord};
use crate::scheduler;
use crate::state::{SimState, TickCtx};
use crate::throttler::Throttler;

/// Fixed memory size of spawned Harvest VMs [MiB].
const HARVESTVM_MEMORY_MIB: u64 = 130 * 1024;

/// Opaque model artifacts backing the Harvest-VM fleet.
#[derive(Debug)]
pub struct HvmModels {
    /// Trace-fitted survival curve; without it the cumulative-hazard
    /// estimate takes over.
    pub survival: Option<SurvivalModel>,
    pub cores: CoresTable,
}

/// The simulated cluster.
pub struct Cluster {
    pub cfg: SimConfig,
    pub clock: Clock,
    pub rng: StdRng,
    pub functions: BTreeMap<String, Function>,
    pub state: SimState,
    pub nodes: Vec<Node>,
    pub throttler: Throttler,
    pub autoscaler: Autoscaler,
    /// Drained request records.
    pub sink: Vec<RequestRecord>,
    /// Periodic cluster metrics.
    pub trace: Vec<ClusterRecord>,

    models: Option<HvmModels>,
    /// Hashes the cluster keeps alive.
    hvm_fleet: Vec<String>,
    /// Respawn checkpoints; `None` while the VM is alive.
    hvm_ckps: BTreeMap<String, Option<i64>>,
    /// Upper bound on the node count (normal + harvest).
    num_workers: usize,

    instance_ids: InstanceIdGen,
    next_node_id: u32,
}

impl Cluster {
    /// Build a cluster around an externally seeded PRNG, so arrival
    /// generation and the control plane share one random stream.
    pub fn new(
        cfg: SimConfig,
        functions: Vec<Function>,
        dags: BTreeMap<String, Dag>,
        rng: StdRng,
    ) -> Self {
        let throttler = Throttler::new(&functions);
        let autoscaler = Autoscaler::new(&functions);
        let functions = functions
            .into_iter()
            .map(|f| (f.name.clone(), f))
            .collect();
        Self {
            cfg,
            clock: Clock::new(),
            rng,
            functions,
            state: SimState::new(dags),
            nodes: Vec::new(),
            throttler,
            autoscaler,
            sink: Vec::new(),
            trace: Vec::new(),
            models: None,
            hvm_fleet: Vec::new(),
            hvm_ckps: BTreeMap::new(),
            num_workers: 0,
            instance_ids: InstanceIdGen::new(),
            next_node_id: 0,
        }
    }

    pub fn with_seed(
        cfg: SimConfig,
        functions: Vec<Function>,
        dags: BTreeMap<String, Dag>,
        seed: u64,
    ) -> Self {
        Self::new(cfg, functions, dags, StdRng::seed_from_u64(seed))
    }

    #[inline]
    pub fn now(&self) -> u64 {
        self.clock.now()
    }

    pub fn advance(&mut self, duration_milli: u64) {
        self.clock.advance(duration_milli);
    }

    pub fn set_rps(&mut self, rps: f64) {
        self.state.rps = rps;
    }

    fn next_node_id(&mut self) -> NodeId {
        let id = NodeId(self.next_node_id);
        self.next_node_id += 1;
        id
    }

    /// Add a normal worker node.
    pub fn add_node(&mut self, name: &str, raw_cores: u32, memory_mib: u64) -> NodeId {
        let id = self.next_node_id();
        let node = Node::new(id, name, raw_cores, memory_mib, self.clock.now(), &self.cfg.node);
        self.nodes.push(node);
        self.num_workers += 1;
        id
    }

    /// Configure the Harvest-VM fleet from the model artifacts.
    ///
    /// With `pinned` set (and present in the table) that hash leads the
    /// fleet; a missing pinned hash is logged and substituted by a random
    /// table entry. Remaining slots take table hashes in sorted order.
    /// Checkpoints start expired so the fleet spawns on the first tick.
    pub fn enable_harvest_fleet(&mut self, models: HvmModels, pinned: Option<&str>) {
        let num_hvms = self.cfg.harvestvm.num_hvms;
        let mut fleet: Vec<String> = Vec::new();

        if let Some(hash) = pinned {
            if models.cores.contains(hash) {
                info!(hvm = %hash, "simulating pinned harvest VM from the trace");
                fleet.push(hash.to_string());
            } else {
                error!(hvm = %hash, "harvest VM not found in the cores table");
                let all: Vec<&str> = models.cores.hashes().collect();
                let substitute = all[self.rng.gen_range(0..all.len())];
                fleet.push(substitute.to_string());
            }
        }
        for hash in models.cores.hashes() {
            if fleet.len() >= num_hvms {
                break;
            }
            if !fleet.iter().any(|h| h == hash) {
                fleet.push(hash.to_string());
            }
        }

        let spawn_latency = self.cfg.harvestvm.harvestvm_spawn_latency_milli as i64;
        self.hvm_ckps = fleet
            .iter()
            .map(|h| (h.clone(), Some(self.clock.now() as i64 - spawn_latency)))
            .collect();
        self.num_workers = self.nodes.len() + fleet.len();
        self.hvm_fleet = fleet;
        self.models = Some(models);
    }

    // ─── Tick Pipeline ──────────────────────────────────────────────

    /// One simulation tick at the current virtual time.
    pub fn tick(&mut self) {
        let now = self.clock.now();
        let cadence = self.cfg.cluster.clone();

        self.maintain_hvms(now);
        self.run_instances(now);

        if now % cadence.dispatch_period_milli == 0 {
            self.throttler.dispatch(&mut self.nodes, &self.cfg, now);
        }
        if now % cadence.network_delay_milli == 0 {
            if let Some(request) = self.state.released.pop() {
                self.ingress_accept(request);
            }
        }
        if now % cadence.autoscaling_period_milli == 0 {
            self.autoscaler.evaluate(
                None,
                &self.throttler.trackers,
                &self.nodes,
                &self.cfg.autoscaler,
                now,
            );
        }
        if now % cadence.scheduling_period_milli == 0 {
            self.place_instances(now);
        }
        if now % cadence.cri_engine_pulling_period_milli == 0 {
            self.reconcile(now);
        }
        if now % cadence.update_concurrency_period_milli == 0 {
            self.throttler.record_concurrencies();
        }
        if now % cadence.monitoring_period_milli == 0 {
            self.monitor(now);
        }
    }

    /// Register a flow and ingress its root request(s).
    pub fn add_flow(&mut self, flow_id: u64, dag_name: &str) {
        self.state.add_flow(flow_id, dag_name);
    }

    pub fn ingress_accept(&mut self, request: Request) {
        let now = self.clock.now();
        debug!(clock = now, req_id = %request.req_id, "arrival");
        self.throttler.hit(
            request,
            &mut self.nodes,
            &mut self.autoscaler,
            &self.state,
            &self.cfg,
            now,
        );
    }

    /// True iff no instance is running and no flow is live.
    pub fn is_finished(&self) -> bool {
        let any_running = self
            .nodes
            .iter()
            .flat_map(|n| n.instances.iter())
            .any(|i| i.status == InstanceStatus::Running);
        !any_running && self.state.flows.is_empty()
    }

    // ─── Sub-Steps ──────────────────────────────────────────────────

    /// Respawn missing Harvest VMs once their spawn latency elapses.
    fn maintain_hvms(&mut self, now: u64) {
        if !self.cfg.harvestvm.use_harvestvm || self.models.is_none() {
            return;
        }

        let mut existing: BTreeSet<String> = BTreeSet::new();
        for node in &self.nodes {
            if let Some(hvm) = &node.hvm {
                assert!(
                    existing.insert(hvm.hvm_hash.clone()),
                    "duplicated harvest VM {}",
                    hvm.hvm_hash
                );
            }
        }

        let missing: Vec<String> = self
            .hvm_fleet
            .iter()
            .filter(|h| !existing.contains(*h))
            .cloned()
            .collect();

        let spawn_latency = self.cfg.harvestvm.harvestvm_spawn_latency_milli as i64;
        let mut spawned = false;
        for hash in missing {
            let ckp = self.hvm_ckps.get_mut(&hash).expect("untracked harvest VM");
            // Record when this VM was first found missing.
            if ckp.is_none() {
                *ckp = Some(now as i64);
            }
            if (now as i64) < ckp.expect("checkpoint vanished") + spawn_latency {
                continue;
            }

            let schedule = self
                .models
                .as_ref()
                .expect("harvest fleet without models")
                .cores
                .get(&hash)
                .expect("fleet hash missing from cores table")
                .to_vec();
            let hvm = HvmRuntime::new(
                hash.clone(),
                schedule,
                self.cfg.harvestvm.base_hazard,
                now,
            );
            let id = self.next_node_id();
            let node = Node::new_harvest(
                id,
                format!("hvm-{hash}"),
                HARVESTVM_MEMORY_MIB,
                now,
                hvm,
                &self.cfg.node,
            );
            info!(clock = now, node = %node.name, cores = node.num_cores, "created harvest VM");
            self.nodes.push(node);
            self.hvm_ckps.insert(hash, None);
            spawned = true;
        }

        debug_assert!(self.nodes.len() <= self.num_workers, "node count exceeded");
        if spawned {
            // Keep placement unbiased with the newcomers appended.
            self.nodes.shuffle(&mut self.rng);
        }
    }

    /// Run every node for this tick; Harvest VMs first face their
    /// survival draw and afterwards their harvest adjustment.
    fn run_instances(&mut self, now: u64) {
        let ids: Vec<NodeId> = self.nodes.iter().map(|n| n.id).collect();
        for id in ids {
            let Some(idx) = self.nodes.iter().position(|n| n.id == id) else {
                continue;
            };

            if self.nodes[idx].survival_check_due(now, &self.cfg.harvestvm) {
                let survival = self.models.as_ref().and_then(|m| m.survival.as_ref());
                let dead = self.nodes[idx].survival_draw(now, &mut self.rng, survival);
                if dead {
                    self.kill_node(idx, now);
                    continue;
                }
            }

            let survival = self.models.as_ref().and_then(|m| m.survival.as_ref());
            let mut ctx = TickCtx {
                now,
                cfg: &self.cfg,
                rng: &mut self.rng,
                state: &mut self.state,
                sink: &mut self.sink,
                survival,
                functions: &self.functions,
                ids: &mut self.instance_ids,
            };
            self.nodes[idx].run(&mut ctx, &mut self.throttler.trackers);

            if self.cfg.harvestvm.enable_harvest
                && self.nodes[idx].harvest_due(now, &self.cfg.harvestvm)
            {
                self.nodes[idx].harvest(&mut ctx);
            }
        }
    }

    /// Hard-preempt everything on the node, drop it from the cluster and
    /// sweep its tracker references.
    fn kill_node(&mut self, idx: usize, now: u64) {
        let targets: Vec<InstanceId> = self.nodes[idx].instances.iter().map(|i| i.id).collect();
        let survival = self.models.as_ref().and_then(|m| m.survival.as_ref());
        let mut ctx = TickCtx {
            now,
            cfg: &self.cfg,
            rng: &mut self.rng,
            state: &mut self.state,
            sink: &mut self.sink,
            survival,
            functions: &self.functions,
            ids: &mut self.instance_ids,
        };
        self.nodes[idx].preempt(&targets, false, &mut ctx);

        let node = self.nodes.remove(idx);
        for tracker in self.throttler.trackers.values_mut() {
            tracker.instances.retain(|r| r.node != node.id);
        }
        info!(clock = now, node = %node.name, "harvest VM died");
    }

    /// Close the desired/actual gap through the scheduler.
    ///
    /// The gap uses the tracker's live view, not the autoscaler's stale
    /// `actual_scale`.
    fn place_instances(&mut self, now: u64) {
        let deltas: Vec<(String, i64)> = self
            .autoscaler
            .scalers
            .iter()
            .map(|(func, scaler)| {
                let tracker_scale =
                    self.throttler.trackers[func].get_scale(&self.nodes) as i64;
                (func.clone(), scaler.desired_scale as i64 - tracker_scale)
            })
            .filter(|(_, delta)| *delta != 0)
            .collect();

        for (func, delta) in deltas {
            scheduler::schedule(&mut self.nodes, &mut self.rng, now, &func, delta);
        }
    }

    fn reconcile(&mut self, now: u64) {
        for idx in 0..self.nodes.len() {
            let survival = self.models.as_ref().and_then(|m| m.survival.as_ref());
            let mut ctx = TickCtx {
                now,
                cfg: &self.cfg,
                rng: &mut self.rng,
                state: &mut self.state,
                sink: &mut self.sink,
                survival,
                functions: &self.functions,
                ids: &mut self.instance_ids,
            };
            self.nodes[idx].reconcile(&mut ctx);
        }
    }

    /// Append one cluster metrics record.
    fn monitor(&mut self, now: u64) {
        let mut total_desired_scale = 0u64;
        let mut total_actual_scale = 0u64;
        for scaler in self.autoscaler.scalers.values() {
            total_desired_scale += scaler.desired_scale;
            total_actual_scale += scaler.actual_scale;
        }

        let mut running = 0u64;
        let mut active = 0u64;
        let mut existing = 0u64;
        let mut terminating = 0u64;
        let mut cpu_sum = 0.0;
        let mut mem_sum = 0.0;
        for node in &self.nodes {
            for instance in &node.instances {
                existing += 1;
                match instance.status {
                    InstanceStatus::Running | InstanceStatus::Idle => {
                        running += 1;
                        active += 1;
                    }
                    InstanceStatus::Terminating => terminating += 1,
                    _ => active += 1,
                }
            }
            let (cpu, mem) = node.get_utilizations(&self.cfg.node);
            cpu_sum += cpu;
            mem_sum += mem;
        }
        let worker_count = self.nodes.len().max(1) as f64;

        self.trace.push(ClusterRecord {
            rps: self.state.rps,
            timestamp: now,
            actual_scale: total_actual_scale,
            desired_scale: total_desired_scale,
            running_instances: running,
            active_instances: active,
            existing_instances: existing,
            terminating_instances: terminating,
            worker_cpu_avg: cpu_sum / worker_count,
            worker_mem_avg: mem_sum / worker_count + self.cfg.cluster.memory_usage_offset,
        });
    }
}

// ─── Tests ──────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn quick_cfg() -> SimConfig {
        let mut cfg = SimConfig::default();
        // Tighten the control-plane cadences so scenarios resolve fast.
        cfg.cluster.autoscaling_period_milli = 100;
        cfg.cluster.scheduling_period_milli = 100;
        cfg.cluster.update_concurrency_period_milli = 100;
        cfg.node.cold_instance_creation_delay_milli = 200;
        cfg.node.warm_instance_creation_delay_milli = 100;
        cfg
    }

    fn run_for(cluster: &mut Cluster, ticks: u64) {
        for _ in 0..ticks {
            cluster.tick();
            cluster.advance(1);
        }
    }

    #[test]
    fn cold_start_creates_and_serves() {
        let cfg = quick_cfg();
        let functions = vec![Function::new("func-0", 1)];
        let mut cluster = Cluster::with_seed(cfg, functions, BTreeMap::new(), 42);
        cluster.add_node("worker-0", 16, 64 * 1024);
        cluster.set_rps(1.0);

        let request = Request::new(0, "", "func-0", 300, 170, 0, 1.0, 900_000);
        cluster.ingress_accept(request);

        // Cold start: queued, nothing exists yet.
        assert_eq!(cluster.throttler.trackers["func-0"].breaker.len(), 1);
        assert_eq!(cluster.autoscaler.scalers["func-0"].desired_scale, 1);

        run_for(&mut cluster, 5_000);
        assert!(cluster.is_finished());
        assert_eq!(cluster.sink.len(), 1);

        let record = &cluster.sink[0];
        assert!(!record.failed);
        // Latency covers at least the cold creation + discovery delays.
        assert!(record.latency >= cluster.cfg.node.cold_instance_creation_delay_milli as f64);
        assert_eq!(record.cpu_time, 300);
        assert_eq!(record.host, "NormalVM");
    }

    #[test]
    fn warm_request_reuses_the_instance() {
        let cfg = quick_cfg();
        let functions = vec![Function::new("func-0", 1)];
        let mut cluster = Cluster::with_seed(cfg, functions, BTreeMap::new(), 42);
        cluster.add_node("worker-0", 16, 64 * 1024);

        cluster.ingress_accept(Request::new(0, "", "func-0", 300, 170, 0, 1.0, 900_000));
        run_for(&mut cluster, 2_000);
        assert_eq!(cluster.sink.len(), 1);

        // Second request lands on the warm instance: no queueing beyond
        // the dispatch cadence, latency is just the system tax.
        let arrival = cluster.now();
        cluster.ingress_accept(Request::new(1, "", "func-0", 300, 170, arrival, 1.0, 900_000));
        run_for(&mut cluster, 2_000);

        assert_eq!(cluster.sink.len(), 2);
        let warm = &cluster.sink[1];
        assert!(!warm.failed);
        assert!(warm.latency < 100.0, "warm latency was {}", warm.latency);
    }

    #[test]
    fn monitor_appends_records_on_cadence() {
        let mut cfg = quick_cfg();
        cfg.cluster.monitoring_period_milli = 250;
        let mut cluster = Cluster::with_seed(cfg, vec![Function::new("f", 1)], BTreeMap::new(), 42);
        cluster.add_node("worker-0", 16, 64 * 1024);

        run_for(&mut cluster, 1_000);
        assert_eq!(cluster.trace.len(), 4);
        assert_eq!(cluster.trace[1].timestamp, 250);
        // Empty cluster reports the configured memory offset.
        assert_eq!(
            cluster.trace[0].worker_mem_avg,
            cluster.cfg.cluster.memory_usage_offset
        );
    }

    #[test]
    fn is_finished_requires_quiescence() {
        let cfg = quick_cfg();
        let mut cluster = Cluster::with_seed(cfg, vec![Function::new("f", 1)], BTreeMap::new(), 42);
        cluster.add_node("worker-0", 16, 64 * 1024);
        assert!(cluster.is_finished());

        cluster.ingress_accept(Request::new(0, "", "f", 500, 170, 0, 1.0, 900_000));
        run_for(&mut cluster, 500);
        assert!(!cluster.is_finished());

        run_for(&mut cluster, 4_000);
        assert!(cluster.is_finished());
    }
}
