//! Harvest-VM runtime: trace-driven core counts and stochastic death.
//!
//! A Harvest VM is a [`Node`] whose core count follows a per-second trace
//! schedule and whose liveness is drawn periodically against a survival
//! model. Shrinking below the current occupancy soft-preempts running
//! instances onto the node runqueue; a failed liveness draw (or a zero
//! core count) kills the node outright.

use rand::Rng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use tracing::{debug, info};

use faasim_common::config::HarvestVmConfig;
use faasim_common::harvestvm::SurvivalModel;

use crate::instance::InstanceId;
use crate::node::Node;
use crate::state::TickCtx;

const MILLIS_PER_HOUR: f64 = 3_600_000.0;

/// Per-node Harvest-VM state.
#[derive(Debug, Clone)]
pub struct HvmRuntime {
    pub hvm_hash: String,
    /// Available cores per second of lifetime (wraps around).
    pub cores_schedule: Vec<u32>,
    base_hazard_milli: f64,
    cumulative_hazard: f64,
    pub survival_pred_ckp: u64,
    pub harvest_ckp: u64,
}

impl HvmRuntime {
    pub fn new(
        hvm_hash: impl Into<String>,
        cores_schedule: Vec<u32>,
        base_hazard_per_sec: f64,
        start_time: u64,
    ) -> Self {
        assert!(!cores_schedule.is_empty(), "empty cores schedule");
        Self {
            hvm_hash: hvm_hash.into(),
            cores_schedule,
            base_hazard_milli: base_hazard_per_sec / 1_000.0,
            cumulative_hazard: 0.0,
            survival_pred_ckp: start_time,
            harvest_ckp: start_time,
        }
    }

    /// Cores granted by the trace at `now`, by lifetime seconds modulo the
    /// schedule length.
    pub fn core_count_at(&self, now: u64, start_time: u64) -> u32 {
        let lifetime_sec = ((now - start_time) / 1_000) as usize;
        self.cores_schedule[lifetime_sec % self.cores_schedule.len()]
    }

    /// Accrue one hazard step and return the survival estimate.
    fn accrue_hazard(&mut self) -> f64 {
        self.cumulative_hazard += self.base_hazard_milli;
        self.survival_estimate()
    }

    /// `exp(−Σ hazard)`; read-only counterpart of [`Self::accrue_hazard`].
    pub fn survival_estimate(&self) -> f64 {
        (-self.cumulative_hazard).exp()
    }
}

impl Node {
    #[inline]
    pub fn is_harvest(&self) -> bool {
        self.hvm.is_some()
    }

    pub fn survival_check_due(&self, now: u64, cfg: &HarvestVmConfig) -> bool {
        self.hvm
            .as_ref()
            .is_some_and(|h| now >= h.survival_pred_ckp + cfg.survival_predict_period_milli)
    }

    pub fn harvest_due(&self, now: u64, cfg: &HarvestVmConfig) -> bool {
        self.hvm
            .as_ref()
            .is_some_and(|h| now >= h.harvest_ckp + cfg.harvest_period_milli)
    }

    /// Draw liveness against the survival model. Returns true when the
    /// node dies (the draw fails, or the VM has no cores left).
    pub fn survival_draw(
        &mut self,
        now: u64,
        rng: &mut StdRng,
        model: Option<&SurvivalModel>,
    ) -> bool {
        let start_time = self.start_time;
        let num_cores = self.num_cores;
        let hvm = self.hvm.as_mut().expect("survival draw on a normal VM");
        hvm.survival_pred_ckp = now;

        let u: f64 = rng.gen_range(0.0..1.0);
        let prob = match model {
            Some(model) => model.predict((now - start_time) as f64 / MILLIS_PER_HOUR),
            None => hvm.accrue_hazard(),
        };
        u > prob || num_cores == 0
    }

    /// Track the trace schedule: grow by appending empty slots, shrink by
    /// releasing free slots first and soft-preempting running instances
    /// when that is not enough.
    pub fn harvest(&mut self, ctx: &mut TickCtx) {
        let target = {
            let hvm = self.hvm.as_mut().expect("harvest on a normal VM");
            hvm.harvest_ckp = ctx.now;
            let raw = hvm.core_count_at(ctx.now, self.start_time);
            (raw as f64 * (1.0 - ctx.cfg.node.infra_cpu_overhead_ratio)) as usize
        };

        if target == self.num_cores {
            return;
        }

        if target > self.num_cores {
            debug!(
                clock = ctx.now,
                node = %self.name,
                from = self.num_cores,
                to = target,
                "harvest grow"
            );
            self.cpu_registry.resize(target, None);
        } else {
            info!(
                clock = ctx.now,
                node = %self.name,
                from = self.num_cores,
                to = target,
                "harvest shrink"
            );
            let to_remove = self.num_cores - target;
            let free = self.num_free_cores();
            let cores_short = to_remove.saturating_sub(free);

            if cores_short > 0 {
                // Pick distinct victims among the instances holding cores
                // until enough slots are covered.
                let mut pool: Vec<(InstanceId, usize)> = Vec::new();
                for slot in self.cpu_registry.iter().flatten() {
                    match pool.iter_mut().find(|(id, _)| id == slot) {
                        Some((_, held)) => *held += 1,
                        None => pool.push((*slot, 1)),
                    }
                }
                pool.shuffle(ctx.rng);

                let mut victims = Vec::new();
                let mut freed = 0;
                for (id, held) in pool {
                    if freed >= cores_short {
                        break;
                    }
                    victims.push(id);
                    freed += held;
                }
                assert!(
                    freed >= cores_short,
                    "registry underflow while shrinking {}",
                    self.name
                );
                self.preempt(&victims, true, ctx);
            }

            self.compact_cpu_registry();
            self.cpu_registry.truncate(target);
        }

        self.num_cores = target;
        debug_assert_eq!(self.cpu_registry.len(), target);
    }
}

// ─── Tests ──────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::function::Request;
    use crate::instance::{Instance, InstanceStatus};
    use crate::node::NodeId;
    use crate::testutil::{CtxParts, test_ctx};
    use faasim_common::config::SimConfig;
    use rand::SeedableRng;

    fn harvest_node(schedule: Vec<u32>) -> Node {
        let cfg = SimConfig::default();
        let hvm = HvmRuntime::new("abc123", schedule, 0.42, 0);
        Node::new_harvest(NodeId(0), "hvm-abc123", 130 * 1024, 0, hvm, &cfg.node)
    }

    fn running_instance(node: &mut Node, id: u64, vcpu: u32) -> usize {
        let mut instance = Instance::new(InstanceId(id), "func-0", vcpu, 0);
        instance.status = InstanceStatus::Idle;
        node.instances.push(instance);
        let idx = node.instances.len() - 1;
        let mut request = Request::new(id, "dag", "func-0", 10_000, 170, 0, 1.0, 900_000);
        request.start(0);
        node.instances[idx].breaker.enqueue(request);
        node.instances[idx].status = InstanceStatus::Running;
        assert!(node.book_cores(idx));
        idx
    }

    #[test]
    fn schedule_wraps_around() {
        let hvm = HvmRuntime::new("h", vec![4, 8, 2], 0.42, 0);
        assert_eq!(hvm.core_count_at(0, 0), 4);
        assert_eq!(hvm.core_count_at(1_500, 0), 8);
        assert_eq!(hvm.core_count_at(2_000, 0), 2);
        assert_eq!(hvm.core_count_at(3_000, 0), 4);
    }

    #[test]
    fn initial_cores_come_from_the_trace() {
        let node = harvest_node(vec![12, 4]);
        assert_eq!(node.num_cores, 12);
        assert_eq!(node.cpu_registry.len(), 12);
        assert!(node.is_harvest());
    }

    #[test]
    fn grow_appends_empty_slots() {
        let cfg = SimConfig::default();
        let mut parts = CtxParts::new(&cfg);
        let mut node = harvest_node(vec![4, 10]);

        let mut ctx = test_ctx(1_000, &cfg, &mut parts);
        node.harvest(&mut ctx);
        assert_eq!(node.num_cores, 10);
        assert_eq!(node.num_free_cores(), 10);
    }

    #[test]
    fn shrink_without_load_releases_free_slots() {
        let cfg = SimConfig::default();
        let mut parts = CtxParts::new(&cfg);
        let mut node = harvest_node(vec![8, 2]);

        let mut ctx = test_ctx(1_000, &cfg, &mut parts);
        node.harvest(&mut ctx);
        assert_eq!(node.num_cores, 2);
        assert_eq!(node.cpu_registry.len(), 2);
        assert!(node.instances.is_empty());
    }

    #[test]
    fn shrink_under_load_soft_preempts() {
        let cfg = SimConfig::default();
        let mut parts = CtxParts::new(&cfg);
        let mut node = harvest_node(vec![4, 1]);
        let idx = running_instance(&mut node, 0, 4);

        let mut ctx = test_ctx(1_000, &cfg, &mut parts);
        node.harvest(&mut ctx);

        assert_eq!(node.num_cores, 1);
        // The victim stays running but was halted onto the runqueue.
        let instance = &node.instances[idx];
        assert_eq!(instance.status, InstanceStatus::Running);
        assert!(!instance.hosted_job().unwrap().is_running);
        assert!(node.runqueue.contains(&instance.id));
        // No request was drained by the soft preemption.
        assert!(parts.sink.is_empty());
    }

    #[test]
    fn shrink_prefers_free_slots_over_preemption() {
        let cfg = SimConfig::default();
        let mut parts = CtxParts::new(&cfg);
        let mut node = harvest_node(vec![8, 6]);
        running_instance(&mut node, 0, 2);

        // 8 -> 6 with 6 free slots: nobody is preempted.
        let mut ctx = test_ctx(1_000, &cfg, &mut parts);
        node.harvest(&mut ctx);
        assert_eq!(node.num_cores, 6);
        assert!(node.runqueue.is_empty());
        // The occupied pair moved to the front by compaction.
        assert!(node.cpu_registry[0].is_some() && node.cpu_registry[1].is_some());
        assert_eq!(node.num_free_cores(), 4);
    }

    #[test]
    fn hazard_fallback_decays() {
        let mut node = harvest_node(vec![4]);
        let mut rng = StdRng::seed_from_u64(1);
        let before = node.hvm.as_ref().unwrap().survival_estimate();
        assert_eq!(before, 1.0);

        let _ = node.survival_draw(500, &mut rng, None);
        let after = node.hvm.as_ref().unwrap().survival_estimate();
        assert!(after < before);
        assert_eq!(node.hvm.as_ref().unwrap().survival_pred_ckp, 500);
    }

    #[test]
    fn zero_cores_kill_the_vm() {
        let cfg = SimConfig::default();
        let mut node = harvest_node(vec![4, 0]);
        let mut parts = CtxParts::new(&cfg);
        {
            let mut ctx = test_ctx(1_000, &cfg, &mut parts);
            node.harvest(&mut ctx);
        }
        assert_eq!(node.num_cores, 0);

        let survival = SurvivalModel::immortal();
        let mut rng = StdRng::seed_from_u64(1);
        assert!(node.survival_draw(1_500, &mut rng, Some(&survival)));
    }
}
