//! Worker nodes: CPU registry, controller workqueue, instance lifecycle.
//!
//! A node owns its instances and the registry of CPU slots they book.
//! CPU admission is strict FCFS through the node runqueue: only the head
//! may book, and it books all-or-nothing. The controller workqueue holds
//! signed create/destroy bindings reconciled on the CRI cadence with
//! per-round budgets and cold/warm creation delays; promotion out of the
//! creation queue and eviction of expired instances are rate-limited per
//! virtual second.

use std::collections::VecDeque;

use tracing::{debug, info};

use faasim_common::config::NodeConfig;
use faasim_common::harvestvm::SurvivalModel;

use crate::function::system_tax;
use crate::harvest::HvmRuntime;
use crate::instance::{Instance, InstanceId, InstanceStatus};
use crate::records::RequestRecord;
use crate::state::TickCtx;
use crate::throttler::{InstanceRef, TrackerMap};

/// Spawn/evict operations allowed per virtual second.
const OPS_RATE_LIMIT_PER_SEC: u32 = 3;

/// Stable node identifier (survives node-list reshuffles and removals).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(pub u32);

/// Worker flavor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerKind {
    NormalVm,
    HarvestVm,
}

impl std::fmt::Display for WorkerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NormalVm => write!(f, "NormalVM"),
            Self::HarvestVm => write!(f, "HarvestVM"),
        }
    }
}

/// Controller binding: `quantity > 0` creates, `< 0` destroys, `0` is
/// illegal.
#[derive(Debug, Clone)]
pub struct SchedulingBinding {
    pub sched_time: u64,
    pub func: String,
    pub quantity: i64,
}

/// Effective core count after the infrastructure overhead cut.
fn effective_cores(raw_cores: u32, cfg: &NodeConfig) -> usize {
    (raw_cores as f64 * (1.0 - cfg.infra_cpu_overhead_ratio)) as usize
}

/// A worker/VM running on bare metal.
#[derive(Debug)]
pub struct Node {
    pub id: NodeId,
    pub name: String,
    pub kind: WorkerKind,
    pub start_time: u64,
    /// Effective core count (after infra overhead).
    pub num_cores: usize,
    pub memory_mib: u64,
    pub max_num_instances: usize,
    /// Ordered core slots; `Some(id)` marks a slot booked by an instance.
    pub cpu_registry: Vec<Option<InstanceId>>,
    pub instances: Vec<Instance>,
    /// Pending instances waiting out their creation delay.
    pub creation_queue: VecDeque<Instance>,
    /// Terminating instances waiting out their grace period.
    pub eviction_queue: VecDeque<InstanceId>,
    /// FCFS queue of instances waiting to book cores.
    pub runqueue: VecDeque<InstanceId>,
    pub controller_workqueue: Vec<SchedulingBinding>,
    created_this_sec: u32,
    evicted_this_sec: u32,
    /// Present on Harvest VMs only.
    pub hvm: Option<HvmRuntime>,
}

impl Node {
    pub fn new(
        id: NodeId,
        name: impl Into<String>,
        raw_cores: u32,
        memory_mib: u64,
        start_time: u64,
        cfg: &NodeConfig,
    ) -> Self {
        let num_cores = effective_cores(raw_cores, cfg);
        Self {
            id,
            name: name.into(),
            kind: WorkerKind::NormalVm,
            start_time,
            num_cores,
            memory_mib,
            max_num_instances: cfg.max_num_instances,
            cpu_registry: vec![None; num_cores],
            instances: Vec::new(),
            creation_queue: VecDeque::new(),
            eviction_queue: VecDeque::new(),
            runqueue: VecDeque::new(),
            controller_workqueue: Vec::new(),
            created_this_sec: 0,
            evicted_this_sec: 0,
            hvm: None,
        }
    }

    /// Build a Harvest VM whose initial core count comes from its trace.
    pub fn new_harvest(
        id: NodeId,
        name: impl Into<String>,
        memory_mib: u64,
        start_time: u64,
        hvm: HvmRuntime,
        cfg: &NodeConfig,
    ) -> Self {
        let raw_cores = hvm.core_count_at(start_time, start_time);
        let mut node = Self::new(id, name, raw_cores, memory_mib, start_time, cfg);
        node.kind = WorkerKind::HarvestVm;
        node.hvm = Some(hvm);
        node
    }

    // ─── Instance Lookup ────────────────────────────────────────────

    fn idx_of(&self, id: InstanceId) -> Option<usize> {
        self.instances.iter().position(|i| i.id == id)
    }

    pub fn instance(&self, id: InstanceId) -> Option<&Instance> {
        self.instances.iter().find(|i| i.id == id)
    }

    // ─── CPU Registry ───────────────────────────────────────────────

    pub fn num_free_cores(&self) -> usize {
        self.cpu_registry.iter().filter(|slot| slot.is_none()).count()
    }

    /// Book `vcpu` cores for the instance at `idx`, strict FCFS.
    ///
    /// The instance joins the tail of the runqueue if absent; only the
    /// head is considered. Booking is all-or-nothing: an unsatisfiable
    /// head goes back to the front and blocks the queue.
    pub fn book_cores(&mut self, idx: usize) -> bool {
        let id = self.instances[idx].id;
        if !self.runqueue.contains(&id) {
            self.runqueue.push_back(id);
        }
        if self.runqueue.front() != Some(&id) {
            return false;
        }
        self.runqueue.pop_front();

        let requested = self.instances[idx].vcpu as usize;
        if self.num_free_cores() < requested {
            self.runqueue.push_front(id);
            return false;
        }
        let mut granted = 0;
        for slot in self.cpu_registry.iter_mut() {
            if granted == requested {
                break;
            }
            if slot.is_none() {
                *slot = Some(id);
                granted += 1;
            }
        }
        true
    }

    /// Clear every registry slot held by the instance.
    pub fn yield_cores(&mut self, id: InstanceId) {
        for slot in self.cpu_registry.iter_mut() {
            if *slot == Some(id) {
                *slot = None;
            }
        }
    }

    /// Move all holes to the tail, preserving slot order.
    pub fn compact_cpu_registry(&mut self) {
        let len = self.cpu_registry.len();
        let occupied: Vec<InstanceId> = self.cpu_registry.iter().flatten().copied().collect();
        self.cpu_registry.clear();
        self.cpu_registry.extend(occupied.into_iter().map(Some));
        self.cpu_registry.resize(len, None);
    }

    /// `(cpu%, mem%)`. Memory accounts hosted jobs plus overhead, and the
    /// idle-instance footprint otherwise.
    pub fn get_utilizations(&self, cfg: &NodeConfig) -> (f64, f64) {
        let occupancy = self.cpu_registry.iter().filter(|slot| slot.is_some()).count();
        let cpu = if self.num_cores > 0 {
            occupancy as f64 / self.num_cores as f64 * 100.0
        } else {
            0.0
        };

        let mut memory_used = 0u64;
        for instance in &self.instances {
            memory_used += match instance.hosted_job() {
                Some(job) => job.memory_mib + cfg.job_memory_overhead_mib,
                None => cfg.instance_size_mib,
            };
        }
        let mem = memory_used as f64 / self.memory_mib as f64 * 100.0;
        (cpu, mem)
    }

    // ─── Controller Workqueue ───────────────────────────────────────

    /// Queue a signed create/destroy binding.
    pub fn bind(&mut self, now: u64, func: &str, quantity: i64) {
        self.controller_workqueue.push(SchedulingBinding {
            sched_time: now,
            func: func.to_string(),
            quantity,
        });
    }

    /// Request destruction of up to `num` idle instances of `func`.
    ///
    /// Only queues as many as there are idle instances; with none, stale
    /// destroy bindings for the function are swept instead. Returns the
    /// non-negative unsatisfied remainder.
    pub fn kill(&mut self, now: u64, func: &str, num: i64) -> i64 {
        let matched = self
            .instances
            .iter()
            .filter(|i| i.func == func && i.status == InstanceStatus::Idle)
            .count() as i64;

        if matched == 0 {
            self.controller_workqueue
                .retain(|b| !(b.func == func && b.quantity <= 0));
            return num;
        }

        let remaining = (num - matched).max(0);
        let quantity = if remaining == 0 { -num } else { -matched };
        self.bind(now, func, quantity);
        remaining
    }

    /// No running instance of `func` on this node.
    pub fn is_cold_start(&self, func: &str) -> bool {
        !self
            .instances
            .iter()
            .any(|i| i.func == func && i.status == InstanceStatus::Running)
    }

    pub fn get_num_available_slots(&self) -> usize {
        self.max_num_instances.saturating_sub(self.instances.len())
    }

    /// CRI control loop: turn queued bindings into pending creations and
    /// terminations, within the per-round budgets.
    pub fn reconcile(&mut self, ctx: &mut TickCtx) {
        let mut creation_budget = self.max_num_instances as i64 - self.instances.len() as i64;
        let mut deletion_budget = ctx.cfg.node.instance_deletion_concurrency as i64;

        let mut queue = std::mem::take(&mut self.controller_workqueue).into_iter();
        let mut kept: Vec<SchedulingBinding> = Vec::new();

        while let Some(mut binding) = queue.next() {
            if creation_budget <= 0 && deletion_budget <= 0 {
                kept.push(binding);
                kept.extend(queue);
                break;
            }

            if binding.quantity > 0 {
                if creation_budget <= 0 {
                    kept.push(binding);
                    continue;
                }
                let cri_delay = if self.is_cold_start(&binding.func) {
                    ctx.cfg.node.cold_instance_creation_delay_milli
                } else {
                    ctx.cfg.node.warm_instance_creation_delay_milli
                };

                let num_new = binding.quantity.min(creation_budget);
                creation_budget -= num_new;
                binding.quantity -= num_new;

                let vcpu = ctx
                    .functions
                    .get(&binding.func)
                    .expect("binding for unregistered function")
                    .vcpu;
                for _ in 0..num_new {
                    let instance =
                        Instance::new(ctx.ids.next(), &binding.func, vcpu, ctx.now + cri_delay);
                    self.creation_queue.push_back(instance);
                }
                debug!(
                    clock = ctx.now,
                    node = %self.name,
                    func = %binding.func,
                    num_new,
                    cri_delay,
                    "instances pending creation"
                );
                if binding.quantity != 0 {
                    kept.push(binding);
                }
            } else if binding.quantity < 0 {
                if deletion_budget <= 0 {
                    kept.push(binding);
                    continue;
                }
                let num_to_terminate = (-binding.quantity).min(deletion_budget);
                let deadline = ctx.now + ctx.cfg.node.instance_grace_period_sec * 1_000;

                let mut terminated = 0i64;
                for instance in self.instances.iter_mut() {
                    if terminated >= num_to_terminate {
                        break;
                    }
                    if instance.func == binding.func && instance.status == InstanceStatus::Idle {
                        assert!(
                            instance.hosted_job().is_none(),
                            "idle instance hosts a job"
                        );
                        instance.status = InstanceStatus::Terminating;
                        instance.deadline = Some(deadline);
                        self.eviction_queue.push_back(instance.id);
                        terminated += 1;
                    }
                }
                deletion_budget -= terminated;

                let remaining = num_to_terminate - terminated;
                if remaining > 0 {
                    binding.quantity = -remaining;
                    kept.push(binding);
                }
                assert!(remaining >= 0, "terminated more instances than requested");
            } else {
                panic!("zero binding object");
            }
        }
        self.controller_workqueue = kept;
    }

    /// Promote due instances from the creation queue, mirroring them into
    /// the function tracker. Rate-limited per virtual second.
    pub fn spawn(&mut self, now: u64, trackers: &mut TrackerMap) {
        if now % 1_000 == 0 {
            self.created_this_sec = 0;
        }
        if self.created_this_sec >= OPS_RATE_LIMIT_PER_SEC {
            return;
        }

        while let Some(front) = self.creation_queue.front() {
            if now < front.start_time {
                // The queue is in creation-time order.
                break;
            }
            let instance = self.creation_queue.pop_front().expect("front vanished");
            self.created_this_sec += 1;

            let tracker = trackers
                .get_mut(&instance.func)
                .expect("spawn for unregistered function");
            tracker.instances.push(InstanceRef {
                node: self.id,
                instance: instance.id,
            });
            debug!(clock = now, node = %self.name, func = %instance.func, "spawned instance");
            self.instances.push(instance);

            if self.created_this_sec >= OPS_RATE_LIMIT_PER_SEC {
                break;
            }
        }
    }

    /// Garbage-collect terminating instances past their deadline, removing
    /// them from both the node and the tracker. Rate-limited per second.
    pub fn evict(&mut self, now: u64, trackers: &mut TrackerMap) {
        if now % 1_000 == 0 {
            self.evicted_this_sec = 0;
        }
        if self.evicted_this_sec >= OPS_RATE_LIMIT_PER_SEC {
            return;
        }

        while let Some(&id) = self.eviction_queue.front() {
            let idx = self.idx_of(id).expect("evicting unknown instance");
            let deadline = self.instances[idx]
                .deadline
                .expect("terminating instance without deadline");
            if now < deadline {
                break;
            }
            self.eviction_queue.pop_front();
            self.evicted_this_sec += 1;

            let instance = self.instances.remove(idx);
            let tracker = trackers
                .get_mut(&instance.func)
                .expect("evict for unregistered function");
            tracker.instances.retain(|r| r.instance != instance.id);
            debug!(clock = now, node = %self.name, func = %instance.func, "evicted instance");

            if self.evicted_this_sec >= OPS_RATE_LIMIT_PER_SEC {
                break;
            }
        }
    }

    // ─── Instance Lifecycle ─────────────────────────────────────────

    /// Try to reserve the instance's slot for `request`.
    ///
    /// Rejects while terminating or full; a destination mismatch is an
    /// invariant violation. On an idle instance, serving starts at once.
    pub fn reserve(
        &mut self,
        id: InstanceId,
        request: crate::function::Request,
        now: u64,
    ) -> Result<(), crate::function::Request> {
        let Some(idx) = self.idx_of(id) else {
            return Err(request);
        };
        assert_eq!(
            request.dest, self.instances[idx].func,
            "destination mismatch on reserve"
        );

        match self.instances[idx].status {
            InstanceStatus::Terminating => Err(request),
            InstanceStatus::Idle if self.instances[idx].breaker.has_slots() => {
                self.instances[idx].breaker.enqueue(request);
                self.serve(idx, now);
                Ok(())
            }
            InstanceStatus::Running if self.instances[idx].breaker.has_slots() => {
                // Unreachable with slot capacity 1; kept for larger slots.
                self.instances[idx].breaker.enqueue(request);
                Ok(())
            }
            _ => Err(request),
        }
    }

    /// Mark running and book cores for the head request; the request only
    /// starts accumulating CPU time once cores are granted.
    fn serve(&mut self, idx: usize, now: u64) {
        self.instances[idx].status = InstanceStatus::Running;
        if self.book_cores(idx) {
            let name = &self.name;
            let request = self.instances[idx]
                .breaker
                .first_mut()
                .expect("serving an instance without a queued request");
            if !request.is_running {
                request.start(now);
            }
            debug!(clock = now, req_id = %request.req_id, node = %name, "serving");
        }
    }

    /// Advance every hosted instance by one tick.
    pub fn run(&mut self, ctx: &mut TickCtx, trackers: &mut TrackerMap) {
        self.spawn(ctx.now, trackers);
        self.evict(ctx.now, trackers);

        for idx in 0..self.instances.len() {
            self.run_one(idx, ctx);
        }
    }

    fn run_one(&mut self, idx: usize, ctx: &mut TickCtx) {
        match self.instances[idx].status {
            InstanceStatus::Running => {
                let job_running = match self.instances[idx].hosted_job() {
                    Some(job) => job.is_running,
                    None => panic!("running instance without a hosted job"),
                };
                if job_running {
                    let residual = self.instances[idx]
                        .hosted_job_mut()
                        .expect("hosted job vanished")
                        .advance(ctx.now);
                    if residual <= 0 {
                        self.stop_instance(idx, false, ctx);
                    }
                } else {
                    // Cores were not granted (or the job was halted): book
                    // again.
                    self.serve(idx, ctx.now);
                }
            }
            InstanceStatus::Unknown => {
                if ctx.now - self.instances[idx].discovery_ckp
                    > ctx.cfg.cluster.discovery_delay_milli
                {
                    self.instances[idx].status = InstanceStatus::Idle;
                }
            }
            InstanceStatus::Idle => {
                if self.instances[idx].breaker.first().is_some() {
                    self.serve(idx, ctx.now);
                }
            }
            _ => {}
        }
    }

    /// Finish the hosted request (all queued requests when preempted),
    /// dereference it in the flow engine and drain it to the result sink.
    pub fn stop_instance(&mut self, idx: usize, preempted: bool, ctx: &mut TickCtx) {
        let id = self.instances[idx].id;
        self.yield_cores(id);
        let (cpu, _mem) = self.get_utilizations(&ctx.cfg.node);

        loop {
            let Some(mut request) = self.instances[idx].breaker.pop() else {
                break;
            };
            let tax = system_tax(ctx.rng, cpu);
            request.finish(ctx.now, tax);
            ctx.state.dereference(&request, ctx.now, ctx.cfg);

            if request.failed {
                info!(clock = ctx.now, req_id = %request.req_id, node = %self.name, "failed request");
            } else {
                debug!(
                    clock = ctx.now,
                    req_id = %request.req_id,
                    duration = request.duration_milli,
                    "finished request"
                );
            }
            let record = self.request_record(&request, ctx);
            ctx.sink.push(record);

            if !preempted {
                break;
            }
        }

        let instance = &mut self.instances[idx];
        if instance.breaker.first().is_some() {
            // The next queued request books cores on the coming tick.
            instance.status = InstanceStatus::Running;
        } else {
            // Status change propagates only after the discovery delay.
            instance.status = InstanceStatus::Unknown;
            instance.discovery_ckp = ctx.now;
        }
    }

    /// Halt the hosted request, keeping the instance running (it rebooks
    /// cores through the runqueue later).
    pub fn halt_instance(&mut self, idx: usize) {
        if self.instances[idx].status != InstanceStatus::Running {
            return;
        }
        let id = self.instances[idx].id;
        self.yield_cores(id);
        let name = &self.name;
        if let Some(job) = self.instances[idx].hosted_job_mut() {
            job.is_running = false;
            debug!(req_id = %job.req_id, node = %name, "halted");
        }
    }

    /// Preempt the given instances. Soft (`context_switch`) halts them
    /// onto the runqueue; hard stops them (failing unfinished requests)
    /// and marks them terminating under the notification deadline.
    pub fn preempt(&mut self, targets: &[InstanceId], context_switch: bool, ctx: &mut TickCtx) {
        for &id in targets {
            let Some(idx) = self.idx_of(id) else {
                panic!("preemption target not found");
            };
            if context_switch {
                self.halt_instance(idx);
                self.runqueue.push_back(id);
            } else {
                self.stop_instance(idx, true, ctx);
                let deadline = ctx.now + ctx.cfg.harvestvm.preemption_notification_sec * 1_000;
                let instance = &mut self.instances[idx];
                instance.status = InstanceStatus::Terminating;
                instance.deadline = Some(deadline);
            }
        }
    }

    fn request_record(&self, request: &crate::function::Request, ctx: &TickCtx) -> RequestRecord {
        let survival_prob = self.record_survival_prob(ctx.now, ctx.survival);
        RequestRecord {
            req_id: request.req_id.clone(),
            flow_id: request.flow_id,
            dag: request.dag_name.clone(),
            node: self.name.clone(),
            host: self.kind.to_string(),
            rps: request.rps,
            arrival_time: request.arrival_time,
            start_time: request.start_time,
            end_time: request.end_time,
            cpu_time: request.total_cputime,
            latency: request.latency(),
            function: request.dest.clone(),
            duration: request.duration_milli,
            memory: request.memory_mib,
            survival_prob: (survival_prob * 1e5).round() / 1e5,
            failed: request.failed,
        }
    }

    /// Survival probability reported in result records. Normal VMs never
    /// die; Harvest VMs consult the trace model when present and the
    /// cumulative-hazard estimate otherwise.
    pub fn record_survival_prob(&self, now: u64, model: Option<&SurvivalModel>) -> f64 {
        match (&self.hvm, model) {
            (Some(_), Some(model)) => {
                model.predict((now - self.start_time) as f64 / 3_600_000.0)
            }
            (Some(hvm), None) => hvm.survival_estimate(),
            _ => 1.0,
        }
    }
}

// ─── Tests ──────────────────────────────────────────────────────────
