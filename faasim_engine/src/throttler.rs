//! Request admission, queueing and concurrency tracking.
//!
//! The throttler keeps one tracker per function (queue + concurrency
//! history + instance index) plus a central overflow breaker. Requests
//! enter through [`Throttler::hit`] and drain on the dispatch cadence
//! through [`Throttler::dispatch`], head-of-line per tracker.

use std::collections::BTreeMap;

use tracing::{debug, info};

use faasim_common::config::SimConfig;

use crate::autoscaler::Autoscaler;
use crate::breaker::Breaker;
use crate::function::{Function, Request};
use crate::instance::{Instance, InstanceId};
use crate::loadbalance;
use crate::node::{Node, NodeId};
use crate::state::SimState;

/// Queue capacity of the central breaker and every tracker breaker.
const QUEUE_CAPACITY: usize = 10_000;

pub type TrackerMap = BTreeMap<String, Tracker>;

/// Stable handle to an instance owned by some node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InstanceRef {
    pub node: NodeId,
    pub instance: InstanceId,
}

/// Resolve a tracker instance reference against the node arena.
pub fn find_instance<'a>(nodes: &'a [Node], r: &InstanceRef) -> Option<&'a Instance> {
    nodes.iter().find(|n| n.id == r.node)?.instance(r.instance)
}

/// Per-function throttling state.
#[derive(Debug)]
pub struct Tracker {
    pub function: Function,
    pub breaker: Breaker<Request>,
    /// Mirror of the instances hosting this function, kept in sync by the
    /// node spawn/evict paths (and harvest-VM death).
    pub instances: Vec<InstanceRef>,
    /// Concurrency samples; the last entry is the live one.
    pub concurrencies: Vec<i64>,
}

impl Tracker {
    pub fn new(function: Function) -> Self {
        let breaker = Breaker::new(format!("Tracker::{}", function.name), QUEUE_CAPACITY);
        Self {
            function,
            breaker,
            instances: Vec::new(),
            concurrencies: vec![0],
        }
    }

    /// Replica count as the throttler sees it (idle + running).
    pub fn get_scale(&self, nodes: &[Node]) -> usize {
        self.instances
            .iter()
            .filter_map(|r| find_instance(nodes, r))
            .filter(|i| i.is_ready())
            .count()
    }

    /// Append a fresh sample: queued here plus overflowed centrally.
    pub fn update_concurrency(&mut self, overflowed: i64) {
        self.concurrencies.push(self.breaker.len() as i64 + overflowed);
    }

    pub fn inc_concurrency(&mut self) {
        *self.concurrencies.last_mut().expect("empty concurrency history") += 1;
    }

    pub fn dec_concurrency(&mut self) {
        *self.concurrencies.last_mut().expect("empty concurrency history") -= 1;
    }
}

/// Central admission point in front of the instances.
#[derive(Debug)]
pub struct Throttler {
    pub breaker: Breaker<Request>,
    pub trackers: TrackerMap,
}

impl Throttler {
    pub fn new(functions: &[Function]) -> Self {
        let trackers = functions
            .iter()
            .map(|f| (f.name.clone(), Tracker::new(f.clone())))
            .collect();
        Self {
            breaker: Breaker::new("Throttler", QUEUE_CAPACITY),
            trackers,
        }
    }

    /// Ingress-accept a request: queue it (tracker first, central on
    /// overflow), bump concurrency, poke the autoscaler on a cold start,
    /// then attempt one synchronous dispatch.
    pub fn hit(
        &mut self,
        mut request: Request,
        nodes: &mut [Node],
        autoscaler: &mut Autoscaler,
        state: &SimState,
        cfg: &SimConfig,
        now: u64,
    ) {
        // Duplicated execution: once the flow is far enough along, fire a
        // structural copy as well and require both replicas to report.
        let completion_rate = state
            .flows
            .get(&request.flow_id)
            .map(|f| f.completion_rate())
            // A deleted flow means all its requests have been fired.
            .unwrap_or(1.0);
        let reexec =
            cfg.policy.dup_execution && completion_rate >= cfg.policy.dup_execution_threshold;
        if reexec {
            info!(clock = now, req_id = %request.req_id, completion_rate, "re-execute");
            request.num_replicas = 2;
        }

        let dest = request.dest.clone();
        let tracker = self.trackers.get_mut(&dest).expect("hit on unknown function");
        let tracker_has_capacity = tracker.breaker.has_slots();

        if tracker_has_capacity {
            tracker.breaker.enqueue(request.clone());
            if reexec {
                tracker.breaker.enqueue(request.clone());
            }
        } else {
            // Overflow to the centralized queue.
            self.breaker.enqueue(request.clone());
            if reexec {
                self.breaker.enqueue(request.clone());
            }
        }
        tracker.inc_concurrency();

        if tracker.instances.is_empty() {
            info!(clock = now, req_id = %request.req_id, "cold start");
            autoscaler.poke(&request, &self.trackers, nodes, &cfg.autoscaler, now);
        }

        let req_id = request.req_id.clone();
        let tracker = self.trackers.get_mut(&dest).expect("tracker vanished");
        match loadbalance::dispatch_one(tracker, request, nodes, cfg, now) {
            Ok(()) => {
                debug!(clock = now, req_id = %req_id, "dispatched on hit");
                let tracker = self.trackers.get_mut(&dest).expect("tracker vanished");
                tracker.dec_concurrency();
                let dequeued = if tracker_has_capacity {
                    tracker.breaker.dequeue_where(|r| r.req_id == req_id)
                } else {
                    self.breaker.dequeue_where(|r| r.req_id == req_id)
                };
                debug_assert!(dequeued.is_some());
            }
            Err(request) => {
                debug!(clock = now, req_id = %request.req_id, "no compute slots; request queued");
            }
        }
    }

    /// Periodic FIFO drain of the tracker queues.
    ///
    /// Head-of-line per tracker: once the head fails to place, the rest of
    /// that tracker's queue is not attempted this round. The central
    /// breaker must be empty here — overflow is only legal transiently
    /// between a hit and the next dispatch.
    pub fn dispatch(&mut self, nodes: &mut [Node], cfg: &SimConfig, now: u64) {
        assert!(
            self.breaker.is_empty(),
            "requests overflowed to the central queue"
        );

        for tracker in self.trackers.values_mut() {
            loop {
                let Some(request) = tracker.breaker.pop() else {
                    break;
                };
                match loadbalance::dispatch_one(&*tracker, request, nodes, cfg, now) {
                    Ok(()) => debug!(clock = now, "dispatched"),
                    Err(request) => {
                        tracker.breaker.push_front(request);
                        break;
                    }
                }
            }
        }
    }

    /// Snapshot per-function concurrency: queued plus central overflow.
    pub fn record_concurrencies(&mut self) {
        for (func, tracker) in self.trackers.iter_mut() {
            let overflowed = self.breaker.iter().filter(|r| &r.dest == func).count();
            tracker.update_concurrency(overflowed as i64);
        }
    }
}

// ─── Tests ──────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instance::InstanceStatus;
    use crate::node::Node;
    use faasim_common::config::SimConfig;
    use std::collections::BTreeMap;

    fn request(flow_id: u64, dest: &str) -> Request {
        Request::new(flow_id, "dag", dest, 1_000, 170, 0, 1.0, 900_000)
    }

    fn cluster_fixture(num_instances: u64) -> (Throttler, Vec<Node>, Autoscaler) {
        let functions = vec![Function::new("func-0", 1)];
        let mut throttler = Throttler::new(&functions);
        let autoscaler = Autoscaler::new(&functions);

        let cfg = SimConfig::default();
        let mut node = Node::new(crate::node::NodeId(0), "node-0", 16, 64 * 1024, 0, &cfg.node);
        for id in 0..num_instances {
            let mut instance =
                crate::instance::Instance::new(InstanceId(id), "func-0", 1, 0);
            instance.status = InstanceStatus::Idle;
            throttler
                .trackers
                .get_mut("func-0")
                .unwrap()
                .instances
                .push(InstanceRef {
                    node: node.id,
                    instance: instance.id,
                });
            node.instances.push(instance);
        }
        (throttler, vec![node], autoscaler)
    }

    #[test]
    fn hit_dispatches_synchronously_to_idle_instance() {
        let cfg = SimConfig::default();
        let (mut throttler, mut nodes, mut autoscaler) = cluster_fixture(1);
        let state = SimState::new(BTreeMap::new());

        throttler.hit(request(0, "func-0"), &mut nodes, &mut autoscaler, &state, &cfg, 0);

        let tracker = &throttler.trackers["func-0"];
        assert!(tracker.breaker.is_empty());
        assert_eq!(*tracker.concurrencies.last().unwrap(), 0);
        assert_eq!(nodes[0].instances[0].status, InstanceStatus::Running);
    }

    #[test]
    fn hit_without_instances_queues_and_pokes() {
        let cfg = SimConfig::default();
        let (mut throttler, mut nodes, mut autoscaler) = cluster_fixture(0);
        let state = SimState::new(BTreeMap::new());

        throttler.hit(request(0, "func-0"), &mut nodes, &mut autoscaler, &state, &cfg, 0);

        let tracker = &throttler.trackers["func-0"];
        assert_eq!(tracker.breaker.len(), 1);
        assert_eq!(*tracker.concurrencies.last().unwrap(), 1);
        // The poke drove the desired scale up for the cold function.
        assert_eq!(autoscaler.scalers["func-0"].desired_scale, 1);
    }

    #[test]
    fn dispatch_is_head_of_line() {
        let cfg = SimConfig::default();
        let (mut throttler, mut nodes, _) = cluster_fixture(1);

        // Two queued requests, one idle instance: only the head goes out.
        {
            let tracker = throttler.trackers.get_mut("func-0").unwrap();
            tracker.breaker.enqueue(request(0, "func-0"));
            tracker.breaker.enqueue(request(1, "func-0"));
        }
        throttler.dispatch(&mut nodes, &cfg, 0);

        let tracker = &throttler.trackers["func-0"];
        assert_eq!(tracker.breaker.len(), 1);
        assert_eq!(tracker.breaker.first().unwrap().req_id, "1-func-0");
        assert_eq!(nodes[0].instances[0].status, InstanceStatus::Running);
    }

    #[test]
    fn recorded_concurrency_counts_queue_and_overflow() {
        let (mut throttler, _, _) = cluster_fixture(0);
        {
            let tracker = throttler.trackers.get_mut("func-0").unwrap();
            tracker.breaker.enqueue(request(0, "func-0"));
            tracker.breaker.enqueue(request(1, "func-0"));
        }
        throttler.breaker.enqueue(request(2, "func-0"));

        throttler.record_concurrencies();
        let tracker = &throttler.trackers["func-0"];
        assert_eq!(*tracker.concurrencies.last().unwrap(), 3);
    }

    #[test]
    #[should_panic(expected = "overflowed to the central queue")]
    fn dispatch_with_central_backlog_aborts() {
        let cfg = SimConfig::default();
        let (mut throttler, mut nodes, _) = cluster_fixture(1);
        throttler.breaker.enqueue(request(0, "func-0"));
        throttler.dispatch(&mut nodes, &cfg, 0);
    }

    #[test]
    fn dup_execution_enqueues_a_replica() {
        let mut cfg = SimConfig::default();
        cfg.policy.dup_execution = true;
        cfg.policy.dup_execution_threshold = 0.5;
        let (mut throttler, mut nodes, mut autoscaler) = cluster_fixture(0);
        // No live flow: a settled flow counts as fully complete.
        let state = SimState::new(BTreeMap::new());

        throttler.hit(request(0, "func-0"), &mut nodes, &mut autoscaler, &state, &cfg, 0);

        let tracker = &throttler.trackers["func-0"];
        assert_eq!(tracker.breaker.len(), 2);
        assert!(
            tracker
                .breaker
                .iter()
                .all(|r| r.num_replicas == 2 && r.req_id == "0-func-0")
        );
        // The replica does not bump concurrency a second time.
        assert_eq!(*tracker.concurrencies.last().unwrap(), 1);
    }

    #[test]
    fn tracker_scale_counts_ready_instances() {
        let (mut throttler, mut nodes, _) = cluster_fixture(3);
        nodes[0].instances[0].status = InstanceStatus::Running;
        nodes[0].instances[1].status = InstanceStatus::Terminating;
        nodes[0].instances[2].status = InstanceStatus::Unknown;

        let tracker = throttler.trackers.get_mut("func-0").unwrap();
        assert_eq!(tracker.get_scale(&nodes), 1);
    }
}
