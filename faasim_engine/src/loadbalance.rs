//! Load-balance strategies for dispatching a request to an instance.

use tracing::debug;

use faasim_common::config::{LoadBalancePolicy, SimConfig};

use crate::function::Request;
use crate::instance::InstanceStatus;
use crate::node::{Node, NodeId};
use crate::throttler::{InstanceRef, Tracker, find_instance};

/// Try to place `request` on an instance of its destination function.
/// Returns the request on failure so it can stay queued.
pub fn dispatch_one(
    tracker: &Tracker,
    request: Request,
    nodes: &mut [Node],
    cfg: &SimConfig,
    now: u64,
) -> Result<(), Request> {
    match cfg.policy.load_balance {
        LoadBalancePolicy::FirstAvailable => first_available(tracker, request, nodes, now),
        LoadBalancePolicy::LeastLoaded => least_loaded(tracker, request, nodes, cfg, now),
    }
}

/// Reserve on the first instance that accepts, in tracker order.
fn first_available(
    tracker: &Tracker,
    mut request: Request,
    nodes: &mut [Node],
    now: u64,
) -> Result<(), Request> {
    for r in &tracker.instances {
        let Some(node) = nodes.iter_mut().find(|n| n.id == r.node) else {
            continue;
        };
        match node.reserve(r.instance, request, now) {
            Ok(()) => return Ok(()),
            Err(back) => request = back,
        }
    }
    Err(request)
}

/// Prefer an idle instance on the node with the fewest runqueue entries
/// (ties broken by summed CPU+memory utilization); fall back to
/// first-available when no idle instance exists there.
fn least_loaded(
    tracker: &Tracker,
    request: Request,
    nodes: &mut [Node],
    cfg: &SimConfig,
    now: u64,
) -> Result<(), Request> {
    // Distinct live nodes hosting instances of this function.
    let mut candidates: Vec<NodeId> = Vec::new();
    for r in &tracker.instances {
        if !candidates.contains(&r.node) && nodes.iter().any(|n| n.id == r.node) {
            candidates.push(r.node);
        }
    }
    candidates.sort_by(|a, b| {
        let na = nodes.iter().find(|n| n.id == *a).expect("candidate vanished");
        let nb = nodes.iter().find(|n| n.id == *b).expect("candidate vanished");
        let (cpu_a, mem_a) = na.get_utilizations(&cfg.node);
        let (cpu_b, mem_b) = nb.get_utilizations(&cfg.node);
        na.runqueue
            .len()
            .cmp(&nb.runqueue.len())
            .then((cpu_a + mem_a).total_cmp(&(cpu_b + mem_b)))
    });

    if let Some(ll_node) = candidates.first().copied() {
        let idle: Option<InstanceRef> = tracker
            .instances
            .iter()
            .find(|r| {
                r.node == ll_node
                    && find_instance(nodes, r)
                        .is_some_and(|i| i.status == InstanceStatus::Idle)
            })
            .copied();

        if let Some(r) = idle {
            let node = nodes
                .iter_mut()
                .find(|n| n.id == ll_node)
                .expect("least-loaded node vanished");
            return match node.reserve(r.instance, request, now) {
                Ok(()) => {
                    debug!(clock = now, node = %node.name, "dispatched to least-loaded node");
                    Ok(())
                }
                // The instance reported idle a moment ago.
                Err(_) => panic!("failed to reserve a spot on an idle instance"),
            };
        }
    }

    // No idle instance even on the least-loaded node: every node is the
    // same, take whatever accepts first.
    first_available(tracker, request, nodes, now)
}

// ─── Tests ──────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::function::Function;
    use crate::instance::{Instance, InstanceId};
    use crate::node::NodeId;

    fn fixture(num_nodes: u32) -> (Tracker, Vec<Node>) {
        let cfg = SimConfig::default();
        let tracker = Tracker::new(Function::new("func-0", 1));
        let nodes = (0..num_nodes)
            .map(|i| Node::new(NodeId(i), format!("node-{i}"), 16, 64 * 1024, 0, &cfg.node))
            .collect();
        (tracker, nodes)
    }

    fn add_instance(
        tracker: &mut Tracker,
        nodes: &mut [Node],
        node_idx: usize,
        id: u64,
        status: InstanceStatus,
    ) {
        let mut instance = Instance::new(InstanceId(id), "func-0", 1, 0);
        instance.status = status;
        tracker.instances.push(InstanceRef {
            node: nodes[node_idx].id,
            instance: instance.id,
        });
        nodes[node_idx].instances.push(instance);
    }

    fn request(flow_id: u64) -> Request {
        Request::new(flow_id, "dag", "func-0", 1_000, 170, 0, 1.0, 900_000)
    }

    #[test]
    fn first_available_skips_busy_instances() {
        let (mut tracker, mut nodes) = fixture(1);
        add_instance(&mut tracker, &mut nodes, 0, 0, InstanceStatus::Terminating);
        add_instance(&mut tracker, &mut nodes, 0, 1, InstanceStatus::Unknown);
        add_instance(&mut tracker, &mut nodes, 0, 2, InstanceStatus::Idle);

        let cfg = SimConfig::default();
        assert!(dispatch_one(&tracker, request(0), &mut nodes, &cfg, 0).is_ok());
        assert_eq!(nodes[0].instances[2].status, InstanceStatus::Running);
    }

    #[test]
    fn first_available_fails_without_capacity() {
        let (mut tracker, mut nodes) = fixture(1);
        add_instance(&mut tracker, &mut nodes, 0, 0, InstanceStatus::Unknown);

        let cfg = SimConfig::default();
        let result = dispatch_one(&tracker, request(0), &mut nodes, &cfg, 0);
        assert!(result.is_err());
        // The request comes back intact.
        assert_eq!(result.unwrap_err().req_id, "0-func-0");
    }

    #[test]
    fn least_loaded_prefers_emptier_runqueue() {
        let (mut tracker, mut nodes) = fixture(2);
        add_instance(&mut tracker, &mut nodes, 0, 0, InstanceStatus::Idle);
        add_instance(&mut tracker, &mut nodes, 1, 1, InstanceStatus::Idle);
        // Node 0 has a backlog on its runqueue.
        nodes[0].runqueue.push_back(InstanceId(0));

        let mut cfg = SimConfig::default();
        cfg.policy.load_balance = LoadBalancePolicy::LeastLoaded;
        assert!(dispatch_one(&tracker, request(0), &mut nodes, &cfg, 0).is_ok());
        assert_eq!(nodes[1].instances[0].status, InstanceStatus::Running);
        assert_eq!(nodes[0].instances[0].status, InstanceStatus::Idle);
    }

    #[test]
    fn least_loaded_falls_back_to_first_available() {
        let (mut tracker, mut nodes) = fixture(2);
        add_instance(&mut tracker, &mut nodes, 0, 0, InstanceStatus::Unknown);
        add_instance(&mut tracker, &mut nodes, 1, 1, InstanceStatus::Idle);
        // The least-loaded node (0, empty runqueue) has no idle instance;
        // the fallback still places the request on node 1.
        nodes[1].runqueue.push_back(InstanceId(1));

        let mut cfg = SimConfig::default();
        cfg.policy.load_balance = LoadBalancePolicy::LeastLoaded;
        assert!(dispatch_one(&tracker, request(0), &mut nodes, &cfg, 0).is_ok());
        assert_eq!(nodes[1].instances[0].status, InstanceStatus::Running);
    }
}
