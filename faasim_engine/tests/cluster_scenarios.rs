//! End-to-end scenarios over the full tick pipeline.

use std::collections::BTreeMap;

use faasim_common::config::SimConfig;
use faasim_common::harvestvm::{CoresTable, SurvivalModel};
use faasim_common::workload::generate_balanced_dag;
use faasim_engine::cluster::{Cluster, HvmModels};
use faasim_engine::function::Function;
use faasim_engine::loadgen::{drain, drive_arrivals, functions_from_dags, root_requests};

/// Control-plane cadences tightened so scenarios resolve in a few
/// thousand virtual milliseconds.
fn quick_cfg() -> SimConfig {
    let mut cfg = SimConfig::default();
    cfg.cluster.autoscaling_period_milli = 100;
    cfg.cluster.scheduling_period_milli = 100;
    cfg.cluster.update_concurrency_period_milli = 100;
    cfg.node.cold_instance_creation_delay_milli = 200;
    cfg.node.warm_instance_creation_delay_milli = 100;
    cfg
}

fn dag_cluster(cfg: SimConfig, width: usize, depth: usize, duration: u64) -> Cluster {
    let dag = generate_balanced_dag("gen_dag", width, depth, duration, 170).unwrap();
    let functions = functions_from_dags([&dag]);
    let mut dags = BTreeMap::new();
    dags.insert("gen_dag".to_string(), dag);
    Cluster::with_seed(cfg, functions, dags, 42)
}

fn inject_flow(cluster: &mut Cluster, flow_id: u64) {
    cluster.add_flow(flow_id, "gen_dag");
    let now = cluster.now();
    let requests = root_requests(flow_id, &cluster.state.dags["gen_dag"], 2.0, now, &cluster.cfg);
    for request in requests {
        cluster.ingress_accept(request);
    }
}

#[test]
fn fan_out_flows_account_every_node() {
    let mut cluster = dag_cluster(quick_cfg(), 3, 1, 100);
    cluster.add_node("node-0", 16, 64 * 1024);
    cluster.set_rps(2.0);

    let total_flows = 5u64;
    let arrivals: Vec<u64> = (0..total_flows).map(|i| i * 500).collect();
    drive_arrivals(&mut cluster, &arrivals, |cluster, idx| {
        inject_flow(cluster, idx as u64);
    });
    assert!(drain(&mut cluster, 600_000));

    // width=3, depth=1: root + 3 stages + join = 5 nodes per flow.
    let nodes_per_flow = cluster.state.dags["gen_dag"].num_nodes() as u64;
    assert_eq!(nodes_per_flow, 5);
    assert_eq!(cluster.sink.len(), (total_flows * nodes_per_flow) as usize);
    assert!(cluster.sink.iter().all(|r| !r.failed));
    assert!(cluster.state.flows.is_empty());

    // Every request finished exactly once.
    let mut req_ids: Vec<&str> = cluster.sink.iter().map(|r| r.req_id.as_str()).collect();
    req_ids.sort_unstable();
    req_ids.dedup();
    assert_eq!(req_ids.len(), cluster.sink.len());
}

#[test]
fn cold_start_latency_dominates_the_first_flow() {
    let mut cluster = dag_cluster(quick_cfg(), 1, 1, 100);
    cluster.add_node("node-0", 16, 64 * 1024);

    let arrivals = vec![0u64];
    drive_arrivals(&mut cluster, &arrivals, |cluster, idx| {
        inject_flow(cluster, idx as u64);
    });
    assert!(drain(&mut cluster, 600_000));

    let root = cluster
        .sink
        .iter()
        .find(|r| r.function == "F0")
        .expect("root record missing");
    let cold_floor = cluster.cfg.node.cold_instance_creation_delay_milli as f64;
    assert!(
        root.latency >= cold_floor,
        "cold root latency {} below {}",
        root.latency,
        cold_floor
    );
}

#[test]
fn duplicated_execution_fires_late_requests_twice() {
    let mut cfg = quick_cfg();
    cfg.policy.dup_execution = true;
    cfg.policy.dup_execution_threshold = 0.5;

    // Chain F0 -> F1 -> F2 -> F3: the last two stages pass the threshold.
    let mut cluster = dag_cluster(cfg, 1, 2, 1_000);
    cluster.add_node("node-0", 16, 64 * 1024);

    let arrivals = vec![0u64];
    drive_arrivals(&mut cluster, &arrivals, |cluster, idx| {
        inject_flow(cluster, idx as u64);
    });
    assert!(drain(&mut cluster, 600_000));

    let count = |req_id: &str| cluster.sink.iter().filter(|r| r.req_id == req_id).count();
    assert_eq!(count("0-F0"), 1);
    assert_eq!(count("0-F1"), 1);
    // The first stage past the threshold runs both replicas to completion
    // (the flow stays live between them).
    assert_eq!(count("0-F2"), 2);
    // The terminal stage fires twice as well, but a trailing replica may
    // be cut off by cluster quiescence once the flow has settled.
    assert!((1..=2).contains(&count("0-F3")));
    assert!(cluster.sink.iter().all(|r| !r.failed));
    assert!(cluster.state.flows.is_empty());
}

#[test]
fn sustained_overload_drives_the_scale_up() {
    let mut cfg = quick_cfg();
    cfg.node.max_num_instances = 50;
    let functions = vec![Function::new("func-0", 1)];
    let mut cluster = Cluster::with_seed(cfg, functions, BTreeMap::new(), 42);
    cluster.add_node("node-0", 2, 64 * 1024);
    cluster.set_rps(10.0);

    // 10 rps against a 2-core worker running 2-second functions.
    let arrivals: Vec<u64> = (0..40).map(|i| i * 100).collect();
    drive_arrivals(&mut cluster, &arrivals, |cluster, idx| {
        let now = cluster.now();
        cluster.ingress_accept(faasim_engine::function::Request::new(
            idx as u64, "", "func-0", 2_000, 170, now, 10.0, 900_000,
        ));
    });

    // The backlog pushed the desired scale well past the core count.
    assert!(
        cluster.autoscaler.scalers["func-0"].desired_scale >= 2,
        "desired scale stayed at {}",
        cluster.autoscaler.scalers["func-0"].desired_scale
    );

    assert!(drain(&mut cluster, 600_000));
    assert_eq!(cluster.sink.len(), 40);
    assert!(cluster.sink.iter().all(|r| !r.failed));
}

#[test]
fn harvest_shrink_under_load_preserves_requests() {
    let mut cfg = quick_cfg();
    cfg.harvestvm.use_harvestvm = true;
    cfg.harvestvm.enable_harvest = true;
    cfg.harvestvm.num_hvms = 1;

    let functions = vec![Function::new("func-0", 1)];
    let mut cluster = Cluster::with_seed(cfg, functions, BTreeMap::new(), 42);

    let mut entries = BTreeMap::new();
    // 16 cores for two seconds, a deep dip, then recovery.
    entries.insert("h1".to_string(), vec![16, 16, 2, 2, 2, 16]);
    cluster.enable_harvest_fleet(
        HvmModels {
            survival: Some(SurvivalModel::immortal()),
            cores: CoresTable::new(entries).unwrap(),
        },
        None,
    );
    cluster.set_rps(4.0);

    // Four 5-second requests keep instances on the cores through the dip.
    let arrivals: Vec<u64> = (0..4).map(|i| i * 50).collect();
    drive_arrivals(&mut cluster, &arrivals, |cluster, idx| {
        let now = cluster.now();
        cluster.ingress_accept(faasim_engine::function::Request::new(
            idx as u64, "", "func-0", 5_000, 170, now, 4.0, 900_000,
        ));
    });
    assert!(drain(&mut cluster, 600_000));

    // Soft preemption re-queued work without failing or double-draining.
    assert_eq!(cluster.sink.len(), 4);
    assert!(cluster.sink.iter().all(|r| !r.failed));
    assert!(cluster.sink.iter().all(|r| r.host == "HarvestVM"));
    let mut req_ids: Vec<&str> = cluster.sink.iter().map(|r| r.req_id.as_str()).collect();
    req_ids.sort_unstable();
    req_ids.dedup();
    assert_eq!(req_ids.len(), 4);
}

#[test]
fn harvest_vm_death_fails_inflight_flows() {
    let mut cfg = quick_cfg();
    cfg.harvestvm.use_harvestvm = true;
    cfg.harvestvm.enable_harvest = false;
    cfg.harvestvm.num_hvms = 1;
    cfg.harvestvm.survival_predict_period_milli = 1_000;

    let mut cluster = dag_cluster(cfg, 1, 1, 10_000);
    let mut entries = BTreeMap::new();
    entries.insert("h1".to_string(), vec![16]);
    // Survival collapses to zero after ~1.8 virtual seconds.
    let survival = SurvivalModel::new(vec![(0.0005, 0.0)]).unwrap();
    cluster.enable_harvest_fleet(
        HvmModels {
            survival: Some(survival),
            cores: CoresTable::new(entries).unwrap(),
        },
        None,
    );

    let arrivals = vec![0u64];
    drive_arrivals(&mut cluster, &arrivals, |cluster, idx| {
        inject_flow(cluster, idx as u64);
    });
    assert!(drain(&mut cluster, 60_000));

    // The long root request was hard-preempted by the dying VM.
    let failed: Vec<_> = cluster.sink.iter().filter(|r| r.failed).collect();
    assert!(!failed.is_empty());
    assert!(failed.iter().all(|r| r.latency.is_nan()));
    assert!(failed.iter().all(|r| r.host == "HarvestVM"));
    assert_eq!(failed[0].survival_prob, 0.0);
    // The owning flow was deleted outright.
    assert!(cluster.state.flows.is_empty());
}
