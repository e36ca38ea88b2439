//! Result record schemas for the two output traces.

use serde::Serialize;

/// One drained request (row of `requests_<key>.csv`).
#[derive(Debug, Clone, Serialize)]
pub struct RequestRecord {
    pub req_id: String,
    pub flow_id: u64,
    pub dag: String,
    pub node: String,
    /// Worker kind hosting the final execution (`NormalVM`/`HarvestVM`).
    pub host: String,
    pub rps: f64,
    pub arrival_time: u64,
    pub start_time: Option<u64>,
    pub end_time: Option<u64>,
    pub cpu_time: u64,
    /// `end − arrival − duration`; `NaN` iff `failed`.
    pub latency: f64,
    pub function: String,
    pub duration: u64,
    pub memory: u64,
    pub survival_prob: f64,
    pub failed: bool,
}

/// One cluster metrics sample (row of `cluster_<key>.csv`).
#[derive(Debug, Clone, Serialize)]
pub struct ClusterRecord {
    pub rps: f64,
    pub timestamp: u64,
    pub actual_scale: u64,
    pub desired_scale: u64,
    pub running_instances: u64,
    pub active_instances: u64,
    pub existing_instances: u64,
    pub terminating_instances: u64,
    pub worker_cpu_avg: f64,
    pub worker_mem_avg: f64,
}
