//! Function metadata and invocation records.

use rand::Rng;
use rand::rngs::StdRng;

/// Base system tax on request completion [ms].
pub const SYSTEM_TAX_MILLI: u64 = 5;

/// Latency tax charged when a request leaves its instance, growing with
/// the CPU pressure on the node: `U[5, 5·(100+cpu%)/100]` ms inclusive.
pub fn system_tax(rng: &mut StdRng, node_cpu_utilization: f64) -> u64 {
    let hi = (SYSTEM_TAX_MILLI as f64 * (100.0 + node_cpu_utilization) / 100.0) as u64;
    rng.gen_range(SYSTEM_TAX_MILLI..=hi.max(SYSTEM_TAX_MILLI))
}

/// A registered function. Immutable after registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Function {
    pub name: String,
    pub vcpu: u32,
    pub concurrency_limit: u32,
}

impl Function {
    pub fn new(name: impl Into<String>, vcpu: u32) -> Self {
        Self {
            name: name.into(),
            vcpu,
            concurrency_limit: 1,
        }
    }
}

/// One function invocation travelling through the control plane.
///
/// `req_id` is `"<flow_id>-<dest>"`; duplicated-execution replicas share
/// it. Progress accounting: `total_cputime` accumulates whenever the
/// request holds cores, via `last_run_ts`.
#[derive(Debug, Clone)]
pub struct Request {
    pub req_id: String,
    pub flow_id: u64,
    pub dag_name: String,
    /// Destination function name.
    pub dest: String,
    pub duration_milli: u64,
    pub memory_mib: u64,
    pub rps: f64,
    pub arrival_time: u64,
    pub start_time: Option<u64>,
    pub end_time: Option<u64>,
    pub total_cputime: u64,
    pub last_run_ts: Option<u64>,
    pub is_running: bool,
    pub failed: bool,
    pub num_replicas: u32,
}

impl Request {
    /// Build a request; `duration_milli` is capped by `max_duration_milli`.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        flow_id: u64,
        dag_name: &str,
        dest: &str,
        duration_milli: u64,
        memory_mib: u64,
        arrival_time: u64,
        rps: f64,
        max_duration_milli: u64,
    ) -> Self {
        Self {
            req_id: format!("{flow_id}-{dest}"),
            flow_id,
            dag_name: dag_name.to_string(),
            dest: dest.to_string(),
            duration_milli: duration_milli.min(max_duration_milli),
            memory_mib,
            rps,
            arrival_time,
            start_time: None,
            end_time: None,
            total_cputime: 0,
            last_run_ts: None,
            is_running: false,
            failed: false,
            num_replicas: 1,
        }
    }

    /// Begin (or resume) execution on granted cores.
    ///
    /// `start_time` survives halts: it is only set on the first start.
    pub fn start(&mut self, now: u64) {
        if self.start_time.is_none() {
            self.start_time = Some(now);
        }
        self.last_run_ts = Some(now);
        self.is_running = true;
    }

    /// Account CPU progress up to `now` and return the residual work [ms].
    pub fn advance(&mut self, now: u64) -> i64 {
        assert!(self.is_running, "advancing a request that is not running");
        let last = self.last_run_ts.expect("running request without last_run_ts");
        self.total_cputime += now - last;
        self.last_run_ts = Some(now);
        self.duration_milli as i64 - self.total_cputime as i64
    }

    /// Finish execution at `now` plus the system tax. A request that never
    /// started or did not accumulate its full duration was preempted and
    /// counts as failed.
    pub fn finish(&mut self, now: u64, tax: u64) {
        self.end_time = Some(now + tax);
        if self.start_time.is_none() || self.total_cputime < self.duration_milli {
            self.failed = true;
        }
        self.is_running = false;
    }

    /// End-to-end latency above the pure function duration. `NaN` for
    /// failed requests.
    pub fn latency(&self) -> f64 {
        match (self.end_time, self.failed) {
            (Some(end), false) => end as f64 - self.arrival_time as f64 - self.duration_milli as f64,
            _ => f64::NAN,
        }
    }
}
