//! TOML configuration loader with validation and CLI overrides.
//!
//! The configuration surface is a flat struct of sections with enumerated
//! keys. Keys are spelled SCREAMING_SNAKE_CASE in TOML; unknown keys are a
//! parse error. Every key can be overridden on the command line with
//! `--config.<section>.<KEY>=<value>` (booleans also accept the bare
//! `--config.<section>.<KEY>` and the negated `--noconfig.<section>.<KEY>`
//! forms).

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

// ─── Sections ───────────────────────────────────────────────────────

/// Tick sub-periods and observation delays of the control plane.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "SCREAMING_SNAKE_CASE", default)]
pub struct ClusterConfig {
    /// Node controller (CRI engine) pulling period [ms].
    pub cri_engine_pulling_period_milli: u64,
    /// Autoscaler evaluation period [ms].
    pub autoscaling_period_milli: u64,
    /// Scheduler placement period [ms]. Should not be shorter than the
    /// autoscaling period, otherwise placement races stale scales.
    pub scheduling_period_milli: u64,
    /// Cluster metrics sampling period [ms].
    pub monitoring_period_milli: u64,
    /// Constant addend on the reported memory usage [percentage points].
    pub memory_usage_offset: f64,
    /// Concurrency snapshot period [ms].
    pub update_concurrency_period_milli: u64,
    /// Ingress delay between released workflow requests [ms].
    pub network_delay_milli: u64,
    /// Queued-request dispatch period [ms].
    pub dispatch_period_milli: u64,
    /// Delay before a status change of an instance becomes visible [ms].
    pub discovery_delay_milli: u64,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            cri_engine_pulling_period_milli: 1,
            autoscaling_period_milli: 2_000,
            scheduling_period_milli: 5_000,
            monitoring_period_milli: 1_000,
            memory_usage_offset: 5.0,
            update_concurrency_period_milli: 1_000,
            network_delay_milli: 10,
            dispatch_period_milli: 1,
            discovery_delay_milli: 1,
        }
    }
}

/// Worker-node parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "SCREAMING_SNAKE_CASE", default)]
pub struct NodeConfig {
    /// Maximum number of instances hosted by one node.
    pub max_num_instances: usize,
    /// Idle instance footprint [MiB].
    pub instance_size_mib: u64,
    /// Accepted (currently not enforced as an extra cap on reconcile).
    pub instance_creation_concurrency: usize,
    /// Deletion budget per reconcile round.
    pub instance_deletion_concurrency: usize,
    /// Instance creation delay when the node hosts no running instance of
    /// the function [ms].
    pub cold_instance_creation_delay_milli: u64,
    /// Instance creation delay next to a running instance [ms].
    pub warm_instance_creation_delay_milli: u64,
    /// Per-job memory overhead on top of the request footprint [MiB].
    pub job_memory_overhead_mib: u64,
    /// Grace period before a terminating instance is evicted [s].
    pub instance_grace_period_sec: u64,
    /// Share of raw CPU time consumed by the infrastructure [0, 1).
    pub infra_cpu_overhead_ratio: f64,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            max_num_instances: 490,
            instance_size_mib: 200,
            instance_creation_concurrency: 1,
            instance_deletion_concurrency: 100,
            cold_instance_creation_delay_milli: 3_000,
            warm_instance_creation_delay_milli: 1_000,
            job_memory_overhead_mib: 50,
            instance_grace_period_sec: 30,
            infra_cpu_overhead_ratio: 0.0,
        }
    }
}

/// Harvest-VM fleet parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "SCREAMING_SNAKE_CASE", default)]
pub struct HarvestVmConfig {
    /// Whether the cluster maintains a Harvest-VM fleet at all.
    pub use_harvestvm: bool,
    /// Whether live core counts track the trace schedule.
    pub enable_harvest: bool,
    /// Latency of (re)spawning a Harvest VM [ms].
    pub harvestvm_spawn_latency_milli: u64,
    /// Notification period granted to hard-preempted instances [s].
    pub preemption_notification_sec: u64,
    /// Baseline hazard rate [1/s].
    pub base_hazard: f64,
    /// Period of the stochastic liveness draw [ms].
    pub survival_predict_period_milli: u64,
    /// Period of core-count adjustment against the trace [ms].
    pub harvest_period_milli: u64,
    /// Number of Harvest VMs maintained by the cluster.
    pub num_hvms: usize,
    /// Survival model artifact (step function over lifetime hours).
    pub survival_model_path: String,
    /// Cores table artifact (per-second core schedule keyed by VM hash).
    pub cores_table_path: String,
}

impl Default for HarvestVmConfig {
    fn default() -> Self {
        Self {
            use_harvestvm: false,
            enable_harvest: true,
            harvestvm_spawn_latency_milli: 10_000,
            preemption_notification_sec: 30,
            base_hazard: 0.42,
            survival_predict_period_milli: 500,
            harvest_period_milli: 500,
            num_hvms: 0,
            survival_model_path: "data/harvestvm/models/survival_model.json".into(),
            cores_table_path: "data/harvestvm/models/cores_table.json".into(),
        }
    }
}

/// KPA-style autoscaler parameters.
///
/// Window lengths are counted in concurrency samples (one sample per
/// `UPDATE_CONCURRENCY_PERIOD_MILLI`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "SCREAMING_SNAKE_CASE", default)]
pub struct AutoscalerConfig {
    /// Force panic mode on every evaluation.
    pub always_panic: bool,
    /// Short (panic) averaging window [samples].
    pub panic_window_sec: usize,
    /// Long (stable) averaging window [samples].
    pub stable_window_sec: usize,
    /// Upper clamp factor on the ready replica count.
    pub max_scale_up_rate: f64,
    /// Lower clamp divisor on the ready replica count.
    pub max_scale_down_rate: f64,
    /// Panic entry threshold on `panic_cc / ready` [%].
    pub panic_threshold_pct: f64,
}

impl Default for AutoscalerConfig {
    fn default() -> Self {
        Self {
            always_panic: true,
            panic_window_sec: 60,
            stable_window_sec: 600,
            max_scale_up_rate: 1_000.0,
            max_scale_down_rate: 2.0,
            panic_threshold_pct: 200.0,
        }
    }
}

/// Load-balance strategy used by the throttler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadBalancePolicy {
    /// Reserve on the first instance that accepts, in tracker order.
    FirstAvailable,
    /// Prefer an idle instance on the least-loaded node.
    LeastLoaded,
}

/// Request routing and duplicated-execution policies.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "SCREAMING_SNAKE_CASE", default)]
pub struct PolicyConfig {
    pub load_balance: LoadBalancePolicy,
    /// Fire late-flow requests twice.
    pub dup_execution: bool,
    /// Flow completion rate at which duplication kicks in [0, 1].
    pub dup_execution_threshold: f64,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            load_balance: LoadBalancePolicy::FirstAvailable,
            dup_execution: false,
            dup_execution_threshold: 0.5,
        }
    }
}

/// Per-request limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "SCREAMING_SNAKE_CASE", default)]
pub struct RequestConfig {
    /// Duration cap applied at request construction [s].
    pub max_duration_sec: u64,
}

impl Default for RequestConfig {
    fn default() -> Self {
        Self {
            max_duration_sec: 60 * 15,
        }
    }
}

// ─── Top-Level Config ───────────────────────────────────────────────

/// Complete simulator configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct SimConfig {
    pub cluster: ClusterConfig,
    pub node: NodeConfig,
    pub harvestvm: HarvestVmConfig,
    pub autoscaler: AutoscalerConfig,
    pub policy: PolicyConfig,
    pub request: RequestConfig,
}

impl SimConfig {
    /// Load from a TOML file, or start from defaults when `path` is `None`.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let config = match path {
            None => Self::default(),
            Some(path) => {
                let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
                    path: path.to_path_buf(),
                    source,
                })?;
                toml::from_str(&text)?
            }
        };
        Ok(config)
    }

    /// Validate parameter bounds. Called after overrides are applied.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let periods = [
            ("cluster.CRI_ENGINE_PULLING_PERIOD_MILLI", self.cluster.cri_engine_pulling_period_milli),
            ("cluster.AUTOSCALING_PERIOD_MILLI", self.cluster.autoscaling_period_milli),
            ("cluster.SCHEDULING_PERIOD_MILLI", self.cluster.scheduling_period_milli),
            ("cluster.MONITORING_PERIOD_MILLI", self.cluster.monitoring_period_milli),
            ("cluster.UPDATE_CONCURRENCY_PERIOD_MILLI", self.cluster.update_concurrency_period_milli),
            ("cluster.NETWORK_DELAY_MILLI", self.cluster.network_delay_milli),
            ("cluster.DISPATCH_PERIOD_MILLI", self.cluster.dispatch_period_milli),
            ("harvestvm.SURVIVAL_PREDICT_PERIOD_MILLI", self.harvestvm.survival_predict_period_milli),
            ("harvestvm.HARVEST_PERIOD_MILLI", self.harvestvm.harvest_period_milli),
        ];
        for (key, value) in periods {
            if value == 0 {
                return Err(ConfigError::Validation(format!("{key} must be > 0")));
            }
        }

        if self.node.max_num_instances == 0 {
            return Err(ConfigError::Validation(
                "node.MAX_NUM_INSTANCES must be > 0".into(),
            ));
        }
        if !(0.0..1.0).contains(&self.node.infra_cpu_overhead_ratio) {
            return Err(ConfigError::Validation(format!(
                "node.INFRA_CPU_OVERHEAD_RATIO {} out of range [0, 1)",
                self.node.infra_cpu_overhead_ratio
            )));
        }
        if self.autoscaler.panic_window_sec == 0
            || self.autoscaler.stable_window_sec < self.autoscaler.panic_window_sec
        {
            return Err(ConfigError::Validation(format!(
                "autoscaler windows invalid: panic={} stable={}",
                self.autoscaler.panic_window_sec, self.autoscaler.stable_window_sec
            )));
        }
        if self.autoscaler.max_scale_up_rate < 1.0 || self.autoscaler.max_scale_down_rate < 1.0 {
            return Err(ConfigError::Validation(
                "autoscaler scale rates must be >= 1".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.policy.dup_execution_threshold) {
            return Err(ConfigError::Validation(format!(
                "policy.DUP_EXECUTION_THRESHOLD {} out of range [0, 1]",
                self.policy.dup_execution_threshold
            )));
        }
        if self.request.max_duration_sec == 0 {
            return Err(ConfigError::Validation(
                "request.MAX_DURATION_SEC must be > 0".into(),
            ));
        }
        Ok(())
    }

    /// Apply a single `--config.<section>.<KEY>` override.
    pub fn apply_override(&mut self, ov: &ConfigOverride) -> Result<(), ConfigError> {
        let full = format!("{}.{}", ov.section, ov.key);

        fn num<T: std::str::FromStr>(key: &str, ov: &ConfigOverride) -> Result<T, ConfigError> {
            let value = ov
                .value
                .as_deref()
                .ok_or_else(|| ConfigError::BadOverrideValue {
                    key: key.into(),
                    value: "<missing>".into(),
                })?;
            value.parse().map_err(|_| ConfigError::BadOverrideValue {
                key: key.into(),
                value: value.into(),
            })
        }

        fn boolean(key: &str, ov: &ConfigOverride) -> Result<bool, ConfigError> {
            if ov.negated {
                return Ok(false);
            }
            match ov.value.as_deref() {
                None => Ok(true),
                Some("true") | Some("1") => Ok(true),
                Some("false") | Some("0") => Ok(false),
                Some(other) => Err(ConfigError::BadOverrideValue {
                    key: key.into(),
                    value: other.into(),
                }),
            }
        }

        match (ov.section.as_str(), ov.key.as_str()) {
            ("cluster", "CRI_ENGINE_PULLING_PERIOD_MILLI") => {
                self.cluster.cri_engine_pulling_period_milli = num(&full, ov)?;
            }
            ("cluster", "AUTOSCALING_PERIOD_MILLI") => {
                self.cluster.autoscaling_period_milli = num(&full, ov)?;
            }
            ("cluster", "SCHEDULING_PERIOD_MILLI") => {
                self.cluster.scheduling_period_milli = num(&full, ov)?;
            }
            ("cluster", "MONITORING_PERIOD_MILLI") => {
                self.cluster.monitoring_period_milli = num(&full, ov)?;
            }
            ("cluster", "MEMORY_USAGE_OFFSET") => {
                self.cluster.memory_usage_offset = num(&full, ov)?;
            }
            ("cluster", "UPDATE_CONCURRENCY_PERIOD_MILLI") => {
                self.cluster.update_concurrency_period_milli = num(&full, ov)?;
            }
            ("cluster", "NETWORK_DELAY_MILLI") => {
                self.cluster.network_delay_milli = num(&full, ov)?;
            }
            ("cluster", "DISPATCH_PERIOD_MILLI") => {
                self.cluster.dispatch_period_milli = num(&full, ov)?;
            }
            ("cluster", "DISCOVERY_DELAY_MILLI") => {
                self.cluster.discovery_delay_milli = num(&full, ov)?;
            }

            ("node", "MAX_NUM_INSTANCES") => self.node.max_num_instances = num(&full, ov)?,
            ("node", "INSTANCE_SIZE_MIB") => self.node.instance_size_mib = num(&full, ov)?,
            ("node", "INSTANCE_CREATION_CONCURRENCY") => {
                self.node.instance_creation_concurrency = num(&full, ov)?;
            }
            ("node", "INSTANCE_DELETION_CONCURRENCY") => {
                self.node.instance_deletion_concurrency = num(&full, ov)?;
            }
            ("node", "COLD_INSTANCE_CREATION_DELAY_MILLI") => {
                self.node.cold_instance_creation_delay_milli = num(&full, ov)?;
            }
            ("node", "WARM_INSTANCE_CREATION_DELAY_MILLI") => {
                self.node.warm_instance_creation_delay_milli = num(&full, ov)?;
            }
            ("node", "JOB_MEMORY_OVERHEAD_MIB") => {
                self.node.job_memory_overhead_mib = num(&full, ov)?;
            }
            ("node", "INSTANCE_GRACE_PERIOD_SEC") => {
                self.node.instance_grace_period_sec = num(&full, ov)?;
            }
            ("node", "INFRA_CPU_OVERHEAD_RATIO") => {
                self.node.infra_cpu_overhead_ratio = num(&full, ov)?;
            }

            ("harvestvm", "USE_HARVESTVM") => self.harvestvm.use_harvestvm = boolean(&full, ov)?,
            ("harvestvm", "ENABLE_HARVEST") => {
                self.harvestvm.enable_harvest = boolean(&full, ov)?;
            }
            ("harvestvm", "HARVESTVM_SPAWN_LATENCY_MILLI") => {
                self.harvestvm.harvestvm_spawn_latency_milli = num(&full, ov)?;
            }
            ("harvestvm", "PREEMPTION_NOTIFICATION_SEC") => {
                self.harvestvm.preemption_notification_sec = num(&full, ov)?;
            }
            ("harvestvm", "BASE_HAZARD") => self.harvestvm.base_hazard = num(&full, ov)?,
            ("harvestvm", "SURVIVAL_PREDICT_PERIOD_MILLI") => {
                self.harvestvm.survival_predict_period_milli = num(&full, ov)?;
            }
            ("harvestvm", "HARVEST_PERIOD_MILLI") => {
                self.harvestvm.harvest_period_milli = num(&full, ov)?;
            }
            ("harvestvm", "NUM_HVMS") => self.harvestvm.num_hvms = num(&full, ov)?,
            ("harvestvm", "SURVIVAL_MODEL_PATH") => {
                self.harvestvm.survival_model_path = required(&full, ov)?;
            }
            ("harvestvm", "CORES_TABLE_PATH") => {
                self.harvestvm.cores_table_path = required(&full, ov)?;
            }

            ("autoscaler", "ALWAYS_PANIC") => self.autoscaler.always_panic = boolean(&full, ov)?,
            ("autoscaler", "PANIC_WINDOW_SEC") => {
                self.autoscaler.panic_window_sec = num(&full, ov)?;
            }
            ("autoscaler", "STABLE_WINDOW_SEC") => {
                self.autoscaler.stable_window_sec = num(&full, ov)?;
            }
            ("autoscaler", "MAX_SCALE_UP_RATE") => {
                self.autoscaler.max_scale_up_rate = num(&full, ov)?;
            }
            ("autoscaler", "MAX_SCALE_DOWN_RATE") => {
                self.autoscaler.max_scale_down_rate = num(&full, ov)?;
            }
            ("autoscaler", "PANIC_THRESHOLD_PCT") => {
                self.autoscaler.panic_threshold_pct = num(&full, ov)?;
            }

            ("policy", "LOAD_BALANCE") => {
                self.policy.load_balance = match ov.value.as_deref() {
                    Some("first_available") => LoadBalancePolicy::FirstAvailable,
                    Some("least_loaded") => LoadBalancePolicy::LeastLoaded,
                    other => {
                        return Err(ConfigError::BadOverrideValue {
                            key: full,
                            value: other.unwrap_or("<missing>").into(),
                        });
                    }
                };
            }
            ("policy", "DUP_EXECUTION") => self.policy.dup_execution = boolean(&full, ov)?,
            ("policy", "DUP_EXECUTION_THRESHOLD") => {
                self.policy.dup_execution_threshold = num(&full, ov)?;
            }

            ("request", "MAX_DURATION_SEC") => self.request.max_duration_sec = num(&full, ov)?,

            _ => return Err(ConfigError::UnknownOverride(full)),
        }
        Ok(())
    }
}

fn required(key: &str, ov: &ConfigOverride) -> Result<String, ConfigError> {
    ov.value.clone().ok_or_else(|| ConfigError::BadOverrideValue {
        key: key.into(),
        value: "<missing>".into(),
    })
}

// ─── CLI Override Extraction ────────────────────────────────────────

/// One parsed `--config.<section>.<KEY>[=value]` token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigOverride {
    pub section: String,
    pub key: String,
    pub value: Option<String>,
    /// Came from the `--noconfig.` form (boolean false).
    pub negated: bool,
}

/// Split override tokens from the raw argument list.
///
/// Returns the remaining arguments (for the regular CLI parser) and the
/// extracted overrides, in order of appearance. Malformed override paths
/// (fewer than two dots) are an error.
pub fn extract_overrides(
    args: impl IntoIterator<Item = String>,
) -> Result<(Vec<String>, Vec<ConfigOverride>), ConfigError> {
    let mut rest = Vec::new();
    let mut overrides = Vec::new();

    for arg in args {
        let (negated, path) = if let Some(path) = arg.strip_prefix("--config.") {
            (false, path)
        } else if let Some(path) = arg.strip_prefix("--noconfig.") {
            (true, path)
        } else {
            rest.push(arg);
            continue;
        };

        let (path, value) = match path.split_once('=') {
            Some((path, value)) => (path, Some(value.to_string())),
            None => (path, None),
        };
        let Some((section, key)) = path.split_once('.') else {
            return Err(ConfigError::UnknownOverride(path.to_string()));
        };
        overrides.push(ConfigOverride {
            section: section.to_string(),
            key: key.to_string(),
            value,
            negated,
        });
    }
    Ok((rest, overrides))
}

// ─── Tests ──────────────────────────────────────────────────────────
