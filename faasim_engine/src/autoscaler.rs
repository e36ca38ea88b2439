//! KPA-style two-window autoscaler.
//!
//! Per function, a short (panic) and a long (stable) uniform average over
//! the tracker's concurrency history drive the desired replica count. The
//! scaler panics when the short-window load per ready replica crosses the
//! threshold, when the history is shorter than the stable window, or when
//! a cold function sees traffic; the result is clamped by the up/down
//! scale rates, with scale-to-zero protection while the window still holds
//! traffic.

use std::collections::BTreeMap;

use tracing::{debug, info};

use faasim_common::config::AutoscalerConfig;

use crate::function::{Function, Request};
use crate::node::Node;
use crate::throttler::TrackerMap;

/// Averaging-window selection mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScalerMode {
    Stable,
    Panic,
}

/// Per-function scaling decision state.
#[derive(Debug)]
pub struct Scaler {
    pub func: String,
    pub desired_scale: u64,
    pub actual_scale: u64,
    pub mode: ScalerMode,
}

impl Scaler {
    fn new(func: &str) -> Self {
        Self {
            func: func.to_string(),
            desired_scale: 0,
            actual_scale: 0,
            mode: ScalerMode::Panic,
        }
    }
}

/// Uniform average over the last `window` samples (no bucketing, no
/// exponential decay).
fn observed_cc(concurrencies: &[i64], window: usize) -> f64 {
    let window = window.min(concurrencies.len()).max(1);
    let sum: i64 = concurrencies[concurrencies.len() - window..].iter().sum();
    sum as f64 / window as f64
}

#[derive(Debug)]
pub struct Autoscaler {
    pub scalers: BTreeMap<String, Scaler>,
}

impl Autoscaler {
    pub fn new(functions: &[Function]) -> Self {
        let scalers = functions
            .iter()
            .map(|f| (f.name.clone(), Scaler::new(&f.name)))
            .collect();
        Self { scalers }
    }

    /// Immediate evaluation restricted to the request's destination
    /// (fired synchronously on cold starts).
    pub fn poke(
        &mut self,
        request: &Request,
        trackers: &TrackerMap,
        nodes: &[Node],
        cfg: &AutoscalerConfig,
        now: u64,
    ) {
        self.evaluate(Some(&request.dest), trackers, nodes, cfg, now);
    }

    /// Evaluate the desired scale of every function (or `only` one).
    pub fn evaluate(
        &mut self,
        only: Option<&str>,
        trackers: &TrackerMap,
        nodes: &[Node],
        cfg: &AutoscalerConfig,
        now: u64,
    ) {
        for (func, tracker) in trackers {
            if only.is_some_and(|target| target != func) {
                continue;
            }

            let concurrencies = &tracker.concurrencies;
            let actual_scale = tracker.get_scale(nodes) as u64;
            let ready = actual_scale.max(1) as f64;
            let cc_target = tracker.function.concurrency_limit as f64;

            let max_up_scale = (cfg.max_scale_up_rate * ready).ceil() as u64;
            let max_down_scale = (ready / cfg.max_scale_down_rate).floor() as u64;

            let panic_cc = observed_cc(concurrencies, cfg.panic_window_sec);
            let stable_cc = observed_cc(concurrencies, cfg.stable_window_sec);

            let mut over_panic_threshold =
                panic_cc / ready >= cfg.panic_threshold_pct / 100.0;
            if cfg.always_panic || (panic_cc > 0.0 && actual_scale == 0) {
                // Cold functions stay in panic.
                over_panic_threshold = true;
            }

            let (mode, mut desired_scale, window) =
                if over_panic_threshold || concurrencies.len() < cfg.stable_window_sec {
                    (
                        ScalerMode::Panic,
                        (panic_cc / cc_target).ceil() as u64,
                        cfg.panic_window_sec,
                    )
                } else {
                    (
                        ScalerMode::Stable,
                        (stable_cc / cc_target).ceil() as u64,
                        cfg.stable_window_sec,
                    )
                };
            desired_scale = desired_scale.clamp(max_down_scale, max_up_scale);

            if desired_scale == 0 {
                // The last replica only goes away once the window saw no
                // traffic at all.
                let window = window.min(concurrencies.len());
                let in_window: i64 = concurrencies[concurrencies.len() - window..].iter().sum();
                if in_window > 0 {
                    desired_scale = 1;
                }
            }

            let scaler = self.scalers.get_mut(func).expect("unregistered scaler");
            if scaler.desired_scale != desired_scale {
                if scaler.desired_scale == 0 {
                    debug!(clock = now, func = %func, "cold start scale-up");
                }
                info!(
                    clock = now,
                    func = %func,
                    from = scaler.desired_scale,
                    to = desired_scale,
                    "desired scale changed"
                );
            }
            scaler.mode = mode;
            scaler.desired_scale = desired_scale;
            scaler.actual_scale = actual_scale;
        }
    }
}

// ─── Tests ──────────────────────────────────────────────────────────
