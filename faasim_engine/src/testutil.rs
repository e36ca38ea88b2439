//! Shared fixtures for the engine unit tests.

use std::collections::BTreeMap;

use rand::SeedableRng;
use rand::rngs::StdRng;

use faasim_common::config::SimConfig;

use crate::function::Function;
use crate::instance::InstanceIdGen;
use crate::records::RequestRecord;
use crate::state::{SimState, TickCtx};
use crate::throttler::{Tracker, TrackerMap};

/// Owned backing storage for a [`TickCtx`].
pub struct CtxParts {
    pub rng: StdRng,
    pub state: SimState,
    pub sink: Vec<RequestRecord>,
    pub functions: BTreeMap<String, Function>,
    pub ids: InstanceIdGen,
}

impl CtxParts {
    pub fn new(_cfg: &SimConfig) -> Self {
        let mut functions = BTreeMap::new();
        for name in ["func-0", "func-1", "f", "g"] {
            functions.insert(name.to_string(), Function::new(name, 1));
        }
        Self {
            rng: StdRng::seed_from_u64(42),
            state: SimState::new(BTreeMap::new()),
            sink: Vec::new(),
            functions,
            ids: InstanceIdGen::new(),
        }
    }
}

/// Borrow a tick context out of owned parts.
pub fn test_ctx<'a>(now: u64, cfg: &'a SimConfig, parts: &'a mut CtxParts) -> TickCtx<'a> {
    TickCtx {
        now,
        cfg,
        rng: &mut parts.rng,
        state: &mut parts.state,
        sink: &mut parts.sink,
        survival: None,
        functions: &parts.functions,
        ids: &mut parts.ids,
    }
}

/// Trackers for the given function names (vcpu 1, concurrency limit 1).
pub fn trackers_for(names: &[&str]) -> TrackerMap {
    names
        .iter()
        .map(|name| (name.to_string(), Tracker::new(Function::new(*name, 1))))
        .collect()
}
