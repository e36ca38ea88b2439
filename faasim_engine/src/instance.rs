//! Function instances (replicas).
//!
//! An instance hosts at most one request at a time (its breaker has
//! capacity 1). The behavioral half of the lifecycle lives on
//! [`crate::node::Node`], which owns the instances and the CPU registry
//! they book cores from.

use crate::breaker::Breaker;
use crate::function::Request;

/// Process-unique instance identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct InstanceId(pub u64);

/// Hands out instance identifiers. Owned by the cluster; threaded through
/// the node reconcilers.
#[derive(Debug, Default)]
pub struct InstanceIdGen {
    next: u64,
}

impl InstanceIdGen {
    pub fn new() -> Self {
        Self { next: 0 }
    }

    pub fn next(&mut self) -> InstanceId {
        let id = InstanceId(self.next);
        self.next += 1;
        id
    }
}

/// Instance lifecycle status.
///
/// `Unknown` models the discovery delay of the control plane: a fresh or
/// just-emptied instance is not routable until the delay elapses.
/// `Halted` is reserved by the lifecycle model; soft preemption currently
/// leaves instances `Running` on the node runqueue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum InstanceStatus {
    Unknown = 0,
    Idle = 1,
    Halted = 2,
    Running = 3,
    Terminating = 4,
}

impl InstanceStatus {
    /// Convert from raw `u8`. Returns `None` for invalid values.
    #[inline]
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Unknown),
            1 => Some(Self::Idle),
            2 => Some(Self::Halted),
            3 => Some(Self::Running),
            4 => Some(Self::Terminating),
            _ => None,
        }
    }
}

/// One replica of a function on a node.
#[derive(Debug, Clone)]
pub struct Instance {
    pub id: InstanceId,
    /// Name of the hosted function.
    pub func: String,
    pub vcpu: u32,
    /// Time at which the instance becomes available (creation delay done).
    pub start_time: u64,
    pub status: InstanceStatus,
    /// Eviction deadline while `Terminating`.
    pub deadline: Option<u64>,
    /// Last status-change checkpoint for discovery.
    pub discovery_ckp: u64,
    /// Local request slot.
    pub breaker: Breaker<Request>,
}

impl Instance {
    pub fn new(id: InstanceId, func: &str, vcpu: u32, start_time: u64) -> Self {
        Self {
            id,
            func: func.to_string(),
            vcpu,
            start_time,
            status: InstanceStatus::Unknown,
            deadline: None,
            discovery_ckp: start_time,
            breaker: Breaker::new(format!("Instance {func}"), 1),
        }
    }

    /// The request currently hosted, if any.
    #[inline]
    pub fn hosted_job(&self) -> Option<&Request> {
        self.breaker.first()
    }

    #[inline]
    pub fn hosted_job_mut(&mut self) -> Option<&mut Request> {
        self.breaker.first_mut()
    }

    /// Counts towards the tracker's scale (everything but `Unknown` and
    /// `Terminating`).
    #[inline]
    pub fn is_ready(&self) -> bool {
        matches!(self.status, InstanceStatus::Running | InstanceStatus::Idle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_instance_is_undiscovered() {
        let instance = Instance::new(InstanceId(7), "func-0", 2, 1_000);
        assert_eq!(instance.status, InstanceStatus::Unknown);
        assert_eq!(instance.discovery_ckp, 1_000);
        assert!(instance.hosted_job().is_none());
        assert!(!instance.is_ready());
    }

    #[test]
    fn status_round_trip() {
        for raw in 0..=4u8 {
            let status = InstanceStatus::from_u8(raw).unwrap();
            assert_eq!(status as u8, raw);
        }
        assert!(InstanceStatus::from_u8(5).is_none());
    }

    #[test]
    fn id_gen_is_sequential() {
        let mut r#gen = InstanceIdGen::new();
        assert_eq!(r#gen.next(), InstanceId(0));
        assert_eq!(r#gen.next(), InstanceId(1));
    }
}
