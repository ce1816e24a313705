//! Per-part analysis output consumed by the code emitter.
//!
//! [`BackendData`] is pure data: every semantic decision the emitter acts on
//! is recorded here by the digest and the connection planner, so emission
//! itself is a mechanical translation.

use serde::{Deserialize, Serialize};

use crate::eqset::{ResolveStep, VariableKey};
use crate::expr::Expr;

/// Edge kind monitored by an event target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TriggerEdge {
    Rise,
    Fall,
    Change,
    Nonzero,
}

/// Delay applied between trigger and delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EventDelay {
    /// Deliver during the same cycle's finalize.
    None,
    /// Constant delay in simulated time (seconds).
    Constant(f64),
    /// Delay computed at trigger time.
    Expression(Expr),
}

/// A monitored condition with its latch assignment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventTarget {
    /// Position among the part's event targets; also names `event_time#`.
    pub value_index: usize,
    pub edge: TriggerEdge,
    pub condition: Expr,
    pub delay: EventDelay,
    /// Auxiliary variable storing the previous test value, when the edge
    /// needs one and no stored variable already carries it.
    pub tracking_variable: Option<VariableKey>,
    /// Bit in the instance flags word used as the delivery latch.
    pub latch_bit: u32,
    /// True when delivery may need an `event_time` stamp to disambiguate
    /// retriggering within one cycle.
    pub timestamped: bool,
}

/// A part location that scans monitored instances during finalize.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventSource {
    /// Absolute path of the part whose instances are monitored.
    pub monitored_part: Vec<String>,
    /// Index of the event target within the monitored part.
    pub target_index: usize,
    /// Deliver as a latch-only spike (downstream work happens next step).
    pub latch_only: bool,
}

/// How a connection enumerates candidates at one endpoint binding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionHolder {
    pub index: usize,
    /// `$k`: number of nearest neighbors to probe (0 = unset).
    pub k: usize,
    /// `$min`: minimum connections per endpoint instance (0 = unset).
    pub min: usize,
    /// `$max`: cap on connections per endpoint instance (0 = unset).
    pub max: usize,
    /// `$radius`: spatial search radius (0 = unset).
    pub radius: f64,
    pub has_project: bool,
    /// Absolute path of the endpoint part.
    pub endpoint: Vec<String>,
    pub resolution: Vec<ResolveStep>,
}

impl ConnectionHolder {
    /// Spatial filtering applies when either `$k` or `$radius` is set.
    pub fn spatial(&self) -> bool {
        self.k > 0 || self.radius > 0.0
    }

    /// Value equality ignoring the slot index, for coalescing.
    pub fn same_plan(&self, other: &ConnectionHolder) -> bool {
        self.k == other.k
            && self.min == other.min
            && self.max == other.max
            && self.radius == other.radius
            && self.has_project == other.has_project
            && self.endpoint == other.endpoint
            && self.resolution == other.resolution
    }
}

/// Bit positions inside the packed per-instance flags word.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FlagLayout {
    /// Bit storing `$live`, when `$live` needs storage.
    pub live: Option<u32>,
    /// Bit marking instances created since the last `clear_new`.
    pub newborn: Option<u32>,
    /// First bit of the event-latch range; one bit per event target.
    pub latch_base: u32,
    pub latch_count: u32,
}

/// Storage and lifecycle analysis for one part.
///
/// `local_*` lists describe instance members, `global_*` population members.
/// A variable appears in `members` when it occupies a stored field, and in
/// the phase lists for each lifecycle function that must evaluate it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BackendData {
    pub local_members: Vec<VariableKey>,
    pub local_init: Vec<VariableKey>,
    pub local_update: Vec<VariableKey>,
    pub local_integrated: Vec<VariableKey>,
    pub local_derivative: Vec<VariableKey>,
    pub local_buffered: Vec<VariableKey>,
    pub local_buffered_internal: Vec<VariableKey>,
    pub local_buffered_external: Vec<VariableKey>,
    pub local_buffered_external_write: Vec<VariableKey>,

    pub global_members: Vec<VariableKey>,
    pub global_init: Vec<VariableKey>,
    pub global_update: Vec<VariableKey>,
    pub global_integrated: Vec<VariableKey>,
    pub global_derivative: Vec<VariableKey>,
    pub global_buffered: Vec<VariableKey>,
    pub global_buffered_internal: Vec<VariableKey>,
    pub global_buffered_external: Vec<VariableKey>,
    pub global_buffered_external_write: Vec<VariableKey>,

    pub flags: FlagLayout,
    pub event_targets: Vec<EventTarget>,
    pub event_sources: Vec<EventSource>,

    /// Output column headers computed at digest time.
    pub local_columns: Vec<String>,
    pub global_columns: Vec<String>,
    /// Number of `delay(...)` operator usages needing ring buffers.
    pub delays: usize,

    pub needs_index: bool,
    pub needs_instance_tracking: bool,
    pub needs_refcount: bool,
    pub needs_last_t: bool,
    pub track_n: bool,
    pub can_resize: bool,
    pub can_grow_or_die: bool,
    /// `$live` needs a stored bit (as opposed to constant or accessor).
    pub live_storage: LiveStorage,

    /// Endpoint alias whose container doubles as this connection's
    /// container reference, saving a field.
    pub container_through_endpoint: Option<String>,

    pub connection_holders: Vec<ConnectionHolder>,
}

/// How `$live` is realized for a part.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum LiveStorage {
    /// Never dies: `$live` is the constant 1.
    #[default]
    Constant,
    /// Computed on demand from container/endpoint liveness.
    Accessor,
    /// Stored in the flags word.
    Stored,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn holder_coalescing_ignores_index() {
        let a = ConnectionHolder {
            index: 0,
            k: 0,
            min: 0,
            max: 3,
            radius: 0.0,
            has_project: false,
            endpoint: vec!["A".into()],
            resolution: vec![],
        };
        let mut b = a.clone();
        b.index = 1;
        assert!(a.same_plan(&b));
        b.max = 4;
        assert!(!a.same_plan(&b));
    }

    #[test]
    fn spatial_classification() {
        let mut h = ConnectionHolder {
            index: 0,
            k: 0,
            min: 0,
            max: 0,
            radius: 0.0,
            has_project: false,
            endpoint: vec![],
            resolution: vec![],
        };
        assert!(!h.spatial());
        h.k = 5;
        assert!(h.spatial());
        h.k = 0;
        h.radius = 0.25;
        assert!(h.spatial());
    }
}
