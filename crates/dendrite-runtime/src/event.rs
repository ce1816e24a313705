//! Event kinds and the priority queue that orders them.
//!
//! Three event kinds advance the simulation:
//!
//! - [`EventStep`]: periodic advance of all instances sharing one `dt`.
//! - `Spike`: one-shot delivery to a single instance or a monitor list,
//!   processed promptly (`finalize_event`).
//! - `SpikeLatch`: like a spike but only sets latches; downstream work
//!   happens during the next step.
//!
//! Ties at equal time resolve step-before-spike, so a spike landing exactly
//! on a step boundary is delivered after that step's finalize.

use std::cell::RefCell;
use std::cmp::Ordering;
use std::rc::Rc;

use crate::part::InstanceRef;
use crate::types::Real;

/// Periodic step shared by every instance with the same `dt`.
pub struct EventStep<T: Real> {
    pub dt: T,
    /// Instances visited by this step, in enqueue order.
    pub instances: Vec<InstanceRef<T>>,
    /// True while an occurrence of this step sits in the queue.
    pub scheduled: bool,
}

impl<T: Real> EventStep<T> {
    pub fn new(dt: T) -> Self {
        Self {
            dt,
            instances: Vec::new(),
            scheduled: false,
        }
    }
}

/// Delivery target of a spike.
pub enum SpikeTarget<T: Real> {
    Single(InstanceRef<T>),
    /// Broadcast to a monitor list.
    Multi(Vec<InstanceRef<T>>),
}

/// One-shot event.
pub struct EventSpike<T: Real> {
    pub target: SpikeTarget<T>,
    /// Event-target slot whose latch is set on delivery.
    pub latch: usize,
    /// Set latches only; skip prompt processing.
    pub latch_only: bool,
}

/// What happens when a queue entry fires.
pub enum EventKind<T: Real> {
    Step(Rc<RefCell<EventStep<T>>>),
    Spike(EventSpike<T>),
}

impl<T: Real> EventKind<T> {
    /// Priority among events at the same time; lower fires first.
    fn rank(&self) -> u8 {
        match self {
            EventKind::Step(_) => 0,
            EventKind::Spike(_) => 1,
        }
    }
}

/// A scheduled event.
pub struct QueuedEvent<T: Real> {
    pub t: T,
    /// Monotonic tiebreaker keeping dispatch deterministic.
    pub seq: u64,
    pub kind: EventKind<T>,
}

impl<T: Real> PartialEq for QueuedEvent<T> {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl<T: Real> Eq for QueuedEvent<T> {}

impl<T: Real> PartialOrd for QueuedEvent<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T: Real> Ord for QueuedEvent<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        // Simulation times are never NaN; treat incomparable as equal.
        self.t
            .partial_cmp(&other.t)
            .unwrap_or(Ordering::Equal)
            .then(self.kind.rank().cmp(&other.kind.rank()))
            .then(self.seq.cmp(&other.seq))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BinaryHeap;

    fn step_event(t: f64, seq: u64) -> QueuedEvent<f64> {
        QueuedEvent {
            t,
            seq,
            kind: EventKind::Step(Rc::new(RefCell::new(EventStep::new(0.1)))),
        }
    }

    fn spike_event(t: f64, seq: u64) -> QueuedEvent<f64> {
        QueuedEvent {
            t,
            seq,
            kind: EventKind::Spike(EventSpike {
                target: SpikeTarget::Multi(Vec::new()),
                latch: 0,
                latch_only: false,
            }),
        }
    }

    #[test]
    fn earliest_first() {
        let mut heap = BinaryHeap::new();
        heap.push(std::cmp::Reverse(step_event(0.3, 0)));
        heap.push(std::cmp::Reverse(step_event(0.1, 1)));
        heap.push(std::cmp::Reverse(step_event(0.2, 2)));
        assert_eq!(heap.pop().unwrap().0.t, 0.1);
        assert_eq!(heap.pop().unwrap().0.t, 0.2);
    }

    #[test]
    fn step_beats_spike_at_same_time() {
        let mut heap = BinaryHeap::new();
        heap.push(std::cmp::Reverse(spike_event(0.5, 0)));
        heap.push(std::cmp::Reverse(step_event(0.5, 1)));
        let first = heap.pop().unwrap().0;
        assert!(matches!(first.kind, EventKind::Step(_)));
    }

    #[test]
    fn seq_breaks_remaining_ties() {
        let mut heap = BinaryHeap::new();
        heap.push(std::cmp::Reverse(spike_event(0.5, 7)));
        heap.push(std::cmp::Reverse(spike_event(0.5, 3)));
        assert_eq!(heap.pop().unwrap().0.seq, 3);
    }
}
