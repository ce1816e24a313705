//! The instance and population protocols.
//!
//! Generated code lowers every model part to two types: one implementing
//! [`Instance`] (per individual) and one implementing [`Population`] (per
//! collection under a given container). The simulator and the connection
//! machinery drive parts exclusively through these traits.
//!
//! Every method has a default body that realizes the "skipped function"
//! contract: a part that does not need a lifecycle function simply does not
//! emit it, and the default (a no-op or a sentinel) applies.

use std::any::Any;
use std::cell::RefCell;
use std::rc::Rc;

use crate::connect::ConnectIterator;
use crate::simulator::Simulator;
use crate::types::Real;

/// Shared handle to an instance.
///
/// Instances are owned by their population; connections and event monitors
/// hold additional handles. The strong count doubles as the reference count
/// that keeps an endpoint alive while a connection still points at it.
pub type InstanceRef<T> = Rc<RefCell<dyn Instance<T>>>;

/// Shared handle to a population.
pub type PopulationRef<T> = Rc<RefCell<dyn Population<T>>>;

/// Identity comparison of instance handles.
pub fn same_instance<T: Real>(a: &InstanceRef<T>, b: &InstanceRef<T>) -> bool {
    Rc::ptr_eq(a, b)
}

/// One realized member of a population.
pub trait Instance<T: Real>: Any {
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;

    /// Reset stored fields to zero-equivalent values before reuse.
    fn clear(&mut self) {}

    /// Evaluate init-phase equations. `$live` reads 0 for the duration.
    fn init(&mut self, _sim: &mut Simulator<T>) {}

    /// Advance integrated variables by `dt`. During a Runge-Kutta stage
    /// (`sim.preserving()`), integration starts from the snapshot base.
    fn integrate(&mut self, _sim: &mut Simulator<T>, _dt: T) {}

    /// Evaluate update-phase equations into buffers.
    fn update(&mut self, _sim: &mut Simulator<T>) {}

    /// Commit buffers, test events, decide survival.
    /// Returning false removes the instance from its step list.
    fn finalize(&mut self, _sim: &mut Simulator<T>) -> bool {
        true
    }

    /// Evaluate derivative-phase equations.
    fn update_derivative(&mut self, _sim: &mut Simulator<T>) {}

    /// Commit buffered derivative writes.
    fn finalize_derivative(&mut self) {}

    /// Preserve integrated values (and external-write buffers) as the base
    /// for a multi-stage integration step.
    fn snapshot(&mut self) {}

    /// Roll integrated values back to the snapshot base.
    fn restore(&mut self) {}

    /// Push a copy of each derivative onto its stack.
    fn push_derivative(&mut self) {}

    /// `stack_top += weight * derivative` for each derivative.
    fn multiply_add_to_stack(&mut self, _weight: u32) {}

    /// Scale each derivative's stack top by `factor`.
    fn multiply(&mut self, _factor: f64) {}

    /// Write each stack top back into its derivative member and pop.
    fn add_to_members(&mut self) {}

    /// Mark the instance dead and release its claims on endpoints.
    fn die(&mut self, _sim: &mut Simulator<T>) {}

    fn enter_simulation(&mut self) {}

    /// Withdraw from the simulation; the population slot is released.
    fn leave_simulation(&mut self, _sim: &mut Simulator<T>) {}

    /// True when no other live part still references this instance.
    fn is_free(&self) -> bool {
        true
    }

    /// Stored liveness. Reads true for parts that cannot die.
    fn get_live(&self) -> bool {
        true
    }

    /// Connection probability. The sentinel 1 accepts unconditionally.
    /// Reported as plain f64 regardless of regime; fixed-point parts
    /// convert their stored `$p` before returning.
    fn get_p(&mut self, _sim: &mut Simulator<T>) -> f64 {
        1.0
    }

    /// Spatial coordinates of this instance, in plain f64.
    fn get_xyz(&mut self, _sim: &mut Simulator<T>) -> [f64; 3] {
        [0.0; 3]
    }

    /// Coordinates of this connection projected into the space of the
    /// endpoint at `index`. Without a `$project` expression the probe's
    /// own position stands in.
    fn get_project(&mut self, sim: &mut Simulator<T>, _index: usize) -> [f64; 3] {
        self.get_xyz(sim)
    }

    /// Bind the endpoint at `index` (connections only).
    fn set_part(&mut self, _index: usize, _part: &InstanceRef<T>) {}

    /// Read the endpoint at `index` (connections only).
    fn get_part(&self, _index: usize) -> Option<InstanceRef<T>> {
        None
    }

    /// Population slot index of this instance.
    fn get_index(&self) -> usize {
        0
    }

    /// Created since the population's last `clear_new`.
    fn get_newborn(&self) -> bool {
        false
    }

    /// Number of connections currently bound to this instance through the
    /// named binding slot, when accountable. Sentinel: no accounting.
    fn get_count(&self, _index: usize) -> usize {
        0
    }

    /// Convert a matrix coordinate to this connection's endpoint `$index`
    /// space for the binding at `index`.
    fn map_index(&self, _index: usize, coordinate: i64) -> i64 {
        coordinate
    }

    /// Evaluate the monitored condition of event target `target`; true when
    /// the configured edge fires.
    fn event_test(&mut self, _sim: &mut Simulator<T>, _target: usize) -> bool {
        false
    }

    /// Delay from trigger to delivery for event target `target`.
    /// Negative means "during this cycle's finalize".
    fn event_delay(&mut self, _sim: &mut Simulator<T>, _target: usize) -> T {
        -T::one()
    }

    /// Set the delivery latch for event target `target`.
    fn set_latch(&mut self, _target: usize) {}

    /// Process a delivered spike: evaluate affected variables promptly.
    fn finalize_event(&mut self, _sim: &mut Simulator<T>) {}

    /// Human-readable instance path for diagnostics and trace columns.
    fn path(&self) -> String {
        String::new()
    }
}

/// The collection of instances of one part under one container.
pub trait Population<T: Real>: Any {
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;

    /// Construct a blank instance, not yet added.
    fn create(&mut self, sim: &mut Simulator<T>) -> InstanceRef<T>;

    /// Take ownership of `instance`, assigning its `$index`.
    fn add(&mut self, sim: &mut Simulator<T>, instance: &InstanceRef<T>);

    /// Release the slot held by `instance`.
    fn remove(&mut self, _sim: &mut Simulator<T>, _instance: &InstanceRef<T>) {}

    /// Evaluate population-level init equations and create the initial
    /// membership.
    fn init(&mut self, _sim: &mut Simulator<T>) {}

    fn integrate(&mut self, _sim: &mut Simulator<T>, _dt: T) {}

    fn update(&mut self, _sim: &mut Simulator<T>) {}

    /// Commit population buffers; drive `$n`-directed resizes.
    fn finalize(&mut self, _sim: &mut Simulator<T>) -> bool {
        true
    }

    fn update_derivative(&mut self, _sim: &mut Simulator<T>) {}
    fn finalize_derivative(&mut self) {}
    fn snapshot(&mut self) {}
    fn restore(&mut self) {}
    fn push_derivative(&mut self) {}
    fn multiply_add_to_stack(&mut self, _weight: u32) {}
    fn multiply(&mut self, _factor: f64) {}
    fn add_to_members(&mut self) {}

    /// Grow or shrink toward `n` instances. Surplus dies oldest-first.
    fn resize(&mut self, _sim: &mut Simulator<T>, _n: usize) {}

    fn get_n(&self) -> usize {
        0
    }

    /// Forget newborn status for all current members.
    fn clear_new(&mut self) {}

    /// Iterator tree over endpoint combinations for connection formation.
    /// None for compartments.
    fn get_iterators(
        &mut self,
        _sim: &mut Simulator<T>,
    ) -> Option<Box<dyn ConnectIterator<T>>> {
        None
    }

    fn path(&self) -> String {
        String::new()
    }
}
