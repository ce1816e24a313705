//! Numeric integration drivers.
//!
//! The drivers orchestrate lifecycle calls over a step's instances; the
//! arithmetic itself lives in each part's `integrate` and derivative
//! methods. Within a stage, every instance completes the stage before any
//! instance begins the next.

use crate::part::InstanceRef;
use crate::simulator::Simulator;
use crate::types::Real;

/// Integration method applied to step events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Integrator {
    #[default]
    Euler,
    /// Classical 4th-order Runge-Kutta.
    RungeKutta,
}

pub(crate) fn integrate<T: Real>(
    sim: &mut Simulator<T>,
    instances: &[InstanceRef<T>],
    dt: T,
) {
    match sim.integrator {
        Integrator::Euler => euler(sim, instances, dt),
        Integrator::RungeKutta => runge_kutta(sim, instances, dt),
    }
}

fn euler<T: Real>(sim: &mut Simulator<T>, instances: &[InstanceRef<T>], dt: T) {
    derive(sim, instances);
    for i in instances {
        i.borrow_mut().integrate(sim, dt);
    }
}

/// One derivative evaluation sweep.
fn derive<T: Real>(sim: &mut Simulator<T>, instances: &[InstanceRef<T>]) {
    for i in instances {
        i.borrow_mut().update_derivative(sim);
    }
    for i in instances {
        i.borrow_mut().finalize_derivative();
    }
}

fn runge_kutta<T: Real>(sim: &mut Simulator<T>, instances: &[InstanceRef<T>], dt: T) {
    let half = dt.half();

    for i in instances {
        i.borrow_mut().snapshot();
    }
    sim.set_preserving(true);

    // k1 at the step start.
    derive(sim, instances);
    for i in instances {
        i.borrow_mut().push_derivative();
    }

    // k2 at the midpoint reached with k1.
    for i in instances {
        i.borrow_mut().integrate(sim, half);
    }
    derive(sim, instances);
    for i in instances {
        i.borrow_mut().multiply_add_to_stack(2);
    }

    // k3 at the midpoint reached with k2.
    for i in instances {
        i.borrow_mut().integrate(sim, half);
    }
    derive(sim, instances);
    for i in instances {
        i.borrow_mut().multiply_add_to_stack(2);
    }

    // k4 at the step end reached with k3.
    for i in instances {
        i.borrow_mut().integrate(sim, dt);
    }
    derive(sim, instances);
    for i in instances {
        i.borrow_mut().multiply_add_to_stack(1);
    }

    // Combine, roll back to the base, and take the weighted step.
    for i in instances {
        let mut instance = i.borrow_mut();
        instance.multiply(1.0 / 6.0);
        instance.add_to_members();
        instance.restore();
    }
    sim.set_preserving(false);
    for i in instances {
        i.borrow_mut().integrate(sim, dt);
    }
}
