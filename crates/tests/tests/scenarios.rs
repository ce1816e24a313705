//! End-to-end runtime scenarios.
//!
//! Each scenario builds its parts by hand against the instance/population
//! protocols and checks observable simulation behavior: integration
//! accuracy, population resize, connection matching, and spike timing.

use std::any::Any;
use std::cell::RefCell;
use std::rc::{Rc, Weak};

use dendrite_runtime::{
    ConnectIterator, ConnectMatrix, ConnectPopulation, Instance, InstanceRef, Integrator,
    Members, Population, PopulationRef, Real, ResizePlan, Simulator, SpikeTarget,
};

type T = f64;

// ---------------------------------------------------------------- decay

/// `x' = -x`, the workhorse single ODE.
struct Decay {
    x: T,
    x_dot: T,
    preserve_x: T,
    stack_x_dot: Vec<T>,
}

impl Decay {
    fn new(x0: T) -> Self {
        Self {
            x: x0,
            x_dot: 0.0,
            preserve_x: 0.0,
            stack_x_dot: Vec::new(),
        }
    }
}

impl Instance<T> for Decay {
    fn as_any(&self) -> &dyn Any {
        self
    }
    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn integrate(&mut self, sim: &mut Simulator<T>, dt: T) {
        if sim.preserving() {
            self.x = self.preserve_x + self.x_dot * dt;
        } else {
            self.x += self.x_dot * dt;
        }
    }

    fn update_derivative(&mut self, _sim: &mut Simulator<T>) {
        self.x_dot = -self.x;
    }

    fn snapshot(&mut self) {
        self.preserve_x = self.x;
    }
    fn restore(&mut self) {
        self.x = self.preserve_x;
    }
    fn push_derivative(&mut self) {
        self.stack_x_dot.push(self.x_dot);
    }
    fn multiply_add_to_stack(&mut self, weight: u32) {
        *self.stack_x_dot.last_mut().unwrap() += self.x_dot * weight as f64;
    }
    fn multiply(&mut self, factor: f64) {
        *self.stack_x_dot.last_mut().unwrap() *= factor;
    }
    fn add_to_members(&mut self) {
        self.x_dot = self.stack_x_dot.pop().unwrap();
    }
}

#[test]
fn euler_decay_matches_discrete_solution() {
    let mut sim = Simulator::<T>::new(Integrator::Euler, 0.1, 1);
    let cell: InstanceRef<T> = Rc::new(RefCell::new(Decay::new(1.0)));
    sim.enqueue(&cell, 0.1);
    sim.run(1.0);

    let x = cell.borrow().as_any().downcast_ref::<Decay>().unwrap().x;
    // Ten Euler steps of x *= 0.9.
    assert!((x - 0.9f64.powi(10)).abs() < 1e-12, "x = {x}");
    assert!((x - 0.348).abs() < 0.05);
}

#[test]
fn runge_kutta_decay_matches_analytic_solution() {
    let mut sim = Simulator::<T>::new(Integrator::RungeKutta, 0.1, 1);
    let cell: InstanceRef<T> = Rc::new(RefCell::new(Decay::new(1.0)));
    sim.enqueue(&cell, 0.1);
    sim.run(1.0);

    let x = cell.borrow().as_any().downcast_ref::<Decay>().unwrap().x;
    assert!((x - (-1.0f64).exp()).abs() < 1e-4, "x = {x}");
}

// ------------------------------------------------------------- combiner

/// A part with an additively combined, externally written variable.
struct Summed {
    total: T,
    next_total: T,
}

impl Instance<T> for Summed {
    fn as_any(&self) -> &dyn Any {
        self
    }
    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn finalize(&mut self, _sim: &mut Simulator<T>) -> bool {
        self.total = self.next_total;
        // ADD combiner: the buffer resets to the additive identity.
        self.next_total = T::zero();
        true
    }
}

#[test]
fn combiner_buffer_resets_to_identity_after_finalize() {
    let mut sim = Simulator::<T>::new(Integrator::Euler, 0.1, 1);
    let part: InstanceRef<T> = Rc::new(RefCell::new(Summed {
        total: 0.0,
        next_total: 0.0,
    }));
    sim.enqueue(&part, 0.1);

    // Writers contribute during the step.
    part.borrow_mut()
        .as_any_mut()
        .downcast_mut::<Summed>()
        .unwrap()
        .next_total += 5.0;
    sim.run(0.1);

    let inner = part.borrow();
    let summed = inner.as_any().downcast_ref::<Summed>().unwrap();
    assert_eq!(summed.total, 5.0);
    assert_eq!(summed.next_total, 0.0);
}

// ---------------------------------------------------------------- blank

/// Minimal population member with an index and a live flag.
struct Blank {
    index: usize,
    live: bool,
    newborn: bool,
}

impl Instance<T> for Blank {
    fn as_any(&self) -> &dyn Any {
        self
    }
    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
    fn get_index(&self) -> usize {
        self.index
    }
    fn get_live(&self) -> bool {
        self.live
    }
    fn get_newborn(&self) -> bool {
        self.newborn
    }
    fn die(&mut self, _sim: &mut Simulator<T>) {
        self.live = false;
    }
    fn finalize(&mut self, _sim: &mut Simulator<T>) -> bool {
        self.live
    }
}

fn blank_population(n: usize) -> Vec<InstanceRef<T>> {
    (0..n)
        .map(|index| {
            Rc::new(RefCell::new(Blank {
                index,
                live: true,
                newborn: true,
            })) as InstanceRef<T>
        })
        .collect()
}

// --------------------------------------------------------------- resize

struct BlankPop {
    members: Members<T>,
}

impl Population<T> for BlankPop {
    fn as_any(&self) -> &dyn Any {
        self
    }
    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn create(&mut self, _sim: &mut Simulator<T>) -> InstanceRef<T> {
        Rc::new(RefCell::new(Blank {
            index: 0,
            live: true,
            newborn: true,
        }))
    }

    fn add(&mut self, _sim: &mut Simulator<T>, instance: &InstanceRef<T>) {
        let index = self.members.add(instance);
        instance
            .borrow_mut()
            .as_any_mut()
            .downcast_mut::<Blank>()
            .unwrap()
            .index = index;
    }

    fn remove(&mut self, _sim: &mut Simulator<T>, instance: &InstanceRef<T>) {
        self.members.remove_instance(instance);
    }

    fn resize(&mut self, sim: &mut Simulator<T>, n: usize) {
        match self.members.plan_resize(n) {
            ResizePlan::Grow(count) => {
                for _ in 0..count {
                    let instance = self.create(sim);
                    self.add(sim, &instance);
                    sim.request_birth(&instance, T::zero());
                }
            }
            ResizePlan::Shrink(doomed) => {
                for instance in doomed {
                    sim.dequeue(&instance, T::zero());
                    instance.borrow_mut().die(sim);
                    self.members.remove_instance(&instance);
                }
            }
        }
    }

    fn get_n(&self) -> usize {
        self.members.n()
    }
}

/// Drives `$n` of the blank population: 10 on [0.5, 1.0), 0 after.
struct ResizeDriver {
    pop: Rc<RefCell<BlankPop>>,
}

impl Instance<T> for ResizeDriver {
    fn as_any(&self) -> &dyn Any {
        self
    }
    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn finalize(&mut self, sim: &mut Simulator<T>) -> bool {
        let t = sim.time();
        let target = if t >= 0.5 && t < 1.0 { 10 } else if t >= 1.0 { 0 } else { return true };
        if self.pop.borrow().get_n() != target {
            let pop = self.pop.clone() as PopulationRef<T>;
            sim.request_resize(&pop, target);
        }
        true
    }
}

#[test]
fn population_resize_follows_n() {
    let mut sim = Simulator::<T>::new(Integrator::Euler, 0.1, 1);
    let pop = Rc::new(RefCell::new(BlankPop {
        members: Members::default(),
    }));
    let driver: InstanceRef<T> = Rc::new(RefCell::new(ResizeDriver { pop: pop.clone() }));
    sim.enqueue(&driver, 0.1);

    sim.run(0.75);
    assert_eq!(pop.borrow().get_n(), 10);

    sim.run(1.2);
    assert_eq!(pop.borrow().get_n(), 0);
    for instance in pop.borrow().members.iter() {
        assert!(!instance.borrow().get_live());
    }
}

// --------------------------------------------------------- connections

/// Two-endpoint connection candidate.
struct Link {
    parts: [Option<InstanceRef<T>>; 2],
    p: f64,
}

impl Instance<T> for Link {
    fn as_any(&self) -> &dyn Any {
        self
    }
    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
    fn set_part(&mut self, index: usize, part: &InstanceRef<T>) {
        self.parts[index] = Some(part.clone());
    }
    fn get_part(&self, index: usize) -> Option<InstanceRef<T>> {
        self.parts[index].clone()
    }
    fn get_p(&mut self, _sim: &mut Simulator<T>) -> f64 {
        self.p
    }
}

struct LinkPop {
    members: Members<T>,
    a: Vec<InstanceRef<T>>,
    b: Vec<InstanceRef<T>>,
    max_per_a: usize,
    matrix: Option<Vec<(usize, usize)>>,
    p: f64,
}

impl Population<T> for LinkPop {
    fn as_any(&self) -> &dyn Any {
        self
    }
    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn create(&mut self, _sim: &mut Simulator<T>) -> InstanceRef<T> {
        Rc::new(RefCell::new(Link {
            parts: [None, None],
            p: self.p,
        }))
    }

    fn add(&mut self, _sim: &mut Simulator<T>, instance: &InstanceRef<T>) {
        self.members.add(instance);
    }

    fn get_n(&self) -> usize {
        self.members.n()
    }

    fn get_iterators(
        &mut self,
        _sim: &mut Simulator<T>,
    ) -> Option<Box<dyn ConnectIterator<T>>> {
        if let Some(nonzeros) = &self.matrix {
            return Some(Box::new(ConnectMatrix::new(
                0,
                self.a.clone(),
                1,
                self.b.clone(),
                nonzeros.clone(),
            )));
        }
        let inner = ConnectPopulation::new(1, self.b.clone());
        let mut outer = ConnectPopulation::new(0, self.a.clone());
        outer.max = self.max_per_a;
        Some(Box::new(outer.wrap(Box::new(inner))))
    }
}

/// A root whose init only queues connection formation.
struct ConnectDriver {
    pop: Rc<RefCell<LinkPop>>,
}

impl Instance<T> for ConnectDriver {
    fn as_any(&self) -> &dyn Any {
        self
    }
    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
    fn init(&mut self, sim: &mut Simulator<T>) {
        let pop = self.pop.clone() as PopulationRef<T>;
        sim.request_connect(&pop);
    }
}

fn form_connections(pop: Rc<RefCell<LinkPop>>) -> usize {
    let mut sim = Simulator::<T>::new(Integrator::Euler, 0.1, 42);
    let driver: InstanceRef<T> = Rc::new(RefCell::new(ConnectDriver { pop: pop.clone() }));
    sim.init(&driver);
    let n = pop.borrow().get_n();
    n
}

#[test]
fn max_caps_connections_per_endpoint() {
    // A(10) x B(10), p = 1, at most 3 per A instance.
    let pop = Rc::new(RefCell::new(LinkPop {
        members: Members::default(),
        a: blank_population(10),
        b: blank_population(10),
        max_per_a: 3,
        matrix: None,
        p: 1.0,
    }));
    assert_eq!(form_connections(pop), 30);
}

#[test]
fn uncapped_cross_product_forms_all_pairs() {
    let pop = Rc::new(RefCell::new(LinkPop {
        members: Members::default(),
        a: blank_population(4),
        b: blank_population(5),
        max_per_a: 0,
        matrix: None,
        p: 1.0,
    }));
    assert_eq!(form_connections(pop), 20);
}

#[test]
fn zero_probability_forms_nothing() {
    let pop = Rc::new(RefCell::new(LinkPop {
        members: Members::default(),
        a: blank_population(4),
        b: blank_population(4),
        max_per_a: 0,
        matrix: None,
        p: 0.0,
    }));
    assert_eq!(form_connections(pop), 0);
}

#[test]
fn matrix_connection_visits_each_nonzero_once() {
    let nonzeros = vec![(0, 0), (2, 3), (5, 1), (9, 9)];
    let pop = Rc::new(RefCell::new(LinkPop {
        members: Members::default(),
        a: blank_population(10),
        b: blank_population(10),
        max_per_a: 0,
        matrix: Some(nonzeros.clone()),
        p: 1.0,
    }));
    assert_eq!(form_connections(pop.clone()), nonzeros.len());

    // Every formed connection binds the mapped endpoint pair.
    for link in pop.borrow().members.iter() {
        let inner = link.borrow();
        let a = inner.get_part(0).unwrap().borrow().get_index();
        let b = inner.get_part(1).unwrap().borrow().get_index();
        assert!(nonzeros.contains(&(a, b)));
    }
}

#[test]
fn matrix_rows_without_instances_are_skipped() {
    // Row index 7 maps outside the 5-instance A population.
    let pop = Rc::new(RefCell::new(LinkPop {
        members: Members::default(),
        a: blank_population(5),
        b: blank_population(5),
        max_per_a: 0,
        matrix: Some(vec![(0, 0), (7, 1), (4, 4)]),
        p: 1.0,
    }));
    assert_eq!(form_connections(pop), 2);
}

// -------------------------------------------------------------- spikes

/// Listener that records when its latches get set.
struct Listener {
    myself: Option<Weak<RefCell<Listener>>>,
    latch_times: Vec<(usize, T)>,
    now: T,
}

impl Instance<T> for Listener {
    fn as_any(&self) -> &dyn Any {
        self
    }
    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn update(&mut self, sim: &mut Simulator<T>) {
        self.now = sim.time();
    }

    fn set_latch(&mut self, target: usize) {
        self.latch_times.push((target, self.now));
    }

    fn finalize_event(&mut self, sim: &mut Simulator<T>) {
        self.now = sim.time();
        if let Some((target, _)) = self.latch_times.last().cloned() {
            // Replace the stamp with the delivery time.
            self.latch_times.pop();
            self.latch_times.push((target, sim.time()));
        }
        // The first delivery schedules the follow-up spike with a delay
        // that is a whole number of steps.
        if self.latch_times.len() == 1 {
            let me = self.myself.as_ref().unwrap().upgrade().unwrap();
            sim.schedule_spike(SpikeTarget::Single(me), 0.2, 1, false);
        }
    }
}

/// Step member that fires the initial off-grid spike at its first tick.
struct SpikeSource {
    listener: InstanceRef<T>,
    fired: bool,
}

impl Instance<T> for SpikeSource {
    fn as_any(&self) -> &dyn Any {
        self
    }
    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn finalize(&mut self, sim: &mut Simulator<T>) -> bool {
        if !self.fired {
            self.fired = true;
            // 0.03 is not a whole number of 0.1 steps: delivered off-grid
            // at t = 0.13.
            sim.schedule_spike(SpikeTarget::Single(self.listener.clone()), 0.03, 0, false);
        }
        true
    }
}

#[test]
fn whole_step_delays_snap_to_the_grid() {
    let mut sim = Simulator::<T>::new(Integrator::Euler, 0.1, 1);

    let listener = Rc::new(RefCell::new(Listener {
        myself: None,
        latch_times: Vec::new(),
        now: 0.0,
    }));
    listener.borrow_mut().myself = Some(Rc::downgrade(&listener));
    let listener_dyn: InstanceRef<T> = listener.clone();

    let source: InstanceRef<T> = Rc::new(RefCell::new(SpikeSource {
        listener: listener_dyn,
        fired: false,
    }));
    sim.enqueue(&source, 0.1);
    sim.run(1.0);

    let inner = listener.borrow();
    assert_eq!(inner.latch_times.len(), 2, "{:?}", inner.latch_times);
    // First spike lands off-grid at 0.13.
    assert!((inner.latch_times[0].1 - 0.13).abs() < 1e-9);
    // Its follow-up (delay 0.20 from 0.13) snaps onto the 0.30 step.
    assert!(
        (inner.latch_times[1].1 - 0.30).abs() < 1e-9,
        "{:?}",
        inner.latch_times
    );
}

// ------------------------------------------------------- input streams

#[test]
fn smoothed_input_interpolates_between_rows() {
    use std::io::Write;
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(b"0,0\n1,10\n").unwrap();
    file.flush().unwrap();

    let mut sim = Simulator::<T>::new(Integrator::Euler, 0.1, 1);
    let path = file.path().to_str().unwrap();
    let holder = sim.holders.get_input(path, true, true).unwrap();
    let value = holder.get(0.3, 1);
    assert!((value - 3.0).abs() < 1e-9, "value = {value}");
}
