//! The discrete-event simulator.
//!
//! One `Simulator` owns the event queue, the step registry, the I/O
//! holders, and the random stream for one simulation. Scheduling is
//! single-threaded and cooperative: a tick pops the earliest event,
//! dispatches it, then drains structural work (resizes, connection
//! formation, births, deaths) queued during dispatch.
//!
//! Embedding several independent simulations in one process means
//! constructing several `Simulator` values; nothing here is process-global.
//! The type is deliberately not `Send`, which pins each simulation to the
//! thread that created it.
//!
//! Borrow discipline: the dispatcher never holds a `RefCell` borrow across
//! a call into part code, and part code may borrow neighbors (endpoints,
//! containers, populations) only transiently. Structural mutation that
//! would re-enter the currently borrowed population goes through the
//! request queues instead.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, info, trace};

use crate::event::{EventKind, EventSpike, EventStep, QueuedEvent, SpikeTarget};
use crate::holders::Holders;
use crate::integrator::{self, Integrator};
use crate::part::{same_instance, InstanceRef, PopulationRef};
use crate::types::Real;

/// Tolerance for snapping spike delays onto the step grid.
const DELAY_SNAP: f64 = 1e-3;

pub struct Simulator<T: Real> {
    now: T,
    /// `dt` of the step being processed; `$t'` reads this.
    event_dt: T,
    /// Step period used when an instance does not name its own.
    default_dt: T,
    seq: u64,
    queue: BinaryHeap<Reverse<QueuedEvent<T>>>,
    steps: Vec<Rc<std::cell::RefCell<EventStep<T>>>>,
    pub integrator: Integrator,
    pub holders: Holders,
    rng: StdRng,
    stop: Arc<AtomicBool>,
    preserving: bool,

    init_queue: Vec<PopulationRef<T>>,
    connect_queue: Vec<PopulationRef<T>>,
    resize_queue: Vec<(PopulationRef<T>, usize)>,
    birth_queue: Vec<(InstanceRef<T>, T)>,
    death_queue: Vec<InstanceRef<T>>,
}

impl<T: Real> Simulator<T> {
    pub fn new(integrator: Integrator, default_dt: T, seed: u64) -> Self {
        info!(?integrator, seed, "simulator created");
        Self {
            now: T::zero(),
            event_dt: default_dt,
            default_dt,
            seq: 0,
            queue: BinaryHeap::new(),
            steps: Vec::new(),
            integrator,
            holders: Holders::new(),
            rng: StdRng::seed_from_u64(seed),
            stop: Arc::new(AtomicBool::new(false)),
            preserving: false,
            init_queue: Vec::new(),
            connect_queue: Vec::new(),
            resize_queue: Vec::new(),
            birth_queue: Vec::new(),
            death_queue: Vec::new(),
        }
    }

    /// Current simulated time (the time of the event being processed).
    pub fn time(&self) -> T {
        self.now
    }

    /// `dt` of the current step event.
    pub fn dt(&self) -> T {
        self.event_dt
    }

    /// True while a multi-stage integrator holds a snapshot base.
    pub fn preserving(&self) -> bool {
        self.preserving
    }

    pub(crate) fn set_preserving(&mut self, value: bool) {
        self.preserving = value;
    }

    /// Cooperative cancellation flag; share with a signal handler.
    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        self.stop.clone()
    }

    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::Relaxed);
    }

    /// Uniform draw on [0,1).
    pub fn uniform(&mut self) -> f64 {
        self.rng.gen::<f64>()
    }

    /// Standard normal draw (Box-Muller).
    pub fn gaussian(&mut self) -> f64 {
        let u1: f64 = self.rng.gen::<f64>().max(f64::MIN_POSITIVE);
        let u2: f64 = self.rng.gen();
        (-2.0 * u1.ln()).sqrt() * (std::f64::consts::TAU * u2).cos()
    }

    /// The shared step for `dt`, created on first use.
    fn get_step(&mut self, dt: T) -> Rc<std::cell::RefCell<EventStep<T>>> {
        if let Some(step) = self.steps.iter().find(|s| s.borrow().dt == dt) {
            return step.clone();
        }
        let step = Rc::new(std::cell::RefCell::new(EventStep::new(dt)));
        self.steps.push(step.clone());
        step
    }

    fn push_event(&mut self, t: T, kind: EventKind<T>) {
        let seq = self.seq;
        self.seq += 1;
        self.queue.push(Reverse(QueuedEvent { t, seq, kind }));
    }

    /// Add `instance` to the step with period `dt` (zero = simulation
    /// default). The step's first firing after an idle period lands one
    /// period from now.
    pub fn enqueue(&mut self, instance: &InstanceRef<T>, dt: T) {
        let dt = if dt.is_zero() { self.default_dt } else { dt };
        let step = self.get_step(dt);
        {
            let mut s = step.borrow_mut();
            s.instances.push(instance.clone());
            if s.scheduled {
                return;
            }
            s.scheduled = true;
        }
        let t = self.now + dt;
        self.push_event(t, EventKind::Step(step));
    }

    /// Remove `instance` from the step with period `dt`.
    pub fn dequeue(&mut self, instance: &InstanceRef<T>, dt: T) {
        let dt = if dt.is_zero() { self.default_dt } else { dt };
        let step = self.get_step(dt);
        step.borrow_mut()
            .instances
            .retain(|i| !same_instance(i, instance));
    }

    /// Move `instance` between step periods after a `$t'` change.
    pub fn move_step(&mut self, instance: &InstanceRef<T>, from: T, to: T) {
        debug!(%from, %to, "instance changes step");
        self.dequeue(instance, from);
        self.enqueue(instance, to);
    }

    /// Schedule a spike for delivery `delay` from now.
    ///
    /// When the delay is a whole number of steps (within tolerance), the
    /// delivery time snaps onto the step grid so the latch is observed by
    /// that step's finalize.
    pub fn schedule_spike(&mut self, target: SpikeTarget<T>, delay: T, latch: usize, latch_only: bool) {
        let t = self.quantize_delay(delay);
        trace!(t = %t, latch, latch_only, "spike scheduled");
        self.push_event(
            t,
            EventKind::Spike(EventSpike {
                target,
                latch,
                latch_only,
            }),
        );
    }

    fn quantize_delay(&self, delay: T) -> T {
        let dt = self.event_dt;
        let dt64 = dt.to_f64();
        if dt64 <= 0.0 {
            return self.now + delay;
        }
        let ratio = delay.to_f64() / dt64;
        if (ratio - ratio.round()).abs() < DELAY_SNAP {
            let grid = ((self.now + delay).to_f64() / dt64).round() as i64;
            dt.times(grid)
        } else {
            self.now + delay
        }
    }

    /// Defer a population's own init. Used when a container instance
    /// brings its nested populations online while it is itself borrowed.
    pub fn request_init(&mut self, population: &PopulationRef<T>) {
        self.init_queue.push(population.clone());
    }

    /// Defer connection formation for `population` to the end of the tick.
    pub fn request_connect(&mut self, population: &PopulationRef<T>) {
        self.connect_queue.push(population.clone());
    }

    /// Defer a `$n`-driven resize to the end of the tick.
    pub fn request_resize(&mut self, population: &PopulationRef<T>, n: usize) {
        self.resize_queue.push((population.clone(), n));
    }

    /// Defer init+enqueue of a freshly added instance. Used from inside
    /// population methods, where an immediate init could re-borrow the
    /// population. `dt` zero means the simulation default step.
    pub fn request_birth(&mut self, instance: &InstanceRef<T>, dt: T) {
        self.birth_queue.push((instance.clone(), dt));
    }

    /// Defer a death decided from inside a population method.
    pub fn request_death(&mut self, instance: &InstanceRef<T>) {
        self.death_queue.push(instance.clone());
    }

    /// Bring the model online: lifecycle-init the root and settle all
    /// structural work it triggers.
    pub fn init(&mut self, root: &InstanceRef<T>) {
        root.borrow_mut().enter_simulation();
        root.borrow_mut().init(self);
        self.drain_pending();
    }

    /// Advance until the queue runs dry, `until` is passed, or a stop is
    /// requested.
    pub fn run(&mut self, until: T) {
        while !self.stop.load(Ordering::Relaxed) {
            let t = match self.queue.peek() {
                Some(Reverse(event)) => event.t,
                None => break,
            };
            if t > until {
                break;
            }
            let Reverse(event) = self.queue.pop().unwrap();
            self.now = event.t;
            match event.kind {
                EventKind::Step(step) => self.dispatch_step(step),
                EventKind::Spike(spike) => self.dispatch_spike(spike),
            }
            self.drain_pending();
        }
    }

    /// Flush holders and release resources. Also runs on drop.
    pub fn finish(&mut self) {
        debug!("simulation finished");
        self.holders.flush();
    }

    fn dispatch_step(&mut self, step: Rc<std::cell::RefCell<EventStep<T>>>) {
        let dt = step.borrow().dt;
        self.event_dt = dt;
        let snapshot: Vec<InstanceRef<T>> = step.borrow().instances.clone();
        if snapshot.is_empty() {
            step.borrow_mut().scheduled = false;
            return;
        }
        trace!(t = %self.now, %dt, n = snapshot.len(), "step");

        integrator::integrate(self, &snapshot, dt);
        for i in &snapshot {
            i.borrow_mut().update(self);
        }
        let mut dead: Vec<InstanceRef<T>> = Vec::new();
        for i in &snapshot {
            let keep = i.borrow_mut().finalize(self);
            if !keep {
                dead.push(i.clone());
            }
        }
        {
            let mut s = step.borrow_mut();
            if !dead.is_empty() {
                s.instances
                    .retain(|i| !dead.iter().any(|d| same_instance(d, i)));
            }
            if s.instances.is_empty() {
                s.scheduled = false;
                return;
            }
        }
        let t = self.now + dt;
        self.push_event(t, EventKind::Step(step));
    }

    fn dispatch_spike(&mut self, spike: EventSpike<T>) {
        let targets: Vec<InstanceRef<T>> = match spike.target {
            SpikeTarget::Single(i) => vec![i],
            SpikeTarget::Multi(list) => list,
        };
        for target in &targets {
            target.borrow_mut().set_latch(spike.latch);
        }
        if !spike.latch_only {
            for target in &targets {
                target.borrow_mut().finalize_event(self);
            }
        }
    }

    /// Settle structural work until no more is produced.
    fn drain_pending(&mut self) {
        loop {
            if let Some(population) = self.init_queue.pop() {
                population.borrow_mut().init(self);
                continue;
            }
            if let Some(instance) = self.death_queue.pop() {
                instance.borrow_mut().die(self);
                continue;
            }
            if let Some((instance, dt)) = self.birth_queue.pop() {
                instance.borrow_mut().init(self);
                self.enqueue(&instance, dt);
                continue;
            }
            if let Some((population, n)) = self.resize_queue.pop() {
                population.borrow_mut().resize(self, n);
                continue;
            }
            if let Some(population) = self.connect_queue.pop() {
                self.connect_population(&population);
                population.borrow_mut().clear_new();
                continue;
            }
            break;
        }
    }

    /// Drive connection formation for one connection population.
    ///
    /// Candidates are realized lazily: one probe instance is created, its
    /// endpoints are bound by the iterator tree, and it is kept only when
    /// `uniform() < $p`. A rejected probe is re-bound to the next
    /// combination instead of being reconstructed.
    fn connect_population(&mut self, population: &PopulationRef<T>) {
        let Some(mut iterator) = population.borrow_mut().get_iterators(self) else {
            return;
        };
        let mut formed = 0usize;
        let mut primed = false;
        let mut candidate: Option<InstanceRef<T>> = None;
        loop {
            let probe = match candidate.take() {
                Some(existing) => existing,
                None => {
                    let fresh = population.borrow_mut().create(self);
                    iterator.set_probe(&fresh);
                    if !primed {
                        // One restart with the probe in hand lets spatial
                        // levels build their candidate neighborhoods.
                        iterator.reset(self, false);
                        primed = true;
                    }
                    fresh
                }
            };
            if !iterator.next(self) {
                break;
            }
            let p = probe.borrow_mut().get_p(self);
            let accept = p >= 1.0 || (p > 0.0 && self.uniform() < p);
            if !accept {
                candidate = Some(probe);
                continue;
            }
            population.borrow_mut().add(self, &probe);
            iterator.accepted();
            probe.borrow_mut().init(self);
            self.enqueue(&probe, T::zero());
            formed += 1;
        }
        if formed > 0 {
            debug!(formed, "connections formed");
        }
    }
}

impl<T: Real> Drop for Simulator<T> {
    fn drop(&mut self) {
        self.holders.flush();
    }
}
