//! Connection formation.
//!
//! A connection population produces a [`ConnectIterator`] tree: one level
//! per endpoint binding, in binding order, the innermost level iterating
//! fastest. The simulator drives the tree with a candidate ("probe")
//! connection instance; each `next` binds one endpoint combination onto the
//! probe, and the candidate is accepted with probability `$p`.
//!
//! Nearest-neighbor levels restrict the innermost candidate set with a
//! KD-tree over endpoint positions. Matrix-driven connections iterate the
//! nonzero coordinates of a sparse matrix instead of a cross product.

use std::collections::HashMap;

use tracing::trace;

use crate::kdtree::KdTree;
use crate::part::InstanceRef;
use crate::simulator::Simulator;
use crate::types::Real;

/// Tree of endpoint enumerators driven during connection formation.
pub trait ConnectIterator<T: Real> {
    /// Hand the iterator the candidate connection instance to fill.
    fn set_probe(&mut self, probe: &InstanceRef<T>);

    /// Account for already-formed connections, so `$max` caps hold across
    /// repeated formation passes.
    fn seed(&mut self, _existing: &[InstanceRef<T>]) {}

    /// Restart this level. `outer_newborn` reports whether any already
    /// bound endpoint of the current combination is newborn.
    fn reset(&mut self, sim: &mut Simulator<T>, outer_newborn: bool);

    /// Bind the next endpoint combination onto the probe.
    fn next(&mut self, sim: &mut Simulator<T>) -> bool;

    /// The current combination was accepted; update accounting.
    fn accepted(&mut self) {}
}

/// One endpoint binding level iterating a population's instances.
pub struct ConnectPopulation<T: Real> {
    /// Binding slot filled by this level.
    pub index: usize,
    /// `$max` connections per endpoint instance (0 = uncapped).
    pub max: usize,
    /// `$min` connections per endpoint instance (0 = none required).
    pub min: usize,
    /// `$k` nearest neighbors (0 = unset).
    pub k: usize,
    /// `$radius` spatial cutoff (0 = unset).
    pub radius: f64,
    /// Skip combinations in which no endpoint is newborn.
    pub filter_old: bool,

    instances: Vec<InstanceRef<T>>,
    /// Spatially filtered candidates for the current outer combination.
    filtered: Option<Vec<InstanceRef<T>>>,
    tree: Option<KdTree<T>>,
    i: usize,
    current: Option<InstanceRef<T>>,
    counts: HashMap<usize, usize>,
    inner: Option<Box<dyn ConnectIterator<T>>>,
    probe: Option<InstanceRef<T>>,
    outer_newborn: bool,
}

impl<T: Real> ConnectPopulation<T> {
    pub fn new(index: usize, instances: Vec<InstanceRef<T>>) -> Self {
        Self {
            index,
            max: 0,
            min: 0,
            k: 0,
            radius: 0.0,
            filter_old: false,
            instances,
            filtered: None,
            tree: None,
            i: 0,
            current: None,
            counts: HashMap::new(),
            inner: None,
            probe: None,
            outer_newborn: false,
        }
    }

    /// Chain the next binding level inside this one.
    pub fn wrap(mut self, inner: Box<dyn ConnectIterator<T>>) -> Self {
        self.inner = Some(inner);
        self
    }

    /// Enable nearest-neighbor filtering with a tree over this level's
    /// endpoint positions.
    pub fn with_spatial(mut self, sim: &mut Simulator<T>) -> Self {
        let points: Vec<([f64; 3], InstanceRef<T>)> = self
            .instances
            .iter()
            .map(|inst| {
                let xyz = inst.borrow_mut().get_xyz(sim);
                (xyz, inst.clone())
            })
            .collect();
        self.tree = Some(KdTree::build(points));
        self
    }

    fn spatial(&self) -> bool {
        self.tree.is_some()
    }

    /// Candidate list for the current outer combination.
    fn candidates(&self) -> &[InstanceRef<T>] {
        match &self.filtered {
            Some(f) => f,
            None => &self.instances,
        }
    }

    /// Advance to the next acceptable instance at this level.
    fn advance(&mut self, _sim: &mut Simulator<T>) -> bool {
        let innermost = self.inner.is_none();
        loop {
            if self.i >= self.candidates().len() {
                self.current = None;
                return false;
            }
            let candidate = self.candidates()[self.i].clone();
            self.i += 1;
            if !candidate.borrow().get_live() {
                continue;
            }
            if self.max > 0 {
                let endpoint_index = candidate.borrow().get_index();
                if self.counts.get(&endpoint_index).copied().unwrap_or(0) >= self.max {
                    continue;
                }
            }
            let newborn = candidate.borrow().get_newborn();
            // Only the innermost level can rule on combination freshness.
            if innermost && self.filter_old && !self.outer_newborn && !newborn {
                continue;
            }
            if let Some(probe) = &self.probe {
                probe.borrow_mut().set_part(self.index, &candidate);
            }
            self.current = Some(candidate);
            return true;
        }
    }

    fn reset_inner(&mut self, sim: &mut Simulator<T>) {
        let newborn = self
            .current
            .as_ref()
            .map(|c| c.borrow().get_newborn())
            .unwrap_or(false);
        let outer = self.outer_newborn || newborn;
        if let Some(inner) = &mut self.inner {
            inner.reset(sim, outer);
        }
    }
}

impl<T: Real> ConnectIterator<T> for ConnectPopulation<T> {
    fn set_probe(&mut self, probe: &InstanceRef<T>) {
        self.probe = Some(probe.clone());
        if let Some(inner) = &mut self.inner {
            inner.set_probe(probe);
        }
        // Rebinding the level's current endpoint onto the fresh probe keeps
        // partially iterated state valid across candidate swaps.
        if let Some(current) = &self.current {
            probe.borrow_mut().set_part(self.index, current);
        }
    }

    fn seed(&mut self, existing: &[InstanceRef<T>]) {
        if self.max > 0 {
            for connection in existing {
                if let Some(endpoint) = connection.borrow().get_part(self.index) {
                    *self.counts.entry(endpoint.borrow().get_index()).or_insert(0) += 1;
                }
            }
        }
        if let Some(inner) = &mut self.inner {
            inner.seed(existing);
        }
    }

    fn reset(&mut self, sim: &mut Simulator<T>, outer_newborn: bool) {
        self.outer_newborn = outer_newborn;
        self.i = 0;
        self.current = None;
        if self.spatial() {
            // Recompute the neighborhood around the probe's projection into
            // this endpoint's space.
            let center = match &self.probe {
                Some(probe) => probe.borrow_mut().get_project(sim, self.index),
                None => [0.0; 3],
            };
            let k = if self.k > 0 {
                self.k.max(self.min)
            } else {
                self.min
            };
            let tree = self.tree.as_ref().unwrap();
            self.filtered = Some(tree.query(center, k, self.radius));
        }
    }

    fn next(&mut self, sim: &mut Simulator<T>) -> bool {
        match &mut self.inner {
            None => self.advance(sim),
            Some(_) => loop {
                if self.current.is_none() {
                    if !self.advance(sim) {
                        return false;
                    }
                    self.reset_inner(sim);
                }
                // The cap may have filled while the inner level was
                // iterating combinations for the current endpoint.
                if self.max > 0 {
                    let filled = self
                        .current
                        .as_ref()
                        .map(|c| {
                            let index = c.borrow().get_index();
                            self.counts.get(&index).copied().unwrap_or(0) >= self.max
                        })
                        .unwrap_or(false);
                    if filled {
                        self.current = None;
                        continue;
                    }
                }
                if self.inner.as_mut().unwrap().next(sim) {
                    return true;
                }
                self.current = None;
            },
        }
    }

    fn accepted(&mut self) {
        if self.max > 0 || self.min > 0 {
            if let Some(current) = &self.current {
                *self
                    .counts
                    .entry(current.borrow().get_index())
                    .or_insert(0) += 1;
            }
        }
        if let Some(inner) = &mut self.inner {
            inner.accepted();
        }
    }
}

/// Matrix-driven connection iterator: one candidate per nonzero coordinate
/// whose mapped `(row, col)` names a realized endpoint pair.
pub struct ConnectMatrix<T: Real> {
    row_binding: usize,
    col_binding: usize,
    rows: HashMap<usize, InstanceRef<T>>,
    cols: HashMap<usize, InstanceRef<T>>,
    nonzeros: Vec<(usize, usize)>,
    position: usize,
    probe: Option<InstanceRef<T>>,
}

impl<T: Real> ConnectMatrix<T> {
    pub fn new(
        row_binding: usize,
        row_instances: Vec<InstanceRef<T>>,
        col_binding: usize,
        col_instances: Vec<InstanceRef<T>>,
        nonzeros: Vec<(usize, usize)>,
    ) -> Self {
        let rows = row_instances
            .into_iter()
            .map(|inst| (inst.borrow().get_index(), inst.clone()))
            .collect();
        let cols = col_instances
            .into_iter()
            .map(|inst| (inst.borrow().get_index(), inst.clone()))
            .collect();
        Self {
            row_binding,
            col_binding,
            rows,
            cols,
            nonzeros,
            position: 0,
            probe: None,
        }
    }
}

impl<T: Real> ConnectIterator<T> for ConnectMatrix<T> {
    fn set_probe(&mut self, probe: &InstanceRef<T>) {
        self.probe = Some(probe.clone());
    }

    fn reset(&mut self, _sim: &mut Simulator<T>, _outer_newborn: bool) {
        self.position = 0;
    }

    fn next(&mut self, _sim: &mut Simulator<T>) -> bool {
        let probe = match &self.probe {
            Some(p) => p.clone(),
            None => return false,
        };
        while self.position < self.nonzeros.len() {
            let (r, c) = self.nonzeros[self.position];
            self.position += 1;
            let row_index = probe.borrow().map_index(self.row_binding, r as i64);
            let col_index = probe.borrow().map_index(self.col_binding, c as i64);
            if row_index < 0 || col_index < 0 {
                continue;
            }
            let (row, col) = (
                self.rows.get(&(row_index as usize)),
                self.cols.get(&(col_index as usize)),
            );
            if let (Some(row), Some(col)) = (row, col) {
                trace!(r, c, "matrix pair realized");
                probe.borrow_mut().set_part(self.row_binding, row);
                probe.borrow_mut().set_part(self.col_binding, col);
                return true;
            }
        }
        false
    }
}
