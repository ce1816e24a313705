//! Population membership bookkeeping.
//!
//! Generated populations (and hand-written ones in tests) embed a
//! [`Members`] to manage slot assignment, `$index` reuse, newborn marking,
//! and resize planning. The policy follows the population lifecycle
//! contract: `add` hands out the next free index, preferring slots vacated
//! by deleted instances; `resize` kills surplus oldest-first.

use tracing::debug;

use crate::part::{same_instance, InstanceRef};
use crate::types::Real;

pub struct Members<T: Real> {
    /// Slot table indexed by `$index`. `None` marks a vacated slot.
    slots: Vec<Option<InstanceRef<T>>>,
    /// Vacated slots available for reuse, most recently freed last.
    free: Vec<usize>,
    /// Live member count.
    n: usize,
    /// First index whose instance is still newborn.
    firstborn: usize,
}

impl<T: Real> Default for Members<T> {
    fn default() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            n: 0,
            firstborn: 0,
        }
    }
}

impl<T: Real> Members<T> {
    pub fn n(&self) -> usize {
        self.n
    }

    /// Index the next `add` will assign.
    pub fn next_index(&self) -> usize {
        self.free.last().copied().unwrap_or(self.slots.len())
    }

    pub fn firstborn(&self) -> usize {
        self.firstborn
    }

    /// Claim a slot for `instance` and return its `$index`.
    pub fn add(&mut self, instance: &InstanceRef<T>) -> usize {
        let index = match self.free.pop() {
            Some(index) => {
                self.slots[index] = Some(instance.clone());
                index
            }
            None => {
                self.slots.push(Some(instance.clone()));
                self.slots.len() - 1
            }
        };
        self.n += 1;
        self.firstborn = self.firstborn.min(index);
        index
    }

    /// Release the slot at `index`.
    pub fn remove(&mut self, index: usize) {
        if index < self.slots.len() && self.slots[index].is_some() {
            self.slots[index] = None;
            self.free.push(index);
            self.n -= 1;
        }
    }

    /// Release whichever slot holds `instance`.
    pub fn remove_instance(&mut self, instance: &InstanceRef<T>) {
        if let Some(index) = self.position(instance) {
            self.remove(index);
        }
    }

    fn position(&self, instance: &InstanceRef<T>) -> Option<usize> {
        self.slots.iter().position(|slot| {
            slot.as_ref()
                .map(|s| same_instance(s, instance))
                .unwrap_or(false)
        })
    }

    pub fn get(&self, index: usize) -> Option<&InstanceRef<T>> {
        self.slots.get(index).and_then(|s| s.as_ref())
    }

    /// Live members in slot order.
    pub fn iter(&self) -> impl Iterator<Item = &InstanceRef<T>> {
        self.slots.iter().filter_map(|s| s.as_ref())
    }

    /// Snapshot of live members, for iteration that mutates the table.
    pub fn collect(&self) -> Vec<InstanceRef<T>> {
        self.iter().cloned().collect()
    }

    /// True when the slot at `index` was filled since the last `clear_new`.
    pub fn is_newborn(&self, index: usize) -> bool {
        index >= self.firstborn
    }

    /// Mark all current members as no longer newborn.
    pub fn clear_new(&mut self) {
        self.firstborn = self.slots.len();
    }

    /// Plan a resize toward `target` members.
    ///
    /// Returns the surplus instances to kill (oldest slots first) when
    /// shrinking, or the number of instances to create when growing.
    pub fn plan_resize(&self, target: usize) -> ResizePlan<T> {
        if target >= self.n {
            return ResizePlan::Grow(target - self.n);
        }
        let mut doomed = Vec::with_capacity(self.n - target);
        let surplus = self.n - target;
        for slot in self.slots.iter() {
            if doomed.len() == surplus {
                break;
            }
            if let Some(instance) = slot {
                doomed.push(instance.clone());
            }
        }
        debug!(surplus, target, "population shrink planned");
        ResizePlan::Shrink(doomed)
    }
}

/// Outcome of [`Members::plan_resize`].
pub enum ResizePlan<T: Real> {
    /// Create this many instances.
    Grow(usize),
    /// Kill these instances.
    Shrink(Vec<InstanceRef<T>>),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::part::Instance;
    use crate::simulator::Simulator;
    use std::any::Any;
    use std::cell::RefCell;
    use std::rc::Rc;

    struct Blank;
    impl Instance<f64> for Blank {
        fn as_any(&self) -> &dyn Any {
            self
        }
        fn as_any_mut(&mut self) -> &mut dyn Any {
            self
        }
        fn init(&mut self, _sim: &mut Simulator<f64>) {}
    }

    fn blank() -> InstanceRef<f64> {
        Rc::new(RefCell::new(Blank))
    }

    #[test]
    fn indices_assigned_sequentially() {
        let mut m = Members::<f64>::default();
        assert_eq!(m.add(&blank()), 0);
        assert_eq!(m.add(&blank()), 1);
        assert_eq!(m.n(), 2);
    }

    #[test]
    fn freed_slot_reused() {
        let mut m = Members::<f64>::default();
        m.add(&blank());
        let b = blank();
        m.add(&b);
        m.add(&blank());
        m.remove(1);
        assert_eq!(m.n(), 2);
        assert_eq!(m.next_index(), 1);
        assert_eq!(m.add(&blank()), 1);
    }

    #[test]
    fn newborn_tracking() {
        let mut m = Members::<f64>::default();
        m.add(&blank());
        m.add(&blank());
        m.clear_new();
        assert!(!m.is_newborn(0));
        assert!(!m.is_newborn(1));
        let i = m.add(&blank());
        assert!(m.is_newborn(i));
    }

    #[test]
    fn shrink_kills_oldest_first() {
        let mut m = Members::<f64>::default();
        let a = blank();
        m.add(&a);
        m.add(&blank());
        m.add(&blank());
        match m.plan_resize(1) {
            ResizePlan::Shrink(doomed) => {
                assert_eq!(doomed.len(), 2);
                assert!(same_instance(&doomed[0], &a));
            }
            _ => panic!(),
        }
    }

    #[test]
    fn grow_counts_deficit() {
        let mut m = Members::<f64>::default();
        m.add(&blank());
        match m.plan_resize(10) {
            ResizePlan::Grow(k) => assert_eq!(k, 9),
            _ => panic!(),
        }
    }
}
