//! KD-tree over instance positions, used by nearest-neighbor connection
//! formation (`$k`, `$radius`).

use crate::part::InstanceRef;
use crate::types::Real;

/// One indexed point.
struct Entry<T: Real> {
    xyz: [f64; 3],
    instance: InstanceRef<T>,
}

enum NodeKind {
    Leaf,
    Split {
        axis: usize,
        value: f64,
        lo: Box<Node>,
        hi: Box<Node>,
    },
}

struct Node {
    kind: NodeKind,
    /// Indices into the entry table (leaves only hold their own range).
    points: Vec<usize>,
}

/// Static KD-tree built once per connect pass.
pub struct KdTree<T: Real> {
    entries: Vec<Entry<T>>,
    root: Node,
}

const LEAF_SIZE: usize = 8;

impl<T: Real> KdTree<T> {
    /// Build from `(position, instance)` pairs.
    pub fn build(points: Vec<([f64; 3], InstanceRef<T>)>) -> Self {
        let entries: Vec<Entry<T>> = points
            .into_iter()
            .map(|(xyz, instance)| Entry { xyz, instance })
            .collect();
        let indices: Vec<usize> = (0..entries.len()).collect();
        let root = Self::split(&entries, indices, 0);
        Self { entries, root }
    }

    fn split(entries: &[Entry<T>], mut indices: Vec<usize>, depth: usize) -> Node {
        if indices.len() <= LEAF_SIZE {
            return Node {
                kind: NodeKind::Leaf,
                points: indices,
            };
        }
        let axis = depth % 3;
        indices.sort_by(|&a, &b| {
            entries[a].xyz[axis]
                .partial_cmp(&entries[b].xyz[axis])
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        let mid = indices.len() / 2;
        let value = entries[indices[mid]].xyz[axis];
        let hi_indices = indices.split_off(mid);
        Node {
            kind: NodeKind::Split {
                axis,
                value,
                lo: Box::new(Self::split(entries, indices, depth + 1)),
                hi: Box::new(Self::split(entries, hi_indices, depth + 1)),
            },
            points: Vec::new(),
        }
    }

    /// Up to `k` nearest instances to `center` within `radius`.
    ///
    /// `k == 0` means unlimited count; `radius <= 0` means unlimited range.
    /// Results are sorted nearest first.
    pub fn query(&self, center: [f64; 3], k: usize, radius: f64) -> Vec<InstanceRef<T>> {
        let mut found: Vec<(f64, usize)> = Vec::new();
        self.search(&self.root, center, radius, &mut found);
        found.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));
        if k > 0 {
            found.truncate(k);
        }
        found
            .into_iter()
            .map(|(_, i)| self.entries[i].instance.clone())
            .collect()
    }

    fn search(
        &self,
        node: &Node,
        center: [f64; 3],
        radius: f64,
        found: &mut Vec<(f64, usize)>,
    ) {
        match &node.kind {
            NodeKind::Leaf => {
                for &i in &node.points {
                    let d2 = distance2(self.entries[i].xyz, center);
                    if radius <= 0.0 || d2 <= radius * radius {
                        found.push((d2, i));
                    }
                }
            }
            NodeKind::Split {
                axis,
                value,
                lo,
                hi,
            } => {
                let delta = center[*axis] - value;
                let (near, far) = if delta < 0.0 { (lo, hi) } else { (hi, lo) };
                self.search(near, center, radius, found);
                // The far side can only contribute when the splitting plane
                // lies within the search radius.
                if radius <= 0.0 || delta.abs() <= radius {
                    self.search(far, center, radius, found);
                }
            }
        }
    }
}

fn distance2(a: [f64; 3], b: [f64; 3]) -> f64 {
    let dx = a[0] - b[0];
    let dy = a[1] - b[1];
    let dz = a[2] - b[2];
    dx * dx + dy * dy + dz * dz
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::part::Instance;
    use crate::simulator::Simulator;
    use std::any::Any;
    use std::cell::RefCell;
    use std::rc::Rc;

    struct Tagged(usize);
    impl Instance<f64> for Tagged {
        fn as_any(&self) -> &dyn Any {
            self
        }
        fn as_any_mut(&mut self) -> &mut dyn Any {
            self
        }
        fn get_index(&self) -> usize {
            self.0
        }
        fn init(&mut self, _sim: &mut Simulator<f64>) {}
    }

    fn grid() -> KdTree<f64> {
        let mut points = Vec::new();
        for i in 0..10 {
            for j in 0..10 {
                let instance: InstanceRef<f64> = Rc::new(RefCell::new(Tagged(i * 10 + j)));
                points.push(([i as f64, j as f64, 0.0], instance));
            }
        }
        KdTree::build(points)
    }

    #[test]
    fn nearest_is_self() {
        let tree = grid();
        let near = tree.query([3.0, 4.0, 0.0], 1, 0.0);
        assert_eq!(near.len(), 1);
        assert_eq!(near[0].borrow().get_index(), 34);
    }

    #[test]
    fn k_limits_count() {
        let tree = grid();
        let near = tree.query([5.0, 5.0, 0.0], 5, 0.0);
        assert_eq!(near.len(), 5);
    }

    #[test]
    fn radius_limits_range() {
        let tree = grid();
        // Neighborhood of radius 1.1 around an interior point: itself + 4.
        let near = tree.query([5.0, 5.0, 0.0], 0, 1.1);
        assert_eq!(near.len(), 5);
    }

    #[test]
    fn results_sorted_by_distance() {
        let tree = grid();
        let near = tree.query([0.0, 0.0, 0.0], 3, 0.0);
        assert_eq!(near[0].borrow().get_index(), 0);
    }
}
