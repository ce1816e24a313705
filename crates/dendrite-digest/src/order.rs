//! Dependency ordering of parts and of variables within a part.

use std::collections::HashSet;

use dendrite_model::eqset::{Attribute, EquationSet, VariableKey};
use dendrite_model::expr::ExprKind;
use tracing::trace;

/// Order sibling parts so that connection endpoints precede the
/// connections that bind them, and referenced parts precede referencing
/// parts. Fills `ordered_parts` on every part.
pub fn sort_parts(root: &mut EquationSet) {
    let paths = root.part_paths();
    for path in paths {
        let part = root.part_at(&path).unwrap();
        let n = part.parts.len();
        if n == 0 {
            continue;
        }
        // edges[a] contains b  =>  child a must come before child b.
        let mut edges: Vec<HashSet<usize>> = vec![HashSet::new(); n];
        for (ci, child) in part.parts.iter().enumerate() {
            let child_path: Vec<String> = path
                .iter()
                .cloned()
                .chain([child.name.clone()])
                .collect();
            for binding in &child.connection_bindings {
                if let Some(ei) = sibling_index(part, &path, &binding.endpoint) {
                    if ei != ci {
                        edges[ei].insert(ci);
                    }
                }
            }
            for variable in child.variables.values() {
                variable.visit_expressions(&mut |e| {
                    if let ExprKind::Ident {
                        reference: Some(r), ..
                    } = &e.kind
                    {
                        if let Some(ei) = sibling_index(part, &path, &r.target_part) {
                            if ei != ci && r.target_part != child_path {
                                edges[ei].insert(ci);
                            }
                        }
                    }
                    true
                });
            }
        }
        let order = stable_topo(n, &edges);
        let part = root.part_at_mut(&path).unwrap();
        part.ordered_parts = order;
    }
}

/// Index of the sibling child that `target` lies within, if any.
fn sibling_index(parent: &EquationSet, parent_path: &[String], target: &[String]) -> Option<usize> {
    if target.len() <= parent_path.len() || !target.starts_with(parent_path) {
        return None;
    }
    let name = &target[parent_path.len()];
    parent.parts.iter().position(|p| &p.name == name)
}

/// Kahn's algorithm preserving declaration order among ready nodes. Cycles
/// are broken at the earliest remaining node.
fn stable_topo(n: usize, edges: &[HashSet<usize>]) -> Vec<usize> {
    let mut indegree = vec![0usize; n];
    for targets in edges {
        for &t in targets {
            indegree[t] += 1;
        }
    }
    let mut emitted = vec![false; n];
    let mut order = Vec::with_capacity(n);
    while order.len() < n {
        let next = (0..n)
            .find(|&i| !emitted[i] && indegree[i] == 0)
            .or_else(|| (0..n).find(|&i| !emitted[i]));
        let Some(i) = next else { break };
        emitted[i] = true;
        order.push(i);
        for &t in &edges[i] {
            if !emitted[t] {
                indegree[t] = indegree[t].saturating_sub(1);
            }
        }
    }
    order
}

/// Record same-part read dependencies on every variable.
pub fn collect_dependencies(root: &mut EquationSet) {
    let paths = root.part_paths();
    for path in paths {
        let part = root.part_at_mut(&path).unwrap();
        let keys: Vec<VariableKey> = part.variables.keys().cloned().collect();
        let mut all_deps: Vec<(VariableKey, Vec<VariableKey>)> = Vec::new();
        for key in &keys {
            let variable = &part.variables[key];
            let mut deps: Vec<VariableKey> = Vec::new();
            variable.visit_expressions(&mut |e| {
                if let ExprKind::Ident {
                    reference: Some(r), ..
                } = &e.kind
                {
                    if r.is_local() && r.target != *key && !deps.contains(&r.target) {
                        deps.push(r.target.clone());
                    }
                }
                true
            });
            all_deps.push((key.clone(), deps));
        }
        for (key, deps) in all_deps {
            part.variables.get_mut(&key).unwrap().depends_on = deps;
        }
    }
}

/// Order variables within each part for evaluation: definitions before
/// uses, with buffering breaking what cannot be ordered.
///
/// Reads of externally written (buffered) variables see the committed value
/// and impose no ordering edge. A dependency cycle among the rest marks the
/// cut variable `cycle`, giving it an internal buffer.
pub fn determine_order(root: &mut EquationSet) {
    let paths = root.part_paths();
    for path in paths {
        let part = root.part_at_mut(&path).unwrap();
        let keys: Vec<VariableKey> = part.variables.keys().cloned().collect();
        let n = keys.len();
        let index_of = |k: &VariableKey| keys.iter().position(|x| x == k);

        let mut edges: Vec<HashSet<usize>> = vec![HashSet::new(); n];
        for (vi, key) in keys.iter().enumerate() {
            let variable = &part.variables[key];
            for dep in &variable.depends_on {
                let Some(di) = index_of(dep) else { continue };
                let target = &part.variables[dep];
                // Buffered targets decouple producers from consumers.
                if target.has(Attribute::ExternalWrite) || target.has(Attribute::Cycle) {
                    continue;
                }
                edges[di].insert(vi);
            }
        }

        // Kahn with cycle breaking: a stuck graph marks the earliest
        // remaining variable as `cycle` and releases its outgoing edges.
        let mut indegree = vec![0usize; n];
        for targets in &edges {
            for &t in targets {
                indegree[t] += 1;
            }
        }
        let mut emitted = vec![false; n];
        let mut order: Vec<usize> = Vec::with_capacity(n);
        let mut cycles: Vec<usize> = Vec::new();
        while order.len() < n {
            if let Some(i) = (0..n).find(|&i| !emitted[i] && indegree[i] == 0) {
                emitted[i] = true;
                order.push(i);
                for &t in &edges[i] {
                    if !emitted[t] {
                        indegree[t] -= 1;
                    }
                }
            } else {
                let i = (0..n).find(|&i| !emitted[i]).unwrap();
                trace!(part = path.join("."), variable = %keys[i], "cycle broken");
                cycles.push(i);
                emitted[i] = true;
                order.push(i);
                for &t in &edges[i] {
                    if !emitted[t] {
                        indegree[t] -= 1;
                    }
                }
            }
        }

        for i in cycles {
            part.variables
                .get_mut(&keys[i])
                .unwrap()
                .add_attribute(Attribute::Cycle);
        }
        part.ordered = order.into_iter().map(|i| keys[i].clone()).collect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bindings::resolve_connection_bindings;
    use crate::resolve::resolve_rhs;
    use crate::specials::add_specials;
    use dendrite_model::Node;

    fn build(text: &str) -> EquationSet {
        let doc = Node::from_text(text).unwrap();
        let mut model = EquationSet::from_node("", &doc).unwrap();
        let mut errors = Vec::new();
        resolve_connection_bindings(&mut model, &mut errors);
        add_specials(&mut model);
        resolve_rhs(&mut model, &mut errors);
        assert!(errors.is_empty(), "{errors:?}");
        model
    }

    #[test]
    fn endpoints_precede_connections() {
        let mut model = build("C:\n pre:A\n post:B\nA:\n V:0\nB:\n V:0\n");
        sort_parts(&mut model);
        // C is declared first but must come after A and B.
        let names: Vec<&str> = model
            .ordered_parts
            .iter()
            .map(|&i| model.parts[i].name.as_str())
            .collect();
        assert_eq!(names, vec!["A", "B", "C"]);
    }

    #[test]
    fn variable_order_respects_reads() {
        let mut model = build("p:\n b:a*2\n a:1\n");
        collect_dependencies(&mut model);
        determine_order(&mut model);
        let part = model.find_part("p").unwrap();
        let a = part
            .ordered
            .iter()
            .position(|k| k == &VariableKey::new("a", 0))
            .unwrap();
        let b = part
            .ordered
            .iter()
            .position(|k| k == &VariableKey::new("b", 0))
            .unwrap();
        assert!(a < b);
    }

    #[test]
    fn cycle_marked_and_broken() {
        let mut model = build("p:\n x:y+1\n y:x+1\n");
        collect_dependencies(&mut model);
        determine_order(&mut model);
        let part = model.find_part("p").unwrap();
        let cycled = part
            .variables
            .values()
            .filter(|v| v.has(Attribute::Cycle))
            .count();
        assert_eq!(cycled, 1);
        assert_eq!(part.ordered.len(), part.variables.len());
    }
}
