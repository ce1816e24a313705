//! Flattening of single-use inner compartments.
//!
//! A singleton compartment with no sub-parts of its own can be inlined into
//! its container: its variables move up under dotted names
//! (`child.variable`), and identifiers are rewritten so a later resolution
//! pass lands on the moved variables. Parts that anything else reaches as a
//! connection endpoint, split target, or cross-part reference stay put.

use dendrite_model::eqset::{EquationSet, VariableKey};
use dendrite_model::expr::{Expr, ExprKind, Value};
use tracing::debug;

/// Inline eligible children everywhere. Returns true when anything moved;
/// the caller must re-run resolution afterwards.
pub fn flatten(root: &mut EquationSet) -> bool {
    let mut changed = false;
    // Deepest-first so a chain of singletons collapses in one call.
    let mut paths = root.part_paths();
    paths.sort_by_key(|p| std::cmp::Reverse(p.len()));
    for path in paths {
        if path.is_empty() {
            continue;
        }
        let (parent_path, child_name) = path.split_at(path.len() - 1);
        let child_name = &child_name[0];
        if !eligible(root, &path) {
            continue;
        }
        debug!(part = path.join("."), "flattened into container");
        inline_child(root, parent_path, child_name);
        changed = true;
    }
    changed
}

fn eligible(root: &EquationSet, child_path: &[String]) -> bool {
    let Some(child) = root.part_at(child_path) else {
        return false;
    };
    if child.is_connection() || !child.parts.is_empty() {
        return false;
    }
    // Must be singleton: $n is absent or the constant 1.
    if let Some(n) = child.find_variable(&VariableKey::new("$n", 0)) {
        let one = n.equations.len() == 1
            && n.equations[0].is_default()
            && matches!(
                n.equations[0].expression.as_constant(),
                Some(Value::Scalar(v)) if *v == 1.0
            );
        if !(n.equations.is_empty() || one) {
            return false;
        }
    }
    // A custom step period must survive as its own part.
    if let Some(dt) = child.find_variable(&VariableKey::new("$t", 1)) {
        if !dt.equations.is_empty() {
            return false;
        }
    }
    // Specials with behavior of their own ($type, $p, $xyz, ...) pin the
    // part in place; only the injected bookkeeping set may be discarded.
    for key in child.variables.keys() {
        if key.name.starts_with('$') && !droppable_special(key) && key.name != "$t" {
            return false;
        }
    }
    let child_name = child_path.last().unwrap();
    let mut blocked = false;
    root.walk(&mut |path, part| {
        if blocked || path == child_path {
            return;
        }
        // Endpoint of some connection.
        if part
            .connection_bindings
            .iter()
            .any(|b| b.endpoint == child_path)
        {
            blocked = true;
            return;
        }
        for variable in part.variables.values() {
            // Split target (textual check; splits are not collected yet).
            if variable.name == "$type" {
                variable.visit_expressions(&mut |e| {
                    if let ExprKind::Ident { name, .. } = &e.kind {
                        if name == child_name {
                            blocked = true;
                        }
                    }
                    true
                });
            }
            // Cross-part references from anywhere but the direct container.
            if path != &child_path[..child_path.len() - 1] {
                variable.visit_expressions(&mut |e| {
                    if let ExprKind::Ident {
                        reference: Some(r), ..
                    } = &e.kind
                    {
                        if r.target_part == child_path {
                            blocked = true;
                        }
                    }
                    true
                });
            }
        }
    });
    !blocked
}

/// Specials injected by the pipeline do not migrate; the container's own
/// set covers them after the merge.
fn droppable_special(key: &VariableKey) -> bool {
    matches!(
        key.name.as_str(),
        "$t" | "$init" | "$connect" | "$live" | "$n" | "$index"
    )
}

fn inline_child(root: &mut EquationSet, parent_path: &[String], child_name: &str) {
    let parent = root.part_at_mut(&parent_path.to_vec()).unwrap();
    let position = parent
        .parts
        .iter()
        .position(|p| p.name == child_name)
        .unwrap();
    let mut child = parent.parts.remove(position);

    let local_names: Vec<VariableKey> = child
        .variables
        .keys()
        .filter(|k| !droppable_special(k))
        .cloned()
        .collect();

    for (key, mut variable) in std::mem::take(&mut child.variables) {
        if droppable_special(&key) {
            continue;
        }
        let renamed = VariableKey::new(format!("{child_name}.{}", key.name), key.order);
        variable.name = renamed.name.clone();
        variable.reference = None;
        variable.derivative = variable
            .derivative
            .map(|d| VariableKey::new(format!("{child_name}.{}", d.name), d.order));
        for equation in &mut variable.equations {
            let mut rewrite = |expr: &mut Expr| {
                rewrite_moved_ident(expr, child_name, &local_names);
            };
            if let Some(condition) = &mut equation.condition {
                condition.transform(&mut rewrite);
            }
            equation.expression.transform(&mut rewrite);
        }
        parent.variables.insert(renamed, variable);
    }

    // Container-side references `child.x` collapse to the dotted local name.
    for variable in parent.variables.values_mut() {
        for equation in &mut variable.equations {
            let mut rewrite = |expr: &mut Expr| {
                if let ExprKind::Ident {
                    path,
                    name,
                    reference,
                    ..
                } = &mut expr.kind
                {
                    if path.len() == 1 && path[0] == child_name {
                        path.clear();
                        *name = format!("{child_name}.{name}");
                        *reference = None;
                    }
                }
            };
            if let Some(condition) = &mut equation.condition {
                condition.transform(&mut rewrite);
            }
            equation.expression.transform(&mut rewrite);
        }
    }
}

/// Bare identifiers naming moved variables pick up the dotted prefix;
/// everything else is left for re-resolution.
fn rewrite_moved_ident(expr: &mut Expr, child_name: &str, local_names: &[VariableKey]) {
    if let ExprKind::Ident {
        path,
        name,
        order,
        reference,
    } = &mut expr.kind
    {
        *reference = None;
        if path.is_empty() && local_names.iter().any(|k| k.name == *name && k.order == *order)
        {
            *name = format!("{child_name}.{name}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolve::{resolve_rhs, clear_references};
    use crate::specials::add_specials;
    use dendrite_model::Node;

    fn build(text: &str) -> EquationSet {
        let doc = Node::from_text(text).unwrap();
        let mut model = EquationSet::from_node("", &doc).unwrap();
        add_specials(&mut model);
        model
    }

    #[test]
    fn singleton_chain_inlined() {
        let mut model = build("cell:\n soma:\n  V:1\n  I:V*2\n x:soma.V\n");
        let mut errors = Vec::new();
        resolve_rhs(&mut model, &mut errors);
        assert!(errors.is_empty(), "{errors:?}");
        assert!(flatten(&mut model));
        // Both singleton levels collapse into the root.
        assert!(model.find_part("cell").is_none());
        assert!(model
            .variables
            .contains_key(&VariableKey::new("cell.soma.V", 0)));
        assert!(model
            .variables
            .contains_key(&VariableKey::new("cell.x", 0)));

        clear_references(&mut model);
        let mut errors = Vec::new();
        resolve_rhs(&mut model, &mut errors);
        assert!(errors.is_empty(), "{errors:?}");
    }

    #[test]
    fn multi_instance_child_kept() {
        let mut model = build("cell:\n dendrite:\n  $n:20\n  V:1\n");
        let mut errors = Vec::new();
        resolve_rhs(&mut model, &mut errors);
        assert!(!flatten(&mut model));
        assert!(model
            .find_part("cell")
            .unwrap()
            .find_part("dendrite")
            .is_some());
    }

    #[test]
    fn connection_endpoint_kept() {
        let mut model = build("A:\n V:0\nC:\n pre:A\n");
        let mut errors = Vec::new();
        crate::bindings::resolve_connection_bindings(&mut model, &mut errors);
        resolve_rhs(&mut model, &mut errors);
        assert!(!flatten(&mut model));
    }
}
