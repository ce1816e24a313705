//! `$type` split collection and death propagation.

use dendrite_model::eqset::{Attribute, EquationSet, VariableKey};
use dendrite_model::expr::ExprKind;
use tracing::debug;

use crate::bindings::find_part;
use crate::error::{DigestError, DigestErrorKind};

/// Interpret `$type` equations.
///
/// Each equation's expression is a `+`-joined list of part names; the
/// resulting part list is one split, and the emitted `$type` write selects
/// its 1-based index. Anything in the expression that is not a part name is
/// ill-formed.
pub fn collect_splits(root: &mut EquationSet, errors: &mut Vec<DigestError>) {
    let paths = root.part_paths();
    for path in paths {
        let part = root.part_at(&path).unwrap();
        let Some(type_var) = part.find_variable(&VariableKey::new("$type", 0)) else {
            continue;
        };
        let mut splits: Vec<Vec<Vec<String>>> = Vec::new();
        let mut batch: Vec<DigestError> = Vec::new();
        for equation in &type_var.equations {
            let mut names: Vec<String> = Vec::new();
            let mut well_formed = true;
            flatten_plus(&equation.expression.kind, &mut names, &mut well_formed);
            if !well_formed {
                batch.push(DigestError::at_variable(
                    DigestErrorKind::IllFormedType,
                    &path,
                    "$type",
                    "expression must be part names joined by '+'",
                ));
                continue;
            }
            let mut split: Vec<Vec<String>> = Vec::new();
            for name in names {
                let segments: Vec<String> = name.split('.').map(String::from).collect();
                match find_part(root, &path, &segments) {
                    Some((endpoint, _)) => {
                        // A compartment cannot become a connection or the
                        // other way around.
                        let source_is_connection = part.is_connection();
                        let target = root.part_at(&endpoint).unwrap();
                        if target.is_connection() != source_is_connection {
                            batch.push(DigestError::at_variable(
                                DigestErrorKind::UnfulfilledBinding,
                                &path,
                                "$type",
                                format!(
                                    "transition between compartment and connection \
                                     ('{name}') is not supported"
                                ),
                            ));
                        } else {
                            split.push(endpoint);
                        }
                    }
                    None => batch.push(DigestError::at_variable(
                        DigestErrorKind::IllFormedType,
                        &path,
                        "$type",
                        format!("'{name}' does not name a part"),
                    )),
                }
            }
            if !split.is_empty() && !splits.contains(&split) {
                splits.push(split);
            }
        }
        errors.append(&mut batch);
        if !splits.is_empty() {
            debug!(part = path.join("."), count = splits.len(), "splits collected");
        }
        root.part_at_mut(&path).unwrap().splits = splits;
    }
}

fn flatten_plus(kind: &ExprKind, names: &mut Vec<String>, well_formed: &mut bool) {
    match kind {
        ExprKind::Binary {
            op: dendrite_model::expr::BinaryOp::Add,
            left,
            right,
        } => {
            flatten_plus(&left.kind, names, well_formed);
            flatten_plus(&right.kind, names, well_formed);
        }
        ExprKind::Ident { path, name, order, .. } if *order == 0 => {
            let mut full = path.join(".");
            if !full.is_empty() {
                full.push('.');
            }
            full.push_str(name);
            names.push(full);
        }
        // `$type=0` (or any constant) clears the pending transition.
        ExprKind::Constant(_) => {}
        _ => *well_formed = false,
    }
}

/// Determine which parts can die and why.
///
/// `lethal_p`: the part's own `$p` applies outside init, so every step
/// rolls for survival. A part targeted by a sibling's `$type` (or owning a
/// `$type`) can also vanish. Lethality propagates: instances die with
/// their container (`lethal_container`) and connections die with their
/// endpoints (`lethal_connection`).
pub fn find_death(root: &mut EquationSet) {
    let paths = root.part_paths();

    // Seed with directly lethal parts.
    for path in &paths {
        let part = root.part_at_mut(path).unwrap();
        if let Some(p) = part.find_variable(&VariableKey::new("$p", 0)) {
            let update_phase = p
                .equations
                .iter()
                .any(|e| !condition_is_init_or_connect(e.condition.as_ref()));
            if update_phase && !p.has(Attribute::InitOnly) && !p.has(Attribute::Constant) {
                part.lethal_p = true;
            }
        }
        if !part.splits.is_empty() {
            part.lethal_p = true; // a $type transition removes this instance
        }
    }

    // Propagate through containment and endpoint references.
    loop {
        let mut changed = false;
        for path in &paths {
            let part = root.part_at(path).unwrap();
            let lethal_here =
                part.lethal_p || part.lethal_container || part.lethal_connection;

            // Children of a lethal part die with it.
            if lethal_here {
                let child_names: Vec<String> =
                    part.parts.iter().map(|p| p.name.clone()).collect();
                for child in child_names {
                    let mut child_path = path.clone();
                    child_path.push(child);
                    let child_part = root.part_at_mut(&child_path).unwrap();
                    if !child_part.lethal_container {
                        child_part.lethal_container = true;
                        changed = true;
                    }
                }
            }

            // Connections die when an endpoint can die.
            let bindings: Vec<Vec<String>> = root
                .part_at(path)
                .unwrap()
                .connection_bindings
                .iter()
                .map(|b| b.endpoint.clone())
                .collect();
            for endpoint in bindings {
                let e = root.part_at(&endpoint).unwrap();
                if e.lethal_p || e.lethal_container || e.lethal_connection {
                    let part = root.part_at_mut(path).unwrap();
                    if !part.lethal_connection {
                        part.lethal_connection = true;
                        changed = true;
                    }
                }
            }
        }
        if !changed {
            break;
        }
    }
}

fn condition_is_init_or_connect(condition: Option<&dendrite_model::Expr>) -> bool {
    let Some(condition) = condition else {
        return false;
    };
    let mut init_only = false;
    condition.visit(&mut |e| {
        if let ExprKind::Ident { name, .. } = &e.kind {
            if name == "$init" || name == "$connect" {
                init_only = true;
            }
        }
        true
    });
    init_only
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
        model
    }

    #[test]
    fn splits_collected() {
        let mut model = build("larva:\n $type:V>1@adult\n V:0\nadult:\n V:0\n");
        let mut errors = Vec::new();
        collect_splits(&mut model, &mut errors);
        assert!(errors.is_empty(), "{errors:?}");
        let larva = model.find_part("larva").unwrap();
        assert_eq!(larva.splits, vec![vec![vec!["adult".to_string()]]]);
    }

    #[test]
    fn bad_split_reported() {
        let mut model = build("larva:\n $type:V>1@missing\n V:0\n");
        let mut errors = Vec::new();
        collect_splits(&mut model, &mut errors);
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].kind, DigestErrorKind::IllFormedType);
    }

    #[test]
    fn lethal_p_detected() {
        let mut model = build("cell:\n $p:0.99\n V:0\n");
        find_death(&mut model);
        assert!(model.find_part("cell").unwrap().lethal_p);
    }

    #[test]
    fn init_only_p_not_lethal() {
        let mut model = build("cell:\n $p:$connect@0.5\n V:0\n");
        find_death(&mut model);
        assert!(!model.find_part("cell").unwrap().lethal_p);
    }

    #[test]
    fn lethality_propagates_to_connection() {
        let mut model =
            build("A:\n $p:0.9\n V:0\nB:\n V:0\nC:\n pre:A\n post:B\n w:$init@1\n");
        find_death(&mut model);
        assert!(model.find_part("C").unwrap().lethal_connection);
        assert!(!model.find_part("B").unwrap().lethal_p);
    }
}
