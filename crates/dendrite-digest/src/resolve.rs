//! Name resolution: every variable occurrence gains a `VariableReference`.
//!
//! Resolution works against a symbol table snapshot of the hierarchy, so
//! expressions can be rewritten in place without aliasing the tree. LHS
//! names run first (dotted names become write-through references), then
//! every RHS and condition expression.

use indexmap::IndexMap;
use tracing::trace;

use dendrite_model::eqset::{
    Assignment, Attribute, EquationSet, ResolveStep, Variable, VariableKey, VariableReference,
};
use dendrite_model::expr::{Expr, ExprKind, Value};

use crate::error::{DigestError, DigestErrorKind};

/// Per-part lookup snapshot.
struct Scope {
    variables: Vec<VariableKey>,
    /// Variables safe to reach through a multi-instance part.
    globals: Vec<VariableKey>,
    bindings: Vec<(String, Vec<String>)>,
    children: Vec<String>,
    /// More than one instance can exist (ambiguous for down-references).
    multi: bool,
}

type Table = IndexMap<Vec<String>, Scope>;

fn build_table(root: &EquationSet) -> Table {
    let mut table = Table::new();
    root.walk(&mut |path, part| {
        table.insert(
            path.to_vec(),
            Scope {
                variables: part.variables.keys().cloned().collect(),
                globals: part
                    .variables
                    .values()
                    .filter(|v| v.has(Attribute::Global))
                    .map(|v| v.key())
                    .collect(),
                bindings: part
                    .connection_bindings
                    .iter()
                    .map(|b| (b.alias.clone(), b.endpoint.clone()))
                    .collect(),
                children: part.parts.iter().map(|p| p.name.clone()).collect(),
                multi: part.is_connection() || part_is_multi(part),
            },
        );
    });
    table
}

/// A part is multi-instance unless its `$n` is the constant 1.
fn part_is_multi(part: &EquationSet) -> bool {
    match part.find_variable(&VariableKey::new("$n", 0)) {
        None => false,
        Some(n) => {
            if n.equations.len() != 1 || !n.equations[0].is_default() {
                return true;
            }
            !matches!(
                n.equations[0].expression.as_constant(),
                Some(Value::Scalar(v)) if *v == 1.0
            )
        }
    }
}

/// Resolve `segments.key` as seen from the part at `from`.
fn resolve_reference(
    table: &Table,
    from: &[String],
    segments: &[String],
    key: &VariableKey,
) -> Result<VariableReference, (DigestErrorKind, String)> {
    let unresolved = |message: String| (DigestErrorKind::UnresolvedReference, message);
    let mut part = from.to_vec();
    let mut steps: Vec<ResolveStep> = Vec::new();

    for (i, segment) in segments.iter().enumerate() {
        loop {
            let scope = table
                .get(&part)
                .ok_or_else(|| unresolved("internal: part vanished".into()))?;
            if let Some((alias, endpoint)) = scope
                .bindings
                .iter()
                .find(|(alias, _)| alias == segment)
            {
                steps.push(ResolveStep::Endpoint(alias.clone()));
                part = endpoint.clone();
                break;
            }
            if scope.children.iter().any(|c| c == segment) {
                part.push(segment.clone());
                let target = table.get(&part).unwrap();
                if target.multi && !(i + 1 == segments.len() && is_global(target, key)) {
                    return Err((
                        DigestErrorKind::AmbiguousReference,
                        format!("'{segment}' has multiple instances; reference is ambiguous"),
                    ));
                }
                steps.push(ResolveStep::Down(segment.clone()));
                break;
            }
            if segment == "$up" {
                if part.is_empty() {
                    return Err(unresolved("'$up' above the model root".into()));
                }
                part.pop();
                steps.push(ResolveStep::Up);
                break;
            }
            // Only the leading segment may search outward.
            if i != 0 || part.is_empty() {
                return Err(unresolved(format!("no part or alias named '{segment}'")));
            }
            part.pop();
            steps.push(ResolveStep::Up);
        }
    }

    // Locate the variable, ascending only for bare names.
    loop {
        let scope = table
            .get(&part)
            .ok_or_else(|| unresolved("internal: part vanished".into()))?;
        if scope.variables.iter().any(|v| v == key) {
            return Ok(VariableReference {
                steps,
                target_part: part.clone(),
                target: key.clone(),
            });
        }
        if !segments.is_empty() || part.is_empty() {
            return Err(unresolved(format!("no variable named '{key}'")));
        }
        part.pop();
        steps.push(ResolveStep::Up);
    }
}

/// Population-scoped variables are unambiguous even on multi parts.
fn is_global(scope: &Scope, key: &VariableKey) -> bool {
    key.name == "$n" || scope.globals.iter().any(|g| g == key)
}

/// Deferred attribute/assignment changes to referenced targets.
struct TargetUpdate {
    part: Vec<String>,
    key: VariableKey,
    attribute: Attribute,
    adopt_assignment: Option<Assignment>,
}

/// Resolve dotted LHS names into write-through references.
pub fn resolve_lhs(root: &mut EquationSet, errors: &mut Vec<DigestError>) {
    let table = build_table(root);
    let mut updates: Vec<TargetUpdate> = Vec::new();
    let paths: Vec<Vec<String>> = table.keys().cloned().collect();

    for path in &paths {
        let part = root.part_at_mut(path).unwrap();
        for variable in part.variables.values_mut() {
            if !variable.name.contains('.') || variable.name.starts_with('$') {
                continue;
            }
            let mut segments: Vec<String> =
                variable.name.split('.').map(String::from).collect();
            let leaf = segments.pop().unwrap();
            // Alias writes like `pre.$max` configure the binding for this
            // connection; they stay local for the planner to read.
            if leaf.starts_with('$')
                && segments.len() == 1
                && table[path]
                    .bindings
                    .iter()
                    .any(|(alias, _)| *alias == segments[0])
            {
                continue;
            }
            let key = VariableKey::new(leaf, variable.order);
            match resolve_reference(&table, path, &segments, &key) {
                Ok(reference) => {
                    trace!(from = path.join("."), name = %variable.name, "LHS resolved");
                    updates.push(TargetUpdate {
                        part: reference.target_part.clone(),
                        key: key.clone(),
                        attribute: Attribute::ExternalWrite,
                        adopt_assignment: Some(variable.assignment),
                    });
                    variable.reference = Some(reference);
                    variable.add_attribute(Attribute::Reference);
                }
                Err((kind, message)) => errors.push(DigestError::at_variable(
                    kind,
                    path,
                    &variable.name,
                    message,
                )),
            }
        }
    }
    apply_updates(root, updates);
}

/// Resolve every identifier in every expression.
pub fn resolve_rhs(root: &mut EquationSet, errors: &mut Vec<DigestError>) {
    let table = build_table(root);
    let mut updates: Vec<TargetUpdate> = Vec::new();
    let paths: Vec<Vec<String>> = table.keys().cloned().collect();

    for path in &paths {
        let part = root.part_at_mut(path).unwrap();
        let keys: Vec<VariableKey> = part.variables.keys().cloned().collect();
        for key in keys {
            let variable = part.variables.get_mut(&key).unwrap();
            let mut failures: Vec<(DigestErrorKind, String, String)> = Vec::new();
            for equation in &mut variable.equations {
                let mut resolver = |expr: &mut Expr| {
                    if let ExprKind::Ident {
                        path: prefix,
                        name,
                        order,
                        reference,
                    } = &mut expr.kind
                    {
                        if reference.is_some() {
                            return;
                        }
                        let target_key = VariableKey::new(name.clone(), *order);
                        match resolve_reference(&table, path, prefix, &target_key) {
                            Ok(resolved) => {
                                if resolved.target_part != *path {
                                    updates.push(TargetUpdate {
                                        part: resolved.target_part.clone(),
                                        key: resolved.target.clone(),
                                        attribute: Attribute::ExternalRead,
                                        adopt_assignment: None,
                                    });
                                }
                                *reference = Some(resolved);
                            }
                            Err((kind, message)) => {
                                failures.push((kind, format!("{target_key}"), message))
                            }
                        }
                    }
                };
                if let Some(condition) = &mut equation.condition {
                    condition.transform(&mut resolver);
                }
                equation.expression.transform(&mut resolver);
            }
            for (kind, name, message) in failures {
                errors.push(DigestError::at_variable(
                    kind,
                    path,
                    format!("{key}: {name}"),
                    message,
                ));
            }
        }
    }
    apply_updates(root, updates);
}

fn apply_updates(root: &mut EquationSet, updates: Vec<TargetUpdate>) {
    for update in updates {
        let Some(part) = root.part_at_mut(&update.part) else {
            continue;
        };
        let Some(target) = part.find_variable_mut(&update.key) else {
            continue;
        };
        target.add_attribute(update.attribute);
        if let Some(assignment) = update.adopt_assignment {
            if assignment != Assignment::Replace && target.assignment == Assignment::Replace {
                target.assignment = assignment;
            }
        }
    }
}

/// Synthesize the lower-order companions of higher-order variables and wire
/// `derivative` links.
pub fn fill_integrated(root: &mut EquationSet) {
    let paths = root.part_paths();
    for path in paths {
        let part = root.part_at_mut(&path).unwrap();
        let keys: Vec<VariableKey> = part.variables.keys().cloned().collect();
        for key in &keys {
            for order in 0..key.order {
                let lower = VariableKey::new(key.name.clone(), order);
                if !part.variables.contains_key(&lower) {
                    trace!(part = path.join("."), variable = %lower, "companion created");
                    part.variables
                        .insert(lower.clone(), Variable::new(lower));
                }
            }
        }
        // Link each variable to the one driving it, when present.
        let keys: Vec<VariableKey> = part.variables.keys().cloned().collect();
        for key in keys {
            let higher = VariableKey::new(key.name.clone(), key.order + 1);
            if part.variables.contains_key(&higher) {
                // `$t` integrates implicitly via the scheduler, not storage.
                if key.name == "$t" {
                    continue;
                }
                part.variables.get_mut(&key).unwrap().derivative = Some(higher);
            }
        }
    }
}

/// Drop stale references so a pass may run resolution again (after
/// structural rewrites such as flattening).
pub fn clear_references(root: &mut EquationSet) {
    let paths = root.part_paths();
    for path in paths {
        let part = root.part_at_mut(&path).unwrap();
        for variable in part.variables.values_mut() {
            if !variable.name.contains('.') {
                variable.reference = None;
            }
            for equation in &mut variable.equations {
                let mut clear = |expr: &mut Expr| {
                    if let ExprKind::Ident { reference, .. } = &mut expr.kind {
                        *reference = None;
                    }
                };
                if let Some(condition) = &mut equation.condition {
                    condition.transform(&mut clear);
                }
                equation.expression.transform(&mut clear);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bindings::resolve_connection_bindings;
    use crate::specials::add_specials;
    use dendrite_model::Node;

    fn build(text: &str) -> EquationSet {
        let doc = Node::from_text(text).unwrap();
        let mut model = EquationSet::from_node("", &doc).unwrap();
        let mut errors = Vec::new();
        resolve_connection_bindings(&mut model, &mut errors);
        add_specials(&mut model);
        model
    }

    fn first_reference(model: &EquationSet, part: &[&str], name: &str) -> VariableReference {
        let path: Vec<String> = part.iter().map(|s| s.to_string()).collect();
        let part = model.part_at(&path).unwrap();
        let v = part
            .find_variable(&VariableKey::parse(name))
            .unwrap();
        let mut found = None;
        v.visit_expressions(&mut |e| {
            if let ExprKind::Ident { reference, .. } = &e.kind {
                if found.is_none() {
                    found = reference.clone();
                }
            }
            true
        });
        found.unwrap()
    }

    #[test]
    fn local_resolution() {
        let mut model = build("layer:\n V:0\n I:V*2\n");
        let mut errors = Vec::new();
        resolve_rhs(&mut model, &mut errors);
        assert!(errors.is_empty(), "{errors:?}");
        let r = first_reference(&model, &["layer"], "I");
        assert!(r.is_local());
        assert_eq!(r.target, VariableKey::new("V", 0));
    }

    #[test]
    fn container_resolution_ascends() {
        let mut model = build("g:9.8\nlayer:\n V':g\n");
        let mut errors = Vec::new();
        resolve_rhs(&mut model, &mut errors);
        assert!(errors.is_empty(), "{errors:?}");
        let r = first_reference(&model, &["layer"], "V'");
        assert_eq!(r.steps, vec![ResolveStep::Up]);
        assert!(r.target_part.is_empty());
    }

    #[test]
    fn endpoint_resolution() {
        let mut model = build("A:\n V:0\nC:\n pre:A\n I:pre.V\n");
        let mut errors = Vec::new();
        resolve_rhs(&mut model, &mut errors);
        assert!(errors.is_empty(), "{errors:?}");
        let r = first_reference(&model, &["C"], "I");
        assert_eq!(r.steps[0], ResolveStep::Endpoint("pre".into()));
        assert_eq!(r.target_part, vec!["A".to_string()]);
    }

    #[test]
    fn unresolved_reported() {
        let mut model = build("layer:\n I:nothing\n");
        let mut errors = Vec::new();
        resolve_rhs(&mut model, &mut errors);
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].kind, DigestErrorKind::UnresolvedReference);
    }

    #[test]
    fn down_reference_into_multi_is_ambiguous() {
        let mut model = build("layer:\n $n:5\n V:0\ntop:\n x:layer.V\n");
        let mut errors = Vec::new();
        resolve_rhs(&mut model, &mut errors);
        assert!(errors
            .iter()
            .any(|e| e.kind == DigestErrorKind::UnresolvedReference
                || e.kind == DigestErrorKind::AmbiguousReference));
    }

    #[test]
    fn down_reference_to_population_n_allowed() {
        let mut model = build("layer:\n $n:5\n V:0\ntop:\n count:layer.$n\n");
        let mut errors = Vec::new();
        resolve_rhs(&mut model, &mut errors);
        assert!(errors.is_empty(), "{errors:?}");
    }

    #[test]
    fn lhs_write_through() {
        let mut model = build("A:\n I:+=0\n V:0\nC:\n pre:A\n pre.I:+=V*2\n V:1\n");
        let mut errors = Vec::new();
        resolve_lhs(&mut model, &mut errors);
        assert!(errors.is_empty(), "{errors:?}");
        let c = model.find_part("C").unwrap();
        let w = c.find_variable(&VariableKey::new("pre.I", 0)).unwrap();
        assert!(w.has(Attribute::Reference));
        let a = model.find_part("A").unwrap();
        let target = a.find_variable(&VariableKey::new("I", 0)).unwrap();
        assert!(target.has(Attribute::ExternalWrite));
        assert_eq!(target.assignment, Assignment::Add);
    }

    #[test]
    fn integrated_companions_created() {
        let mut model = build("layer:\n V'':1\n");
        fill_integrated(&mut model);
        let layer = model.find_part("layer").unwrap();
        assert!(layer.variables.contains_key(&VariableKey::new("V", 0)));
        assert!(layer.variables.contains_key(&VariableKey::new("V", 1)));
        let v = layer.find_variable(&VariableKey::new("V", 0)).unwrap();
        assert_eq!(v.derivative, Some(VariableKey::new("V", 1)));
        let v1 = layer.find_variable(&VariableKey::new("V", 1)).unwrap();
        assert_eq!(v1.derivative, Some(VariableKey::new("V", 2)));
    }
}
