//! Attribute inference: init-only propagation, temporary promotion,
//! liveness, storage types, and unit checking.

use dendrite_model::eqset::{Attribute, EquationSet, VariableKey};
use dendrite_model::expr::{BinaryOp, Expr, ExprKind, VarType};
use dendrite_model::units::Unit;
use tracing::trace;

use crate::error::{DigestError, DigestErrorKind};

/// Propagate `initOnly`: a variable whose every equation is gated on the
/// init/connect phases, or which derives purely from constants and other
/// init-only variables, never changes after init.
pub fn find_init_only(root: &mut EquationSet) {
    loop {
        let mut changed = false;
        // Snapshot of currently known init-only variables per part.
        let mut known: Vec<(Vec<String>, VariableKey)> = Vec::new();
        root.walk(&mut |path, part| {
            for v in part.variables.values() {
                if v.has(Attribute::InitOnly) || v.has(Attribute::Constant) {
                    known.push((path.to_vec(), v.key()));
                }
            }
        });

        let paths = root.part_paths();
        for path in paths {
            let part = root.part_at_mut(&path).unwrap();
            for variable in part.variables.values_mut() {
                if variable.has(Attribute::InitOnly)
                    || variable.has(Attribute::Preexistent)
                    || variable.derivative.is_some()
                    || variable.has(Attribute::ExternalWrite)
                    || variable.equations.is_empty()
                {
                    continue;
                }
                let phase_gated = variable
                    .equations
                    .iter()
                    .all(|e| mentions_phase(e.condition.as_ref()));
                let derived = variable.equations.iter().all(|e| {
                    reads_only_known(&e.expression, &known)
                        && e.condition
                            .as_ref()
                            .map(|c| reads_only_known(c, &known))
                            .unwrap_or(true)
                });
                if phase_gated || derived {
                    trace!(part = path.join("."), variable = %variable.key(), "initOnly");
                    variable.add_attribute(Attribute::InitOnly);
                    changed = true;
                }
            }
        }
        if !changed {
            break;
        }
    }
}

fn mentions_phase(condition: Option<&Expr>) -> bool {
    let Some(condition) = condition else {
        return false;
    };
    let mut found = false;
    condition.visit(&mut |e| {
        if let ExprKind::Ident { name, .. } = &e.kind {
            if name == "$init" || name == "$connect" {
                found = true;
            }
        }
        true
    });
    found
}

fn reads_only_known(expr: &Expr, known: &[(Vec<String>, VariableKey)]) -> bool {
    let mut ok = true;
    expr.visit(&mut |e| {
        match &e.kind {
            ExprKind::Ident {
                reference: Some(r), ..
            } => {
                if !known
                    .iter()
                    .any(|(p, k)| p == &r.target_part && k == &r.target)
                {
                    ok = false;
                }
            }
            ExprKind::Ident { reference: None, .. } => ok = false,
            // Stochastic and stream operators change between evaluations.
            ExprKind::Call { name, .. }
                if matches!(
                    name.as_str(),
                    "uniform" | "gaussian" | "input" | "event" | "delay"
                ) =>
            {
                ok = false
            }
            _ => {}
        }
        true
    });
    ok
}

/// Promote connection `$p` and `$project` to temporaries when nothing else
/// reads them; they are then evaluated on demand through the accessor
/// protocol instead of occupying stored fields.
pub fn find_temporary(root: &mut EquationSet) {
    let paths = root.part_paths();
    for path in paths {
        let part = root.part_at_mut(&path).unwrap();
        if !part.is_connection() {
            continue;
        }
        for name in ["$p", "$project"] {
            let key = VariableKey::new(name, 0);
            if let Some(variable) = part.variables.get_mut(&key) {
                if variable.user_count == 0 && !variable.has(Attribute::ExternalWrite) {
                    variable.add_attribute(Attribute::Temporary);
                    variable.add_attribute(Attribute::Accessor);
                }
            }
        }
    }
}

/// Decide how `$live` is realized for each part and tag accordingly.
/// Backing storage is chosen later from these attributes: a part that
/// cannot die reads `$live` as the constant 1; death only through a
/// container or endpoint computes it on demand.
pub fn set_attributes_live(root: &mut EquationSet) {
    let paths = root.part_paths();
    for path in paths {
        let part = root.part_at_mut(&path).unwrap();
        let own_death = part.lethal_p || !part.splits.is_empty();
        let reach_death = part.lethal_container || part.lethal_connection;
        let Some(live) = part.variables.get_mut(&VariableKey::new("$live", 0)) else {
            continue;
        };
        if own_death {
            // Stored flag bit; no attribute marks this case.
        } else if reach_death {
            live.add_attribute(Attribute::Accessor);
            live.add_attribute(Attribute::Temporary);
        } else {
            live.add_attribute(Attribute::Constant);
        }
    }
}

/// Infer storage types until a fixed point, then decorate expressions.
pub fn determine_types(root: &mut EquationSet, errors: &mut Vec<DigestError>) {
    loop {
        let mut changed = false;
        let mut types: Vec<(Vec<String>, VariableKey, VarType)> = Vec::new();
        root.walk(&mut |path, part| {
            for v in part.variables.values() {
                types.push((path.to_vec(), v.key(), v.ty));
            }
        });
        let lookup = |part: &[String], key: &VariableKey| -> VarType {
            types
                .iter()
                .find(|(p, k, _)| p == part && k == key)
                .map(|(_, _, t)| *t)
                .unwrap_or(VarType::Scalar)
        };

        let paths = root.part_paths();
        for path in paths {
            let part = root.part_at_mut(&path).unwrap();
            for variable in part.variables.values_mut() {
                let mut inferred = variable.ty;
                for equation in &variable.equations {
                    let t = expr_type(&equation.expression, &path, &lookup);
                    inferred = join_types(inferred, t);
                }
                if inferred != variable.ty {
                    if variable.ty != VarType::Scalar {
                        errors.push(DigestError::at_variable(
                            DigestErrorKind::TypeInconsistency,
                            &path,
                            variable.key(),
                            format!("conflicting types {:?} and {:?}", variable.ty, inferred),
                        ));
                    }
                    variable.ty = inferred;
                    changed = true;
                }
            }
        }
        if !changed {
            break;
        }
    }

    // Decorate expression nodes for the emitter.
    let paths = root.part_paths();
    for path in paths {
        let part = root.part_at_mut(&path).unwrap();
        let snapshot: Vec<(VariableKey, VarType)> = part
            .variables
            .values()
            .map(|v| (v.key(), v.ty))
            .collect();
        for variable in part.variables.values_mut() {
            for equation in &mut variable.equations {
                decorate_types(&mut equation.expression, &snapshot);
                if let Some(condition) = &mut equation.condition {
                    decorate_types(condition, &snapshot);
                }
            }
        }
    }
}

fn join_types(a: VarType, b: VarType) -> VarType {
    match (a, b) {
        (VarType::Scalar, other) => other,
        (other, VarType::Scalar) => other,
        (x, y) if x == y => x,
        // Matrix wins mixed arithmetic; the inconsistency is reported by
        // the caller when a non-scalar flips.
        _ => VarType::Matrix,
    }
}

fn expr_type(
    expr: &Expr,
    from: &[String],
    lookup: &dyn Fn(&[String], &VariableKey) -> VarType,
) -> VarType {
    match &expr.kind {
        ExprKind::Constant(v) => v.var_type(),
        ExprKind::Ident {
            reference: Some(r), ..
        } => lookup(&r.target_part, &r.target),
        ExprKind::Ident { .. } => VarType::Scalar,
        ExprKind::Unary { operand, .. } => expr_type(operand, from, lookup),
        ExprKind::Binary { op, left, right } => {
            if op.is_boolean() {
                VarType::Scalar
            } else {
                join_types(
                    expr_type(left, from, lookup),
                    expr_type(right, from, lookup),
                )
            }
        }
        ExprKind::Call { name, .. } => match name.as_str() {
            "matrix" => VarType::Matrix,
            _ => VarType::Scalar,
        },
        ExprKind::Element { .. } => VarType::Scalar,
        ExprKind::MatrixLiteral { .. } => VarType::Matrix,
    }
}

fn decorate_types(expr: &mut Expr, locals: &[(VariableKey, VarType)]) {
    expr.transform(&mut |e| {
        e.ty = Some(match &e.kind {
            ExprKind::Constant(v) => v.var_type(),
            ExprKind::Ident {
                reference: Some(r), ..
            } if r.is_local() => locals
                .iter()
                .find(|(k, _)| k == &r.target)
                .map(|(_, t)| *t)
                .unwrap_or(VarType::Scalar),
            ExprKind::MatrixLiteral { .. } => VarType::Matrix,
            ExprKind::Call { name, .. } if name == "matrix" => VarType::Matrix,
            _ => VarType::Scalar,
        });
    });
}

/// Propagate units through expressions and flag additions of incompatible
/// quantities.
pub fn check_units(root: &mut EquationSet, errors: &mut Vec<DigestError>) {
    let mut unit_errors: Vec<DigestError> = Vec::new();
    for _ in 0..3 {
        let mut units: Vec<(Vec<String>, VariableKey, Option<Unit>)> = Vec::new();
        root.walk(&mut |path, part| {
            for v in part.variables.values() {
                units.push((path.to_vec(), v.key(), v.unit));
            }
        });
        let lookup = |part: &[String], key: &VariableKey| -> Option<Unit> {
            units
                .iter()
                .find(|(p, k, _)| p == part && k == key)
                .and_then(|(_, _, u)| *u)
        };

        let mut changed = false;
        let paths = root.part_paths();
        for path in paths {
            let part = root.part_at_mut(&path).unwrap();
            for variable in part.variables.values_mut() {
                let mut batch = Vec::new();
                let mut inferred = variable.unit;
                for equation in &variable.equations {
                    let u = expr_unit(&equation.expression, &lookup, &mut batch);
                    if inferred.is_none() {
                        inferred = u;
                    }
                }
                for message in batch {
                    unit_errors.push(DigestError::at_variable(
                        DigestErrorKind::UnitMismatch,
                        &path,
                        variable.key(),
                        message,
                    ));
                }
                if inferred != variable.unit {
                    variable.unit = inferred;
                    changed = true;
                }
            }
        }
        if !changed {
            break;
        }
    }
    // Re-checking across iterations repeats diagnostics; keep one each.
    unit_errors.sort_by(|a, b| (&a.path, &a.message).cmp(&(&b.path, &b.message)));
    unit_errors.dedup();
    errors.append(&mut unit_errors);
}

fn expr_unit(
    expr: &Expr,
    lookup: &dyn Fn(&[String], &VariableKey) -> Option<Unit>,
    errors: &mut Vec<String>,
) -> Option<Unit> {
    match &expr.kind {
        ExprKind::Constant(_) => expr.unit,
        ExprKind::Ident {
            reference: Some(r), ..
        } => lookup(&r.target_part, &r.target),
        ExprKind::Unary { operand, .. } => expr_unit(operand, lookup, errors),
        ExprKind::Binary { op, left, right } => {
            let lu = expr_unit(left, lookup, errors);
            let ru = expr_unit(right, lookup, errors);
            match op {
                BinaryOp::Add | BinaryOp::Sub => {
                    if let (Some(a), Some(b)) = (&lu, &ru) {
                        if !a.compatible(b) {
                            errors.push(format!(
                                "cannot add '{a}' to '{b}'"
                            ));
                        }
                    }
                    lu.or(ru)
                }
                BinaryOp::Mul => combine(lu, ru, Unit::multiply),
                BinaryOp::Div => combine(lu, ru, Unit::divide),
                _ => None,
            }
        }
        _ => None,
    }
}

fn combine(
    a: Option<Unit>,
    b: Option<Unit>,
    f: impl Fn(&Unit, &Unit) -> Unit,
) -> Option<Unit> {
    match (a, b) {
        (Some(a), Some(b)) => Some(f(&a, &b)),
        (Some(a), None) | (None, Some(a)) => Some(a),
        (None, None) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolve::resolve_rhs;
    use crate::specials::add_specials;
    use dendrite_model::Node;

    fn build(text: &str) -> EquationSet {
        let doc = Node::from_text(text).unwrap();
        let mut model = EquationSet::from_node("", &doc).unwrap();
        add_specials(&mut model);
        let mut errors = Vec::new();
        resolve_rhs(&mut model, &mut errors);
        assert!(errors.is_empty(), "{errors:?}");
        model
    }

    #[test]
    fn phase_gated_is_init_only() {
        let mut model = build("p:\n x:$init@uniform()\n V:x*1.5\n");
        find_init_only(&mut model);
        let part = model.find_part("p").unwrap();
        assert!(part
            .find_variable(&VariableKey::new("x", 0))
            .unwrap()
            .has(Attribute::InitOnly));
    }

    #[test]
    fn stochastic_update_not_init_only() {
        let mut model = build("p:\n x:uniform()\n y:x\n");
        find_init_only(&mut model);
        let part = model.find_part("p").unwrap();
        assert!(!part
            .find_variable(&VariableKey::new("x", 0))
            .unwrap()
            .has(Attribute::InitOnly));
    }

    #[test]
    fn matrix_type_inferred() {
        let mut model = build("p:\n W:[1,2;3,4]\n x:W(0,1)\n");
        let mut errors = Vec::new();
        determine_types(&mut model, &mut errors);
        let part = model.find_part("p").unwrap();
        assert_eq!(
            part.find_variable(&VariableKey::new("W", 0)).unwrap().ty,
            VarType::Matrix
        );
        assert_eq!(
            part.find_variable(&VariableKey::new("x", 0)).unwrap().ty,
            VarType::Scalar
        );
    }

    #[test]
    fn unit_mismatch_reported() {
        let mut model = build("p:\n a:1;mV\n b:1;s\n c:a+b\n");
        let mut errors = Vec::new();
        check_units(&mut model, &mut errors);
        assert!(errors
            .iter()
            .any(|e| e.kind == DigestErrorKind::UnitMismatch));
    }

    #[test]
    fn compatible_units_pass() {
        let mut model = build("p:\n a:1;mV\n b:2;V\n c:a+b\n");
        let mut errors = Vec::new();
        check_units(&mut model, &mut errors);
        assert!(errors.is_empty(), "{errors:?}");
    }
}
