//! Fixed-point exponent inference.
//!
//! Under the integer regime every stored value carries an exponent: the
//! power-of-two position of its most significant magnitude bit. Inference
//! seeds from constants, `$t'`, and `median` metadata hints, then
//! propagates through expression trees until a fixed point. A variable left
//! without an exponent refuses the model; a `median` hint on the variable
//! lifts the refusal.
//!
//! Value-level rules: multiplication adds exponents, division subtracts,
//! addition takes the wider operand. The emitter later derives storage
//! shifts from the node exponents recorded here (a product's raw stored
//! exponent is `a + b - MSB`; the shift to the declared exponent is the
//! difference).

use dendrite_model::eqset::{Attribute, EquationSet, VariableKey};
use dendrite_model::expr::{BinaryOp, Expr, ExprKind, Value, UNKNOWN_EXPONENT};
use tracing::{debug, trace};

use crate::error::{DigestError, DigestErrorKind};
use crate::specials::DEFAULT_DT;

fn exponent_of_value(v: f64) -> i32 {
    let magnitude = v.abs();
    if magnitude == 0.0 {
        return 0;
    }
    magnitude.log2().floor() as i32
}

/// Seed exponents, iterate propagation, and verify completeness.
pub fn determine_exponents(root: &mut EquationSet, errors: &mut Vec<DigestError>) {
    seed(root);
    for _ in 0..32 {
        if !propagate(root) {
            break;
        }
    }
    verify(root, errors);
}

fn seed(root: &mut EquationSet) {
    // The step period anchors time: $t' takes the exponent of the root
    // period, $t widens to cover a long run.
    let dt = root
        .find_variable(&VariableKey::new("$t", 1))
        .and_then(|v| v.default_equation())
        .and_then(|e| e.expression.as_constant())
        .and_then(Value::as_scalar)
        .unwrap_or(DEFAULT_DT);
    let dt_exponent = exponent_of_value(dt);
    let t_exponent = dt_exponent + 20; // room for ~10^6 steps

    let paths = root.part_paths();
    for path in paths {
        let part = root.part_at_mut(&path).unwrap();
        for variable in part.variables.values_mut() {
            if variable.exponent != UNKNOWN_EXPONENT {
                continue;
            }
            if variable.name == "$t" {
                variable.exponent = if variable.order == 0 {
                    t_exponent
                } else {
                    dt_exponent
                };
                continue;
            }
            // Phase indicators and probabilities live in [0, 1].
            if matches!(variable.name.as_str(), "$init" | "$connect" | "$live" | "$p") {
                variable.exponent = 0;
                continue;
            }
            if let Some(median) = variable
                .metadata
                .as_ref()
                .map(|m| m.get("median"))
                .and_then(|v| v.parse::<f64>().ok())
            {
                variable.exponent = exponent_of_value(median);
                trace!(variable = %variable.key(), exponent = variable.exponent, "hint");
                continue;
            }
            if variable.has(Attribute::Constant) || variable.is_simple_constant() {
                if let Some(Value::Scalar(v)) =
                    variable.equations.first().and_then(|e| e.expression.as_constant())
                {
                    variable.exponent = exponent_of_value(*v);
                }
            }
        }
    }
}

/// One propagation sweep; true when anything new was learned.
fn propagate(root: &mut EquationSet) -> bool {
    let mut changed = false;

    // Known variable exponents, for cross-part lookups.
    let mut known: Vec<(Vec<String>, VariableKey, i32)> = Vec::new();
    root.walk(&mut |path, part| {
        for v in part.variables.values() {
            if v.exponent != UNKNOWN_EXPONENT {
                known.push((path.to_vec(), v.key(), v.exponent));
            }
        }
    });
    let lookup = |part: &[String], key: &VariableKey| -> i32 {
        known
            .iter()
            .find(|(p, k, _)| p == part && k == key)
            .map(|(_, _, e)| *e)
            .unwrap_or(UNKNOWN_EXPONENT)
    };

    let paths = root.part_paths();
    for path in paths {
        let part = root.part_at_mut(&path).unwrap();
        for variable in part.variables.values_mut() {
            let mut inferred = variable.exponent;
            for equation in &mut variable.equations {
                if let Some(condition) = &mut equation.condition {
                    changed |= annotate(condition, &lookup);
                }
                changed |= annotate(&mut equation.expression, &lookup);
                let e = equation.expression.exponent;
                if e != UNKNOWN_EXPONENT {
                    inferred = if inferred == UNKNOWN_EXPONENT {
                        e
                    } else {
                        inferred.max(e)
                    };
                }
            }
            // An integrated variable must also hold its increment.
            if let Some(derivative) = &variable.derivative {
                let de = lookup(&path, derivative);
                if de != UNKNOWN_EXPONENT {
                    let dt = lookup(&path, &VariableKey::new("$t", 1));
                    if dt != UNKNOWN_EXPONENT {
                        let increment = de + dt;
                        inferred = if inferred == UNKNOWN_EXPONENT {
                            increment
                        } else {
                            inferred.max(increment)
                        };
                    }
                }
            }
            if inferred != variable.exponent {
                variable.exponent = inferred;
                changed = true;
            }
        }
    }
    changed
}

/// Compute the exponent of each node bottom-up. Returns true on change.
fn annotate(expr: &mut Expr, lookup: &dyn Fn(&[String], &VariableKey) -> i32) -> bool {
    let mut changed = false;
    expr.transform(&mut |e| {
        let exponent = match &e.kind {
            ExprKind::Constant(Value::Scalar(v)) => exponent_of_value(*v),
            ExprKind::Constant(_) => 0,
            ExprKind::Ident {
                reference: Some(r), ..
            } => lookup(&r.target_part, &r.target),
            ExprKind::Ident { .. } => UNKNOWN_EXPONENT,
            ExprKind::Unary { operand, .. } => operand.exponent,
            ExprKind::Binary { op, left, right } => {
                let (a, b) = (left.exponent, right.exponent);
                match op {
                    _ if op.is_boolean() => 0,
                    BinaryOp::Mul => combine(a, b, |x, y| x + y),
                    BinaryOp::Div => combine(a, b, |x, y| x - y),
                    BinaryOp::Add | BinaryOp::Sub => combine(a, b, i32::max),
                    BinaryOp::Mod => b,
                    BinaryOp::Eq
                    | BinaryOp::Ne
                    | BinaryOp::Lt
                    | BinaryOp::Le
                    | BinaryOp::Gt
                    | BinaryOp::Ge
                    | BinaryOp::And
                    | BinaryOp::Or => 0,
                    BinaryOp::Pow => {
                        if let (x, Some(Value::Scalar(k))) = (a, right.as_constant()) {
                            if x != UNKNOWN_EXPONENT {
                                x * (*k as i32)
                            } else {
                                UNKNOWN_EXPONENT
                            }
                        } else {
                            UNKNOWN_EXPONENT
                        }
                    }
                }
            }
            ExprKind::Call { name, args } => match name.as_str() {
                // Bounded outputs.
                "sin" | "cos" | "tanh" | "uniform" | "gaussian" => 0,
                "exp" => 7,
                "sqrt" => args
                    .first()
                    .map(|a| {
                        if a.exponent == UNKNOWN_EXPONENT {
                            UNKNOWN_EXPONENT
                        } else {
                            a.exponent / 2
                        }
                    })
                    .unwrap_or(UNKNOWN_EXPONENT),
                "abs" | "floor" | "ceil" | "round" => args
                    .first()
                    .map(|a| a.exponent)
                    .unwrap_or(UNKNOWN_EXPONENT),
                // Streams need a hint; the variable-level `median`
                // metadata supplies it, surfacing here as UNKNOWN.
                _ => UNKNOWN_EXPONENT,
            },
            ExprKind::Element { base, .. } => base.exponent,
            ExprKind::MatrixLiteral { rows } => rows
                .iter()
                .flatten()
                .map(|e| e.exponent)
                .filter(|&x| x != UNKNOWN_EXPONENT)
                .max()
                .unwrap_or(UNKNOWN_EXPONENT),
        };
        if exponent != e.exponent {
            e.exponent = exponent;
            changed = true;
        }
    });
    changed
}

fn combine(a: i32, b: i32, f: impl Fn(i32, i32) -> i32) -> i32 {
    if a == UNKNOWN_EXPONENT || b == UNKNOWN_EXPONENT {
        UNKNOWN_EXPONENT
    } else {
        f(a, b)
    }
}

/// Report any variable or operator still without an exponent.
fn verify(root: &mut EquationSet, errors: &mut Vec<DigestError>) {
    let paths = root.part_paths();
    for path in paths {
        let part = root.part_at(&path).unwrap();
        for variable in part.variables.values() {
            if variable.has(Attribute::Temporary) && variable.equations.is_empty() {
                continue;
            }
            if variable.exponent == UNKNOWN_EXPONENT && !variable.equations.is_empty() {
                errors.push(DigestError::at_variable(
                    DigestErrorKind::ExponentUnderdetermined,
                    &path,
                    variable.key(),
                    "no exponent could be inferred; add a 'median' hint",
                ));
            }
        }
    }
    if errors.is_empty() {
        debug!("exponents determined");
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
    fn constants_seed_exponents() {
        let mut model = build("p:\n tau:0.01\n x:tau*4\n");
        let mut errors = Vec::new();
        determine_exponents(&mut model, &mut errors);
        let part = model.find_part("p").unwrap();
        let tau = part.find_variable(&VariableKey::new("tau", 0)).unwrap();
        assert_eq!(tau.exponent, -7); // 0.01 ~ 2^-6.6
        let x = part.find_variable(&VariableKey::new("x", 0)).unwrap();
        assert_eq!(x.exponent, -5); // tau*4 ~ 2^-4.6
    }

    #[test]
    fn median_hint_used() {
        let doc = Node::from_text(
            "p:\n V:input(\"f\",0,0)\n  $metadata:\n   median:100\n",
        )
        .unwrap();
        let mut model = EquationSet::from_node("", &doc).unwrap();
        add_specials(&mut model);
        let mut errors = Vec::new();
        resolve_rhs(&mut model, &mut errors);
        determine_exponents(&mut model, &mut errors);
        assert!(errors.is_empty(), "{errors:?}");
        let v = model
            .find_part("p")
            .unwrap()
            .find_variable(&VariableKey::new("V", 0))
            .unwrap();
        assert_eq!(v.exponent, 6); // 100 ~ 2^6.6
    }

    #[test]
    fn stream_without_hint_refused() {
        let mut model = build("p:\n V:input(\"f\",0,0)\n");
        let mut errors = Vec::new();
        determine_exponents(&mut model, &mut errors);
        assert!(errors
            .iter()
            .any(|e| e.kind == DigestErrorKind::ExponentUnderdetermined));
    }
}
