//! Constant folding and removal of unused variables.

use std::collections::HashMap;

use dendrite_model::eqset::{Assignment, Attribute, EquationSet, VariableKey};
use dendrite_model::expr::{BinaryOp, Expr, ExprKind, UnaryOp, Value};
use tracing::{debug, trace};

/// Evaluate a pure operator over constant operands. Stateful calls
/// (`uniform`, `input`, `event`, ...) stay unevaluated.
pub fn eval_call(name: &str, args: &[Value]) -> Option<Value> {
    let scalar = |i: usize| -> Option<f64> { args.get(i).and_then(Value::as_scalar) };
    let v = match name {
        "abs" => scalar(0)?.abs(),
        "atan" => match args.len() {
            1 => scalar(0)?.atan(),
            _ => scalar(0)?.atan2(scalar(1)?),
        },
        "ceil" => scalar(0)?.ceil(),
        "cos" => scalar(0)?.cos(),
        "exp" => scalar(0)?.exp(),
        "floor" => scalar(0)?.floor(),
        "log" => scalar(0)?.ln(),
        "max" => scalar(0)?.max(scalar(1)?),
        "min" => scalar(0)?.min(scalar(1)?),
        "round" => scalar(0)?.round(),
        "sin" => scalar(0)?.sin(),
        "sqrt" => scalar(0)?.sqrt(),
        "tan" => scalar(0)?.tan(),
        "tanh" => scalar(0)?.tanh(),
        _ => return None,
    };
    Some(Value::Scalar(v))
}

fn eval_binary(op: BinaryOp, left: &Value, right: &Value) -> Option<Value> {
    let (a, b) = (left.as_scalar()?, right.as_scalar()?);
    let bool_val = |x: bool| Value::Scalar(if x { 1.0 } else { 0.0 });
    Some(match op {
        BinaryOp::Add => Value::Scalar(a + b),
        BinaryOp::Sub => Value::Scalar(a - b),
        BinaryOp::Mul => Value::Scalar(a * b),
        BinaryOp::Div => Value::Scalar(a / b),
        BinaryOp::Mod => Value::Scalar(a % b),
        BinaryOp::Pow => Value::Scalar(a.powf(b)),
        BinaryOp::Eq => bool_val(a == b),
        BinaryOp::Ne => bool_val(a != b),
        BinaryOp::Lt => bool_val(a < b),
        BinaryOp::Le => bool_val(a <= b),
        BinaryOp::Gt => bool_val(a > b),
        BinaryOp::Ge => bool_val(a >= b),
        BinaryOp::And => bool_val(a != 0.0 && b != 0.0),
        BinaryOp::Or => bool_val(a != 0.0 || b != 0.0),
    })
}

/// Fold constant subtrees of one expression in place.
pub fn fold_expr(expr: &mut Expr) {
    expr.transform(&mut |e| {
        let folded = match &e.kind {
            ExprKind::Unary { op, operand } => match (&op, operand.as_constant()) {
                (UnaryOp::Neg, Some(Value::Scalar(v))) => Some(Value::Scalar(-v)),
                (UnaryOp::Not, Some(value)) => {
                    Some(Value::Scalar(if value.is_true() { 0.0 } else { 1.0 }))
                }
                _ => None,
            },
            ExprKind::Binary { op, left, right } => {
                match (left.as_constant(), right.as_constant()) {
                    (Some(l), Some(r)) => eval_binary(*op, l, r),
                    _ => None,
                }
            }
            ExprKind::Call { name, args } => {
                let constants: Option<Vec<Value>> =
                    args.iter().map(|a| a.as_constant().cloned()).collect();
                constants.and_then(|c| eval_call(name, &c))
            }
            ExprKind::MatrixLiteral { rows } => {
                let height = rows.len();
                let width = rows.first().map(|r| r.len()).unwrap_or(0);
                let data: Option<Vec<f64>> = rows
                    .iter()
                    .flatten()
                    .map(|e| e.as_constant().and_then(Value::as_scalar))
                    .collect();
                data.map(|data| Value::Matrix {
                    rows: height,
                    cols: width,
                    data,
                })
            }
            _ => None,
        };
        if let Some(value) = folded {
            let unit = e.unit;
            *e = Expr::new(ExprKind::Constant(value));
            e.unit = unit;
        }
    });
}

/// Repeatedly fold expressions and propagate constant variables until no
/// equation changes. A variable reduced to a single unconditional constant
/// (with nothing else writing it) is tagged `constant`.
pub fn find_constants(root: &mut EquationSet) {
    loop {
        // Which variables are known constants right now?
        let mut constants: HashMap<(Vec<String>, VariableKey), Value> = HashMap::new();
        root.walk(&mut |path, part| {
            for variable in part.variables.values() {
                if foldable(variable) {
                    if let Some(value) = variable.equations[0].expression.as_constant() {
                        constants.insert((path.to_vec(), variable.key()), value.clone());
                    }
                }
            }
        });

        let mut changed = false;
        let paths = root.part_paths();
        for path in paths {
            let part = root.part_at_mut(&path).unwrap();
            for variable in part.variables.values_mut() {
                for equation in &mut variable.equations {
                    let mut substitute = |e: &mut Expr| {
                        if let ExprKind::Ident {
                            reference: Some(r), ..
                        } = &e.kind
                        {
                            let lookup = (r.target_part.clone(), r.target.clone());
                            if let Some(value) = constants.get(&lookup) {
                                *e = Expr::new(ExprKind::Constant(value.clone()));
                            }
                        }
                    };
                    let before_cond = equation.condition.clone();
                    let before_expr = equation.expression.clone();
                    if let Some(condition) = &mut equation.condition {
                        condition.transform(&mut substitute);
                        fold_expr(condition);
                    }
                    equation.expression.transform(&mut substitute);
                    fold_expr(&mut equation.expression);
                    if before_cond != equation.condition
                        || before_expr != equation.expression
                    {
                        changed = true;
                    }
                }
                // Conditions folded to a constant zero delete the equation.
                let before = variable.equations.len();
                variable.equations.retain(|e| match &e.condition {
                    Some(c) => !matches!(c.as_constant(), Some(v) if !v.is_true()),
                    None => true,
                });
                if variable.equations.len() != before {
                    changed = true;
                }
            }
        }
        if !changed {
            break;
        }
    }

    // Tag what ended up constant.
    let paths = root.part_paths();
    for path in paths {
        let part = root.part_at_mut(&path).unwrap();
        for variable in part.variables.values_mut() {
            if foldable(variable) && variable.equations[0].expression.is_constant() {
                trace!(variable = %variable.key(), "constant");
                variable.add_attribute(Attribute::Constant);
            }
        }
    }
}

/// A candidate for constant propagation: one unconditional replace-equation
/// and no other writers or special roles.
fn foldable(variable: &dendrite_model::eqset::Variable) -> bool {
    variable.equations.len() == 1
        && variable.equations[0].is_default()
        && variable.assignment == Assignment::Replace
        && variable.derivative.is_none()
        && !variable.has(Attribute::ExternalWrite)
        && !variable.has(Attribute::Preexistent)
        && !variable.has(Attribute::Cli)
        && !variable.has(Attribute::Param)
        && variable.name != "$live"
        && variable.name != "$init"
        && variable.name != "$connect"
}

/// Names whose presence keeps a variable alive regardless of readers.
fn structurally_needed(key: &VariableKey) -> bool {
    let tail = key
        .name
        .rsplit_once('.')
        .map(|(_, t)| t)
        .unwrap_or(&key.name);
    matches!(
        tail,
        "$n" | "$t"
            | "$p"
            | "$xyz"
            | "$project"
            | "$type"
            | "$live"
            | "$init"
            | "$connect"
            | "$index"
            | "$max"
            | "$min"
            | "$k"
            | "$radius"
    )
}

/// Calls with observable effects pin their variable even when nothing reads
/// it; such variables are tagged `dummy`.
fn has_side_effect(variable: &dendrite_model::eqset::Variable) -> bool {
    let mut found = false;
    variable.visit_expressions(&mut |e| {
        if let ExprKind::Call { name, .. } = &e.kind {
            if name == "output" {
                found = true;
            }
        }
        true
    });
    found
}

/// Drop variables nothing reads, writes, or needs; counts users first.
pub fn remove_unused(root: &mut EquationSet) {
    // Count readers of every resolved target.
    let mut users: HashMap<(Vec<String>, VariableKey), usize> = HashMap::new();
    root.walk(&mut |_path, part| {
        for variable in part.variables.values() {
            variable.visit_expressions(&mut |e| {
                if let ExprKind::Ident {
                    reference: Some(r), ..
                } = &e.kind
                {
                    *users
                        .entry((r.target_part.clone(), r.target.clone()))
                        .or_insert(0) += 1;
                }
                true
            });
            if let Some(reference) = &variable.reference {
                *users
                    .entry((reference.target_part.clone(), reference.target.clone()))
                    .or_insert(0) += 1;
            }
        }
    });

    let paths = root.part_paths();
    for path in paths {
        let part = root.part_at_mut(&path).unwrap();
        // Derivative links count as users within the same part.
        let derivative_targets: Vec<VariableKey> = part
            .variables
            .values()
            .filter_map(|v| v.derivative.clone())
            .collect();
        let removable: Vec<VariableKey> = part
            .variables
            .values_mut()
            .filter_map(|variable| {
                let key = variable.key();
                if has_side_effect(variable) {
                    variable.add_attribute(Attribute::Dummy);
                    return None;
                }
                let count = users
                    .get(&(path.clone(), key.clone()))
                    .copied()
                    .unwrap_or(0);
                variable.user_count = count;
                // Only fully inert specials and folded constants go;
                // ordinary state variables stay observable.
                let inert = key.name.starts_with('$') || variable.has(Attribute::Constant);
                if count == 0
                    && inert
                    && !structurally_needed(&key)
                    && !derivative_targets.contains(&key)
                    && variable.derivative.is_none()
                    && !variable.has(Attribute::Cli)
                    && !variable.has(Attribute::ExternalWrite)
                    && !variable.has(Attribute::Reference)
                {
                    Some(key)
                } else {
                    None
                }
            })
            .collect();
        for key in removable {
            debug!(part = path.join("."), variable = %key, "unused variable removed");
            part.variables.shift_remove(&key);
        }
    }
}
