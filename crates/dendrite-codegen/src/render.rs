//! Expression rendering.
//!
//! Lowers decorated expressions to Rust. Numeric context produces values of
//! the simulation scalar `T`; boolean context produces `bool`. Resolution
//! paths chain container, sub-part, and endpoint hops; instance hops cross
//! the trait boundary with a downcast, population hops are concrete.
//!
//! Under the fixed-point target every multiply, divide, and rebase carries
//! the shift that aligns stored exponents, computed from the node exponents
//! the digest recorded.

use dendrite_digest::Target;
use dendrite_model::eqset::{EquationSet, ResolveStep, VariableReference};
use dendrite_model::expr::{BinaryOp, Expr, ExprKind, UnaryOp, Value, UNKNOWN_EXPONENT};

use crate::names;

/// Lifecycle phase being emitted; decides what `$init`/`$connect`/`$live`
/// read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Init,
    Connect,
    Update,
    Derivative,
}

pub struct RenderContext<'a> {
    pub root: &'a EquationSet,
    pub part: &'a EquationSet,
    pub path: &'a [String],
    pub target: Target,
    pub phase: Phase,
    /// Column label used by `output()` calls in this variable.
    pub column: String,
    /// Set while rendering population-scope (global) equations, where
    /// `self` is the population rather than an instance.
    pub global: bool,
}

impl<'a> RenderContext<'a> {
    pub fn fixed(&self) -> bool {
        self.target == Target::Int
    }
}

const MSB: i32 = 30;

fn exponent_or(e: i32, fallback: i32) -> i32 {
    if e == UNKNOWN_EXPONENT {
        fallback
    } else {
        e
    }
}

/// Render a numeric constant at the exponent the node carries.
fn constant(ctx: &RenderContext, value: f64, exponent: i32) -> String {
    if ctx.fixed() {
        let e = exponent_or(exponent, 0);
        let stored = (value * 2f64.powi(MSB - e)).round();
        let stored = stored.clamp(i32::MIN as f64, i32::MAX as f64) as i32;
        format!("{stored}i32")
    } else {
        format!("T::from_f64({value:?})")
    }
}

/// Shift a rendered fixed value from exponent `from` to `to`.
fn rebase(ctx: &RenderContext, code: String, from: i32, to: i32) -> String {
    if !ctx.fixed() || from == UNKNOWN_EXPONENT || to == UNKNOWN_EXPONENT || from == to {
        return code;
    }
    format!("(fixed::shift(({code}) as i64, {}) as i32)", from - to)
}

/// Render `expr` as a value of `T` with stored exponent `expr.exponent`.
pub fn render(expr: &Expr, ctx: &RenderContext) -> String {
    match &expr.kind {
        ExprKind::Constant(Value::Scalar(v)) => constant(ctx, *v, expr.exponent),
        ExprKind::Constant(Value::Text(t)) => format!("{t:?}"),
        ExprKind::Constant(Value::Matrix { rows, cols, data }) => {
            let items: Vec<String> = data.iter().map(|v| format!("{v:?}")).collect();
            format!(
                "Matrix::from_rows(vec![{}])",
                (0..*rows)
                    .map(|r| {
                        let row: Vec<String> = (0..*cols)
                            .map(|c| format!("T::from_f64({})", items[r * cols + c]))
                            .collect();
                        format!("vec![{}]", row.join(", "))
                    })
                    .collect::<Vec<_>>()
                    .join(", ")
            )
        }
        ExprKind::Ident {
            name, reference, ..
        } => render_ident(expr, name, reference.as_ref(), ctx),
        ExprKind::Unary { op, operand } => match op {
            UnaryOp::Neg => format!("(-{})", render(operand, ctx)),
            UnaryOp::Not => format!(
                "(if {} {{ T::zero() }} else {{ {} }})",
                render_bool(operand, ctx),
                one(ctx, expr.exponent)
            ),
        },
        ExprKind::Binary { op, left, right } => render_binary(expr, *op, left, right, ctx),
        ExprKind::Call { name, args } => render_call(expr, name, args, ctx),
        ExprKind::Element { base, args } => render_element(expr, base, args, ctx),
        ExprKind::MatrixLiteral { rows } => {
            let rendered: Vec<String> = rows
                .iter()
                .map(|row| {
                    let cells: Vec<String> =
                        row.iter().map(|e| render(e, ctx)).collect();
                    format!("vec![{}]", cells.join(", "))
                })
                .collect();
            format!("Matrix::from_rows(vec![{}])", rendered.join(", "))
        }
    }
}

fn one(ctx: &RenderContext, exponent: i32) -> String {
    constant(ctx, 1.0, exponent_or(exponent, 0))
}

/// Render `expr` as a Rust `bool`.
pub fn render_bool(expr: &Expr, ctx: &RenderContext) -> String {
    match &expr.kind {
        ExprKind::Binary { op, left, right } if op.is_boolean() => {
            let symbol = match op {
                BinaryOp::Eq => "==",
                BinaryOp::Ne => "!=",
                BinaryOp::Lt => "<",
                BinaryOp::Le => "<=",
                BinaryOp::Gt => ">",
                BinaryOp::Ge => ">=",
                BinaryOp::And => "&&",
                BinaryOp::Or => "||",
                _ => unreachable!(),
            };
            if matches!(op, BinaryOp::And | BinaryOp::Or) {
                format!(
                    "({} {symbol} {})",
                    render_bool(left, ctx),
                    render_bool(right, ctx)
                )
            } else {
                // Comparisons align operands in the fixed regime.
                let e = exponent_or(left.exponent.max(right.exponent), 0);
                let l = rebase(ctx, render(left, ctx), left.exponent, e);
                let r = rebase(ctx, render(right, ctx), right.exponent, e);
                format!("({l} {symbol} {r})")
            }
        }
        ExprKind::Unary {
            op: UnaryOp::Not,
            operand,
        } => format!("(!{})", render_bool(operand, ctx)),
        ExprKind::Ident { name, .. } if name == "$init" => {
            (ctx.phase == Phase::Init).to_string()
        }
        ExprKind::Ident { name, .. } if name == "$connect" => {
            (ctx.phase == Phase::Connect).to_string()
        }
        ExprKind::Ident { name, .. } if name == "$live" => match ctx.phase {
            Phase::Init | Phase::Connect => "false".to_string(),
            _ => "self.get_live()".to_string(),
        },
        ExprKind::Call { name, .. } if name == "event" => {
            render(expr, ctx) // already a latch test
        }
        ExprKind::Constant(v) => v.is_true().to_string(),
        _ => format!("({} != {})", render(expr, ctx), zero(ctx)),
    }
}

fn zero(ctx: &RenderContext) -> String {
    if ctx.fixed() {
        "0i32".to_string()
    } else {
        "T::zero()".to_string()
    }
}

fn render_ident(
    expr: &Expr,
    name: &str,
    reference: Option<&VariableReference>,
    ctx: &RenderContext,
) -> String {
    // Phase indicators and scheduler state first.
    match name {
        "$init" => {
            return format!(
                "(if {} {{ {} }} else {{ {} }})",
                ctx.phase == Phase::Init,
                one(ctx, 0),
                zero(ctx)
            )
        }
        "$connect" => {
            return format!(
                "(if {} {{ {} }} else {{ {} }})",
                ctx.phase == Phase::Connect,
                one(ctx, 0),
                zero(ctx)
            )
        }
        "$live" => {
            let live = match ctx.phase {
                Phase::Init | Phase::Connect => "false".to_string(),
                _ => "self.get_live()".to_string(),
            };
            return format!("(if {live} {{ {} }} else {{ {} }})", one(ctx, 0), zero(ctx));
        }
        _ => {}
    }
    let Some(reference) = reference else {
        return format!("/* unresolved {name} */ {}", zero(ctx));
    };
    if reference.target.name == "$t" {
        return if reference.target.order == 0 {
            "sim.time()".to_string()
        } else {
            "sim.dt()".to_string()
        };
    }
    if reference.target.name == "$index" && reference.is_local() {
        let stored = if ctx.fixed() {
            "(self.index as i32)".to_string()
        } else {
            "T::from_f64(self.index as f64)".to_string()
        };
        return stored;
    }
    let access = render_access(reference, ctx);
    rebase(ctx, access, variable_exponent(reference, ctx), expr.exponent)
}

fn variable_exponent(reference: &VariableReference, ctx: &RenderContext) -> i32 {
    ctx.root
        .part_at(&reference.target_part)
        .and_then(|p| p.find_variable(&reference.target))
        .map(|v| v.exponent)
        .unwrap_or(UNKNOWN_EXPONENT)
}

/// Read access for a resolved reference.
pub fn render_access(reference: &VariableReference, ctx: &RenderContext) -> String {
    let target_part = ctx.root.part_at(&reference.target_part);
    let target_global = target_part
        .and_then(|p| p.find_variable(&reference.target))
        .map(|v| v.has(dendrite_model::eqset::Attribute::Global))
        .unwrap_or(false);
    let field = names::field(&reference.target);

    if reference.is_local() {
        return match (ctx.global, target_global) {
            (true, true) => format!("self.{field}"),
            (false, true) => {
                format!("self.population.upgrade().unwrap().borrow().{field}")
            }
            (false, false) => format!("self.{field}"),
            (true, false) => {
                // Population equations read per-instance state only through
                // explicit references; falling back keeps output readable.
                format!("self.{field}")
            }
        };
    }

    if target_global {
        // Globals live on the population: a trailing Down stops at the
        // population object itself; any other final hop reaches the target
        // instance and follows its population link.
        if let Some(ResolveStep::Down(name)) = reference.steps.last() {
            let mut shortened = reference.clone();
            shortened.steps.pop();
            shortened.target_part.pop();
            let (acc, _) = walk_steps(&shortened, ctx);
            let pop = names::population_field(name);
            return format!("{acc}.{pop}.borrow().{field}");
        }
        let (acc, _) = walk_steps(reference, ctx);
        return format!("{acc}.population.upgrade().unwrap().borrow().{field}");
    }
    let (acc, _) = walk_steps(reference, ctx);
    format!("{acc}.{field}")
}

/// Write access for a resolved reference: one statement applying `value`
/// to the target's field (its buffer, for externally written targets)
/// under the given combiner.
pub fn render_write(
    reference: &VariableReference,
    ctx: &RenderContext,
    field: &str,
    assignment: dendrite_model::eqset::Assignment,
    value: &str,
) -> String {
    use dendrite_model::eqset::Assignment;
    let apply = |place: String| -> String {
        match assignment {
            Assignment::Replace => format!("{place} = {value};"),
            Assignment::Add => format!("{place} += {value};"),
            Assignment::Multiply => format!("{place} *= {value};"),
            Assignment::Divide => format!("{place} /= {value};"),
            Assignment::Min => format!(
                "{{ let value = {value}; if value < {place} {{ {place} = value; }} }}"
            ),
            Assignment::Max => format!(
                "{{ let value = {value}; if value > {place} {{ {place} = value; }} }}"
            ),
        }
    };

    if reference.is_local() {
        return apply(format!("self.{field}"));
    }

    let target_global = ctx
        .root
        .part_at(&reference.target_part)
        .and_then(|p| p.find_variable(&reference.target))
        .map(|v| v.has(dendrite_model::eqset::Attribute::Global))
        .unwrap_or(false);
    if target_global {
        if let Some(ResolveStep::Down(name)) = reference.steps.last() {
            let mut shortened = reference.clone();
            shortened.steps.pop();
            let (acc, _) = walk_steps(&shortened, ctx);
            let pop = names::population_field(name);
            return apply(format!("{acc}.{pop}.borrow_mut().{field}"));
        }
    }

    // Instance target: clone the final hop's handle, then borrow mutably.
    let mut prefix = reference.clone();
    let last = prefix.steps.pop().unwrap();
    let (acc, mut current) = walk_steps(&prefix, ctx);
    let handle = match &last {
        ResolveStep::Up => {
            current.pop();
            format!("{acc}.container.as_ref().unwrap().upgrade().unwrap()")
        }
        ResolveStep::Down(name) => {
            current.push(name.clone());
            let pop = names::population_field(name);
            format!("{acc}.{pop}.borrow().instance.as_ref().unwrap().clone()")
        }
        ResolveStep::Endpoint(alias) => {
            if let Some(binding) = ctx
                .root
                .part_at(&current)
                .and_then(|p| p.connection_bindings.iter().find(|b| &b.alias == alias))
            {
                current = binding.endpoint.clone();
            }
            format!("{acc}.{alias}.as_ref().unwrap().clone()")
        }
    };
    let target_type = names::instance_type(&current);
    format!(
        "{{ let handle: InstanceRef<T> = {handle}; \
         let mut guard = handle.borrow_mut(); \
         let target = guard.as_any_mut().downcast_mut::<{target_type}>().unwrap(); \
         {} }}",
        apply(format!("target.{field}"))
    )
}

/// Build an owned handle (`InstanceRef<T>`) for the instance a non-local
/// reference lands on, plus that instance's concrete type name. None for
/// local references.
pub fn render_handle(
    reference: &VariableReference,
    ctx: &RenderContext,
) -> Option<(String, String)> {
    if reference.is_local() {
        return None;
    }
    let mut prefix = reference.clone();
    let last = prefix.steps.pop().unwrap();
    let (acc, mut current) = walk_steps(&prefix, ctx);
    let handle = match &last {
        ResolveStep::Up => {
            current.pop();
            format!("{acc}.container.as_ref().unwrap().upgrade().unwrap()")
        }
        ResolveStep::Down(name) => {
            current.push(name.clone());
            let pop = names::population_field(name);
            format!("{acc}.{pop}.borrow().instance.as_ref().unwrap().clone()")
        }
        ResolveStep::Endpoint(alias) => {
            if let Some(binding) = ctx
                .root
                .part_at(&current)
                .and_then(|p| p.connection_bindings.iter().find(|b| &b.alias == alias))
            {
                current = binding.endpoint.clone();
            }
            format!("{acc}.{alias}.as_ref().unwrap().clone()")
        }
    };
    let target_type = names::instance_type(&current);
    Some((handle, target_type))
}

/// Render the hops of a reference, returning the expression for the final
/// target instance (downcast to its concrete type) and the final path.
fn walk_steps(reference: &VariableReference, ctx: &RenderContext) -> (String, Vec<String>) {
    let mut acc = "self".to_string();
    let mut current: Vec<String> = ctx.path.to_vec();
    for step in &reference.steps {
        match step {
            ResolveStep::Up => {
                current.pop();
                let parent_type = names::instance_type(&current);
                acc = format!(
                    "{acc}.container.as_ref().unwrap().upgrade().unwrap().borrow()\
                     .as_any().downcast_ref::<{parent_type}>().unwrap()"
                );
            }
            ResolveStep::Down(name) => {
                current.push(name.clone());
                let child_type = names::instance_type(&current);
                let pop = names::population_field(name);
                acc = format!(
                    "{acc}.{pop}.borrow().instance.as_ref().unwrap().borrow()\
                     .as_any().downcast_ref::<{child_type}>().unwrap()"
                );
            }
            ResolveStep::Endpoint(alias) => {
                let binding = ctx
                    .root
                    .part_at(&current)
                    .and_then(|p| {
                        p.connection_bindings
                            .iter()
                            .find(|b| &b.alias == alias)
                            .cloned()
                    });
                if let Some(binding) = binding {
                    current = binding.endpoint.clone();
                }
                let endpoint_type = names::instance_type(&current);
                acc = format!(
                    "{acc}.{alias}.as_ref().unwrap().borrow()\
                     .as_any().downcast_ref::<{endpoint_type}>().unwrap()"
                );
            }
        }
    }
    (acc, current)
}

fn render_binary(
    expr: &Expr,
    op: BinaryOp,
    left: &Expr,
    right: &Expr,
    ctx: &RenderContext,
) -> String {
    if op.is_boolean() {
        return format!(
            "(if {} {{ {} }} else {{ {} }})",
            render_bool(expr, ctx),
            one(ctx, expr.exponent),
            zero(ctx)
        );
    }
    let l = render(left, ctx);
    let r = render(right, ctx);
    if ctx.fixed() {
        let (ea, eb, e) = (
            exponent_or(left.exponent, 0),
            exponent_or(right.exponent, 0),
            exponent_or(expr.exponent, 0),
        );
        return match op {
            BinaryOp::Mul => format!("fixed::multiply({l}, {r}, {})", ea + eb - MSB - e),
            BinaryOp::Div => format!("fixed::divide({l}, {r}, {})", MSB - e + ea - eb),
            BinaryOp::Add => format!(
                "({} + {})",
                rebase(ctx, l, ea, e),
                rebase(ctx, r, eb, e)
            ),
            BinaryOp::Sub => format!(
                "({} - {})",
                rebase(ctx, l, ea, e),
                rebase(ctx, r, eb, e)
            ),
            BinaryOp::Mod => format!(
                "({} % {})",
                rebase(ctx, l, ea, e),
                rebase(ctx, r, eb, e)
            ),
            BinaryOp::Pow => format!(
                "fixed::from_f64(fixed::to_f64({l}, {ea}).powf(fixed::to_f64({r}, {eb})), {e})"
            ),
            _ => unreachable!(),
        };
    }
    match op {
        BinaryOp::Add => format!("({l} + {r})"),
        BinaryOp::Sub => format!("({l} - {r})"),
        BinaryOp::Mul => format!("({l} * {r})"),
        BinaryOp::Div => format!("({l} / {r})"),
        BinaryOp::Mod => format!("({l} % {r})"),
        BinaryOp::Pow => format!("T::from_f64({l}.to_f64().powf({r}.to_f64()))"),
        _ => unreachable!(),
    }
}

fn render_call(expr: &Expr, name: &str, args: &[Expr], ctx: &RenderContext) -> String {
    let f64_of = |e: &Expr| -> String {
        if ctx.fixed() {
            format!(
                "fixed::to_f64({}, {})",
                render(e, ctx),
                exponent_or(e.exponent, 0)
            )
        } else {
            format!("{}.to_f64()", render(e, ctx))
        }
    };
    let from_f64 = |code: String, exponent: i32| -> String {
        if ctx.fixed() {
            format!("fixed::from_f64({code}, {})", exponent_or(exponent, 0))
        } else {
            format!("T::from_f64({code})")
        }
    };

    match name {
        "uniform" => from_f64("sim.uniform()".to_string(), expr.exponent),
        "gaussian" => from_f64("sim.gaussian()".to_string(), expr.exponent),
        "exp" | "sin" | "cos" | "tan" | "tanh" | "sqrt" | "abs" | "floor" | "ceil"
        | "round" => from_f64(format!("{}.{name}()", f64_of(&args[0])), expr.exponent),
        "log" => from_f64(format!("{}.ln()", f64_of(&args[0])), expr.exponent),
        "atan" => {
            if args.len() >= 2 {
                from_f64(
                    format!("{}.atan2({})", f64_of(&args[0]), f64_of(&args[1])),
                    expr.exponent,
                )
            } else {
                from_f64(format!("{}.atan()", f64_of(&args[0])), expr.exponent)
            }
        }
        "min" | "max" => from_f64(
            format!("{}.{name}({})", f64_of(&args[0]), f64_of(&args[1])),
            expr.exponent,
        ),
        "input" => {
            let file = render(&args[0], ctx);
            let column = args
                .get(2)
                .map(|c| f64_of(c))
                .unwrap_or_else(|| "0.0".to_string());
            from_f64(
                format!(
                    "sim.holders.get_input(&{file}, true, false)\
                     .map(|h| h.get(sim.time().to_f64(), ({column}) as usize))\
                     .unwrap_or(0.0)"
                ),
                expr.exponent,
            )
        }
        "output" => {
            let file = args
                .first()
                .map(|f| render(f, ctx))
                .unwrap_or_else(|| "\"\"".to_string());
            let value = args.get(1).map(|v| f64_of(v)).unwrap_or_else(|| "0.0".into());
            let mode = args
                .get(2)
                .and_then(|m| m.as_constant())
                .and_then(|v| match v {
                    Value::Text(t) => Some(t.clone()),
                    _ => None,
                })
                .unwrap_or_default();
            let column = &ctx.column;
            format!(
                "{{ let value = {value}; \
                 if let Ok(h) = sim.holders.get_output(&{file}) {{ \
                 h.trace(sim.time().to_f64(), &{column:?}, value, {mode:?}); }} \
                 {} }}",
                from_f64("value".to_string(), expr.exponent)
            )
        }
        "event" => {
            // Latch test against the bit assigned during event analysis.
            let data = ctx.part.backend_data.as_ref();
            let bit = data
                .and_then(|d| {
                    d.event_targets
                        .iter()
                        .find(|t| t.condition == args[0])
                        .map(|t| t.latch_bit)
                })
                .unwrap_or(0);
            format!("(self.flags >> {bit}) & 1 == 1")
        }
        "delay" => {
            let value = render(&args[0], ctx);
            let delay = args
                .get(1)
                .map(|d| render(d, ctx))
                .unwrap_or_else(|| zero(ctx));
            let default = args
                .get(2)
                .map(|d| render(d, ctx))
                .unwrap_or_else(|| zero(ctx));
            format!(
                "self.delay0.step(sim.time(), {delay}, {value}, {default})"
            )
        }
        "matrix" => {
            // Bare matrix() only appears under Element; render the handle.
            let file = render(&args[0], ctx);
            format!("sim.holders.get_matrix(&{file})")
        }
        "norm" => from_f64(format!("{}.abs()", f64_of(&args[0])), expr.exponent),
        _ => format!("/* unknown call {name} */ {}", zero(ctx)),
    }
}

fn render_element(expr: &Expr, base: &Expr, args: &[Expr], ctx: &RenderContext) -> String {
    let row = format!("({}) as usize", index_of(&args[0], ctx));
    let col = args
        .get(1)
        .map(|c| format!("({}) as usize", index_of(c, ctx)))
        .unwrap_or_else(|| "0usize".to_string());
    match &base.kind {
        ExprKind::Call { name, args: cargs } if name == "matrix" => {
            let file = render(&cargs[0], ctx);
            let read = format!(
                "sim.holders.get_matrix(&{file}).get({row}, {col})"
            );
            if ctx.fixed() {
                format!(
                    "fixed::from_f64({read}, {})",
                    exponent_or(expr.exponent, 0)
                )
            } else {
                format!("T::from_f64({read})")
            }
        }
        _ => format!("{}.get({row}, {col})", render(base, ctx)),
    }
}

/// Render an expression used as an integer index.
fn index_of(expr: &Expr, ctx: &RenderContext) -> String {
    if let ExprKind::Ident {
        reference: Some(r), ..
    } = &expr.kind
    {
        if r.target.name == "$index" {
            let (acc, _) = walk_steps(r, ctx);
            return if r.steps.is_empty() {
                "self.index as i64".to_string()
            } else {
                format!("{acc}.index as i64")
            };
        }
    }
    if ctx.fixed() {
        format!(
            "fixed::to_f64({}, {}) as i64",
            render(expr, ctx),
            exponent_or(expr.exponent, 0)
        )
    } else {
        format!("{}.to_f64() as i64", render(expr, ctx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dendrite_digest::{digest, Target};
    use dendrite_model::eqset::VariableKey;
    use dendrite_model::Node;

    fn decorated(text: &str) -> EquationSet {
        let doc = Node::from_text(text).unwrap();
        let mut model = dendrite_model::EquationSet::from_node("", &doc).unwrap();
        digest(&mut model, Target::Double).unwrap();
        model
    }

    fn ctx<'a>(root: &'a EquationSet, part: &'a EquationSet, path: &'a [String]) -> RenderContext<'a> {
        RenderContext {
            root,
            part,
            path,
            target: Target::Double,
            phase: Phase::Update,
            column: "x".to_string(),
            global: false,
        }
    }

    #[test]
    fn local_read_renders_self_field() {
        let model = decorated("cell:\n $n:2\n V:$init@1\n I:V*2\n");
        let cell = model.find_part("cell").unwrap();
        let path = vec!["cell".to_string()];
        let i = cell
            .find_variable(&VariableKey::new("I", 0))
            .unwrap();
        let code = render(&i.equations[0].expression, &ctx(&model, cell, &path));
        assert!(code.contains("self.V"), "{code}");
    }

    #[test]
    fn time_reads_simulator() {
        let model = decorated("cell:\n $n:2\n V:$t\n x:output(\"\",V)\n");
        let cell = model.find_part("cell").unwrap();
        let path = vec!["cell".to_string()];
        let v = cell.find_variable(&VariableKey::new("V", 0)).unwrap();
        let code = render(&v.equations[0].expression, &ctx(&model, cell, &path));
        assert_eq!(code, "sim.time()");
    }

    #[test]
    fn endpoint_read_downcasts() {
        let model =
            decorated("A:\n $n:2\n V:$init@1\nC:\n pre:A\n I:pre.V*2\n x:output(\"\",I)\n");
        let c = model.find_part("C").unwrap();
        let path = vec!["C".to_string()];
        let i = c.find_variable(&VariableKey::new("I", 0)).unwrap();
        let code = render(&i.equations[0].expression, &ctx(&model, c, &path));
        assert!(code.contains("downcast_ref::<AInstance>"), "{code}");
        assert!(code.contains(".pre.as_ref()"), "{code}");
    }

    #[test]
    fn bool_condition_renders() {
        let model = decorated("cell:\n $n:2\n V:$init@1\n spike:V>0.5@1\n  @:0\n");
        let cell = model.find_part("cell").unwrap();
        let path = vec!["cell".to_string()];
        let spike = cell.find_variable(&VariableKey::new("spike", 0)).unwrap();
        let condition = spike.equations[0].condition.as_ref().unwrap();
        let code = render_bool(condition, &ctx(&model, cell, &path));
        assert!(code.contains(">"), "{code}");
    }
}
