//! Per-part instance emission.
//!
//! Each part becomes a struct holding its stored local variables plus the
//! bookkeeping fields the analysis called for, and an `impl Instance<T>`
//! with exactly the lifecycle functions the part needs; everything else
//! falls back to the runtime's defaults.

use dendrite_model::analysis::{BackendData, EventDelay, LiveStorage, TriggerEdge};
use dendrite_model::eqset::{Assignment, Attribute, EquationSet, Variable, VariableKey};
use dendrite_model::expr::VarType;

use crate::render::{self, Phase, RenderContext};
use crate::{names, EmitError, Settings, Writer};

fn backend<'a>(part: &'a EquationSet, path: &[String]) -> Result<&'a BackendData, EmitError> {
    part.backend_data
        .as_deref()
        .ok_or_else(|| EmitError::MissingBackendData(path.join(".")))
}

fn storage_type(ty: VarType) -> &'static str {
    match ty {
        VarType::Scalar => "T",
        VarType::Matrix => "Matrix<T>",
        VarType::Text => "String",
    }
}

fn zero_of(ty: VarType) -> &'static str {
    match ty {
        VarType::Scalar => "T::zero()",
        VarType::Matrix => "Matrix::new(0, 0)",
        VarType::Text => "String::new()",
    }
}

/// Derivative fields that carry a Runge-Kutta stack.
fn stacked(part: &EquationSet, data: &BackendData) -> Vec<String> {
    data.local_integrated
        .iter()
        .filter_map(|k| part.find_variable(k).and_then(|v| v.derivative.clone()))
        .map(|k| names::field(&k))
        .collect()
}

pub fn emit_instance(
    w: &mut Writer,
    root: &EquationSet,
    part: &EquationSet,
    path: &[String],
    settings: &Settings,
) -> Result<(), EmitError> {
    let data = backend(part, path)?;
    let name = names::instance_type(path);
    let pop = names::population_type(path);

    w.line(format!("// ---- {} ----", path.join(".")));
    w.open(format!("pub struct {name} {{"));
    if data.container_through_endpoint.is_none() {
        w.line("pub container: Option<Weak<RefCell<dyn Instance<T>>>>,");
    }
    w.line(format!("pub population: Weak<RefCell<{pop}>>,"));
    if data.needs_index {
        w.line("pub index: usize,");
    }
    w.line("pub flags: u64,");
    if data.needs_last_t {
        w.line("pub last_t: T,");
    }
    for binding in &part.connection_bindings {
        w.line(format!("pub {}: Option<InstanceRef<T>>,", binding.alias));
    }
    for key in &data.local_members {
        let variable = part.find_variable(key).unwrap();
        w.line(format!(
            "pub {}: {},",
            names::field(key),
            storage_type(variable.ty)
        ));
    }
    for key in &data.local_buffered {
        let variable = part.find_variable(key).unwrap();
        w.line(format!(
            "pub {}: {},",
            names::next_field(key),
            storage_type(variable.ty)
        ));
    }
    for key in &data.local_integrated {
        w.line(format!("pub preserve_{}: T,", names::field(key)));
    }
    for field in stacked(part, data) {
        w.line(format!("pub stack_{field}: Vec<T>,"));
    }
    for target in &data.event_targets {
        if target.timestamped {
            w.line(format!("pub event_time{}: T,", target.value_index));
        }
        if let Some(tracker) = &target.tracking_variable {
            // Trackers synthesized before backend analysis already sit in
            // the member list.
            if !data.local_members.contains(tracker) {
                w.line(format!("pub {}: T,", names::field(tracker)));
            }
        }
    }
    for source in &data.event_sources {
        w.line(format!(
            "pub monitors{}: Vec<InstanceRef<T>>,",
            source.target_index
        ));
    }
    if !data.event_targets.is_empty() {
        w.line("pub myself: Option<Weak<RefCell<dyn Instance<T>>>>,");
    }
    for i in 0..data.delays {
        w.line(format!("pub delay{i}: DelayBuffer<T>,"));
    }
    if !part.splits.is_empty() {
        w.line("pub type_select: usize,");
        w.line("pub split_targets: Vec<Vec<PopulationRef<T>>>,");
    }
    for child in &part.parts {
        let child_path: Vec<String> =
            path.iter().cloned().chain([child.name.clone()]).collect();
        w.line(format!(
            "pub {}: Rc<RefCell<{}>>,",
            names::population_field(&child.name),
            names::population_type(&child_path)
        ));
    }
    w.close("}");
    w.line("");

    emit_constructor(w, part, path, data);
    emit_impl(w, root, part, path, data, settings)?;
    Ok(())
}

fn emit_constructor(w: &mut Writer, part: &EquationSet, path: &[String], data: &BackendData) {
    let name = names::instance_type(path);
    let pop = names::population_type(path);
    w.open(format!("impl {name} {{"));
    w.open(format!(
        "pub fn new(container: Option<Weak<RefCell<dyn Instance<T>>>>, \
         population: Weak<RefCell<{pop}>>) -> Self {{"
    ));
    if data.container_through_endpoint.is_some() {
        w.line("let _ = container;");
    }
    w.open("Self {");
    if data.container_through_endpoint.is_none() {
        w.line("container,");
    }
    w.line("population,");
    if data.needs_index {
        w.line("index: 0,");
    }
    w.line("flags: 0,");
    if data.needs_last_t {
        w.line("last_t: T::zero(),");
    }
    for binding in &part.connection_bindings {
        w.line(format!("{}: None,", binding.alias));
    }
    for key in &data.local_members {
        let variable = part.find_variable(key).unwrap();
        w.line(format!("{}: {},", names::field(key), zero_of(variable.ty)));
    }
    for key in &data.local_buffered {
        let variable = part.find_variable(key).unwrap();
        w.line(format!(
            "{}: {},",
            names::next_field(key),
            zero_of(variable.ty)
        ));
    }
    for key in &data.local_integrated {
        w.line(format!("preserve_{}: T::zero(),", names::field(key)));
    }
    for field in stacked(part, data) {
        w.line(format!("stack_{field}: Vec::new(),"));
    }
    for target in &data.event_targets {
        if target.timestamped {
            w.line(format!("event_time{}: T::zero(),", target.value_index));
        }
        if let Some(tracker) = &target.tracking_variable {
            if !data.local_members.contains(tracker) {
                w.line(format!("{}: T::zero(),", names::field(tracker)));
            }
        }
    }
    for source in &data.event_sources {
        w.line(format!("monitors{}: Vec::new(),", source.target_index));
    }
    if !data.event_targets.is_empty() {
        w.line("myself: None,");
    }
    for i in 0..data.delays {
        w.line(format!("delay{i}: DelayBuffer::default(),"));
    }
    if !part.splits.is_empty() {
        w.line("type_select: 0,");
        w.line("split_targets: Vec::new(),");
    }
    for child in &part.parts {
        let child_path: Vec<String> =
            path.iter().cloned().chain([child.name.clone()]).collect();
        w.line(format!(
            "{}: {}::shared(),",
            names::population_field(&child.name),
            names::population_type(&child_path)
        ));
    }
    w.close("}");
    w.close("}");
    w.line("");

    // Hand nested populations their container link once the Rc exists.
    w.open("pub fn wire(&mut self, myself: &InstanceRef<T>) {");
    if part.parts.is_empty() && data.event_targets.is_empty() {
        w.line("let _ = myself;");
    }
    if !data.event_targets.is_empty() {
        w.line("self.myself = Some(Rc::downgrade(myself));");
    }
    for child in &part.parts {
        w.line(format!(
            "self.{}.borrow_mut().container = Some(Rc::downgrade(myself));",
            names::population_field(&child.name)
        ));
    }
    w.close("}");
    w.close("}");
    w.line("");
}

/// Emit one variable's equations as an if/else-if chain in declaration
/// order: the default (unconditional) equation lands in the trailing
/// `else`; a temporary with no default falls through to zero.
fn multiconditional(
    w: &mut Writer,
    part: &EquationSet,
    variable: &Variable,
    ctx: &RenderContext,
) {
    let key = variable.key();
    if key.name == "$type" {
        emit_type_selection(w, part, variable, ctx);
        return;
    }

    let temporary = variable.has(Attribute::Temporary) || variable.has(Attribute::Dummy);
    let buffered =
        variable.has(Attribute::ExternalWrite) || variable.has(Attribute::Cycle);

    // Write-through variables apply their combiner to the referenced
    // target's buffer instead of a local field.
    let write_through = if variable.has(Attribute::Reference) {
        variable.reference.clone()
    } else {
        None
    };

    let destination = if temporary {
        names::field(&key)
    } else if buffered {
        format!("self.{}", names::next_field(&key))
    } else {
        format!("self.{}", names::field(&key))
    };

    let assign = |value: String| -> String {
        if let Some(reference) = &write_through {
            let target = ctx
                .root
                .part_at(&reference.target_part)
                .and_then(|p| p.find_variable(&reference.target));
            let field = match target {
                Some(t) if t.has(Attribute::ExternalWrite) => {
                    names::next_field(&reference.target)
                }
                _ => names::field(&reference.target),
            };
            return render::render_write(
                reference,
                ctx,
                &field,
                variable.assignment,
                &value,
            );
        }
        match variable.assignment {
            Assignment::Replace => format!("{destination} = {value};"),
            Assignment::Add => format!("{destination} += {value};"),
            Assignment::Multiply => format!("{destination} *= {value};"),
            Assignment::Divide => format!("{destination} /= {value};"),
            Assignment::Min => format!(
                "{{ let value = {value}; if value < {destination} \
                 {{ {destination} = value; }} }}"
            ),
            Assignment::Max => format!(
                "{{ let value = {value}; if value > {destination} \
                 {{ {destination} = value; }} }}"
            ),
        }
    };

    let applicable: Vec<&dendrite_model::eqset::EquationEntry> = variable
        .equations
        .iter()
        .filter(|e| phase_admits(e.condition.as_ref(), ctx.phase))
        .collect();
    let conditional: Vec<_> = applicable
        .iter()
        .filter(|e| e.condition.is_some())
        .collect();
    let default = applicable.iter().find(|e| e.is_default());

    if temporary {
        w.line(format!("let mut {destination}: T = T::zero();"));
    }
    if conditional.is_empty() {
        if let Some(equation) = default {
            w.line(assign(render::render(&equation.expression, ctx)));
        }
        return;
    }
    for (i, equation) in conditional.iter().enumerate() {
        let condition = equation.condition.as_ref().unwrap();
        let head = if i == 0 { "if" } else { "} else if" };
        w.open(format!("{head} {} {{", render::render_bool(condition, ctx)));
        w.line(assign(render::render(&equation.expression, ctx)));
        w.indent -= 1;
    }
    match default {
        Some(equation) => {
            w.open("} else {");
            w.line(assign(render::render(&equation.expression, ctx)));
            w.close("}");
        }
        None => w.line("}"),
    }
}

/// `$type` equations choose a 1-based split index.
fn emit_type_selection(
    w: &mut Writer,
    part: &EquationSet,
    variable: &Variable,
    ctx: &RenderContext,
) {
    let mut emitted = 0usize;
    for equation in &variable.equations {
        let Some(condition) = &equation.condition else {
            continue;
        };
        let head = if emitted == 0 { "if" } else { "} else if" };
        w.open(format!("{head} {} {{", render::render_bool(condition, ctx)));
        let split = emitted.min(part.splits.len().saturating_sub(1)) + 1;
        w.line(format!("self.type_select = {split};"));
        w.indent -= 1;
        emitted += 1;
    }
    if emitted > 0 {
        w.line("}");
    }
}

/// Statically prune equations that cannot apply in this phase.
fn phase_admits(condition: Option<&dendrite_model::Expr>, phase: Phase) -> bool {
    use dendrite_model::expr::ExprKind;
    let Some(condition) = condition else {
        return true;
    };
    if let ExprKind::Ident { name, .. } = &condition.kind {
        match name.as_str() {
            "$init" => return phase == Phase::Init,
            "$connect" => return phase == Phase::Connect || phase == Phase::Init,
            _ => {}
        }
    }
    true
}

fn context<'a>(
    root: &'a EquationSet,
    part: &'a EquationSet,
    path: &'a [String],
    settings: &Settings,
    phase: Phase,
    column: String,
) -> RenderContext<'a> {
    RenderContext {
        root,
        part,
        path,
        target: settings.target,
        phase,
        column,
        global: false,
    }
}

fn column_of(path: &[String], variable: &Variable) -> String {
    let mut column = path.join(".");
    if !column.is_empty() {
        column.push('.');
    }
    column.push_str(&variable.name);
    column
}

fn emit_impl(
    w: &mut Writer,
    root: &EquationSet,
    part: &EquationSet,
    path: &[String],
    data: &BackendData,
    settings: &Settings,
) -> Result<(), EmitError> {
    let name = names::instance_type(path);
    w.open(format!("impl Instance<T> for {name} {{"));
    w.line("fn as_any(&self) -> &dyn Any { self }");
    w.line("fn as_any_mut(&mut self) -> &mut dyn Any { self }");
    w.line("");

    let ordered = |keys: &[VariableKey]| -> Vec<&Variable> {
        part.ordered
            .iter()
            .filter(|k| keys.contains(k))
            .filter_map(|k| part.find_variable(k))
            .collect()
    };

    // init: evaluate init-phase equations, settle buffers, bring nested
    // populations online.
    if !data.local_init.is_empty() || !part.parts.is_empty() || !data.event_targets.is_empty()
    {
        w.open("fn init(&mut self, sim: &mut Simulator<T>) {");
        for variable in ordered(&data.local_init) {
            // Command-line parameters were placed before init ran.
            if variable.has(Attribute::Cli) {
                continue;
            }
            let ctx = context(
                root,
                part,
                path,
                settings,
                Phase::Init,
                column_of(path, variable),
            );
            multiconditional(w, part, variable, &ctx);
        }
        for key in &data.local_buffered {
            w.line(format!(
                "self.{} = self.{};",
                names::field(key),
                names::next_field(key)
            ));
        }
        if !part.splits.is_empty() {
            // Cache the sibling populations each split spawns into; init
            // runs with no outer borrows, so reaching the container is safe.
            w.line("self.split_targets.clear();");
            for split in &part.splits {
                w.open("self.split_targets.push(vec![");
                for target in split {
                    if target == path {
                        continue;
                    }
                    let pop = names::population_field(target.last().unwrap());
                    let container_type =
                        names::instance_type(&target[..target.len() - 1]);
                    w.line(format!(
                        "self.container.as_ref().unwrap().upgrade().unwrap().borrow()\
                         .as_any().downcast_ref::<{container_type}>().unwrap()\
                         .{pop}.clone() as PopulationRef<T>,"
                    ));
                }
                w.close("]);");
            }
        }
        // Register with the instances whose state each event watches.
        if !data.event_targets.is_empty() {
            w.open(
                "if let Some(me) = self.myself.as_ref().and_then(|w| w.upgrade()) {",
            );
            for target in &data.event_targets {
                let ctx =
                    context(root, part, path, settings, Phase::Init, String::new());
                let mut remote: Option<(String, String)> = None;
                target.condition.visit(&mut |e| {
                    if let dendrite_model::expr::ExprKind::Ident {
                        reference: Some(r),
                        ..
                    } = &e.kind
                    {
                        if remote.is_none() {
                            remote = render::render_handle(r, &ctx);
                        }
                    }
                    true
                });
                match remote {
                    Some((handle, source_type)) => {
                        w.open("{");
                        w.line(format!("let handle: InstanceRef<T> = {handle};"));
                        w.line("let mut guard = handle.borrow_mut();");
                        w.open(format!(
                            "if let Some(source) = \
                             guard.as_any_mut().downcast_mut::<{source_type}>() {{"
                        ));
                        w.line(format!(
                            "source.monitors{}.push(me.clone());",
                            target.value_index
                        ));
                        w.close("}");
                        w.close("}");
                    }
                    None => {
                        w.line(format!(
                            "self.monitors{}.push(me.clone());",
                            target.value_index
                        ));
                    }
                }
            }
            w.close("}");
        }
        for child in &part.parts {
            w.line(format!(
                "sim.request_init(&(self.{}.clone() as PopulationRef<T>));",
                names::population_field(&child.name)
            ));
        }
        w.close("}");
        w.line("");
    }

    // integrate: advance each integrated variable by dt.
    if !data.local_integrated.is_empty() {
        w.open("fn integrate(&mut self, sim: &mut Simulator<T>, dt: T) {");
        for key in &data.local_integrated {
            let variable = part.find_variable(key).unwrap();
            let derivative = variable.derivative.clone().unwrap();
            let field = names::field(key);
            let dfield = names::field(&derivative);
            let increment = if settings.target == dendrite_digest::Target::Int {
                let ve = variable.exponent;
                let de = part
                    .find_variable(&derivative)
                    .map(|d| d.exponent)
                    .unwrap_or(0);
                let dte = root
                    .find_variable(&VariableKey::new("$t", 1))
                    .map(|v| v.exponent)
                    .unwrap_or(0);
                format!("fixed::multiply(self.{dfield}, dt, {})", de + dte - 30 - ve)
            } else {
                format!("self.{dfield} * dt")
            };
            w.open("if sim.preserving() {");
            w.line(format!("self.{field} = self.preserve_{field} + {increment};"));
            w.close("} else {");
            w.indent += 1;
            w.line(format!("self.{field} = self.{field} + {increment};"));
            w.close("}");
        }
        w.close("}");
        w.line("");
    }

    // update: evaluate order-0 equations.
    if !data.local_update.is_empty() || !part.parts.is_empty() {
        w.open("fn update(&mut self, sim: &mut Simulator<T>) {");
        for variable in ordered(&data.local_update) {
            let ctx = context(
                root,
                part,
                path,
                settings,
                Phase::Update,
                column_of(path, variable),
            );
            multiconditional(w, part, variable, &ctx);
        }
        for child in &part.parts {
            w.line(format!(
                "{{ let pop = self.{}.clone(); pop.borrow_mut().update(sim); }}",
                names::population_field(&child.name)
            ));
        }
        w.close("}");
        w.line("");
    }

    emit_finalize(w, root, part, path, data, settings);
    emit_derivative_phase(w, root, part, path, data, settings);
    emit_integrator_support(w, part, data);
    emit_structure_accessors(w, root, part, path, data, settings);
    emit_event_support(w, root, part, path, data, settings);

    w.close("}");
    w.line("");
    Ok(())
}

fn emit_finalize(
    w: &mut Writer,
    root: &EquationSet,
    part: &EquationSet,
    path: &[String],
    data: &BackendData,
    settings: &Settings,
) {
    let needs = !data.local_buffered.is_empty()
        || !data.event_sources.is_empty()
        || part.lethal_p
        || !part.parts.is_empty()
        || !part.splits.is_empty();
    if !needs {
        return;
    }
    w.open("fn finalize(&mut self, sim: &mut Simulator<T>) -> bool {");

    // Commit buffers; combiner accumulators reset to their identity.
    for key in &data.local_buffered {
        let variable = part.find_variable(key).unwrap();
        let field = names::field(key);
        let next = names::next_field(key);
        w.line(format!("self.{field} = self.{next};"));
        if data.local_buffered_external_write.contains(key) {
            let identity = match variable.assignment {
                Assignment::Add => Some("T::zero()"),
                Assignment::Multiply | Assignment::Divide => Some("T::one()"),
                Assignment::Min => Some("T::max_value()"),
                Assignment::Max => Some("T::min_value()"),
                Assignment::Replace => None,
            };
            if let Some(identity) = identity {
                w.line(format!("self.{next} = {identity};"));
            }
        }
    }

    // Scan monitored instances for trigger edges. A part watching its own
    // state appears in its own monitor list while `finalize` already holds
    // the mutable borrow, so that case routes through `self` directly.
    for source in &data.event_sources {
        let index = source.target_index;
        let may_self_monitor = source.monitored_part == path;
        w.open(format!("for monitor in self.monitors{index}.clone() {{"));
        if may_self_monitor {
            w.line(
                "let own = self.myself.as_ref().and_then(|w| w.upgrade())\
                 .map(|me| same_instance(&me, &monitor)).unwrap_or(false);",
            );
            w.line(format!(
                "let fired = if own {{ self.event_test(sim, {index}) }} \
                 else {{ monitor.borrow_mut().event_test(sim, {index}) }};"
            ));
            w.open("if fired {");
            w.line(format!(
                "let delay = if own {{ self.event_delay(sim, {index}) }} \
                 else {{ monitor.borrow_mut().event_delay(sim, {index}) }};"
            ));
            w.open("if delay < T::zero() {");
            w.line(format!(
                "if own {{ self.set_latch({index}); }} \
                 else {{ monitor.borrow_mut().set_latch({index}); }}"
            ));
        } else {
            w.open(format!("if monitor.borrow_mut().event_test(sim, {index}) {{"));
            w.line(format!(
                "let delay = monitor.borrow_mut().event_delay(sim, {index});"
            ));
            w.open("if delay < T::zero() {");
            w.line(format!("monitor.borrow_mut().set_latch({index});"));
        }
        w.close("} else {");
        w.indent += 1;
        w.line(format!(
            "sim.schedule_spike(SpikeTarget::Single(monitor.clone()), delay, {index}, {});",
            source.latch_only
        ));
        w.close("}");
        w.close("}");
        w.close("}");
    }

    // Survival roll against $p.
    if part.lethal_p && part.splits.is_empty() {
        if let Some(p) = part.find_variable(&VariableKey::new("$p", 0)) {
            let probability = if p.has(Attribute::Temporary) {
                "self.get_p(sim)".to_string()
            } else {
                let field = names::field(&p.key());
                if settings.target == dendrite_digest::Target::Int {
                    format!("fixed::to_f64(self.{field}, {})", p.exponent.max(0))
                } else {
                    format!("self.{field}.to_f64()")
                }
            };
            w.open(format!("if sim.uniform() >= {probability} {{"));
            w.line("self.die(sim);");
            w.line("return false;");
            w.close("}");
        }
    }

    if !part.splits.is_empty() {
        w.open("if self.type_select != 0 {");
        w.line("// Transition: spawn the split targets, then leave.");
        w.open("for target in self.split_targets[self.type_select - 1].clone() {");
        w.line("let n = target.borrow().get_n();");
        w.line("sim.request_resize(&target, n + 1);");
        w.close("}");
        w.line("self.die(sim);");
        w.line("return false;");
        w.close("}");
    }

    for child in &part.parts {
        w.line(format!(
            "{{ let pop = self.{}.clone(); pop.borrow_mut().finalize(sim); }}",
            names::population_field(&child.name)
        ));
    }

    let _ = root;
    if data.flags.live.is_some() {
        w.line("self.get_live()");
    } else {
        w.line("true");
    }
    w.close("}");
    w.line("");
}

fn emit_derivative_phase(
    w: &mut Writer,
    root: &EquationSet,
    part: &EquationSet,
    path: &[String],
    data: &BackendData,
    settings: &Settings,
) {
    if data.local_derivative.is_empty() {
        return;
    }
    w.open("fn update_derivative(&mut self, sim: &mut Simulator<T>) {");
    for key in &data.local_derivative {
        let variable = part.find_variable(key).unwrap();
        let ctx = context(
            root,
            part,
            path,
            settings,
            Phase::Derivative,
            column_of(path, variable),
        );
        multiconditional(w, part, variable, &ctx);
    }
    w.close("}");
    w.line("");
}

/// Runge-Kutta support: snapshot/restore plus the derivative stack.
fn emit_integrator_support(w: &mut Writer, part: &EquationSet, data: &BackendData) {
    if data.local_integrated.is_empty() {
        return;
    }
    let integrated: Vec<String> = data
        .local_integrated
        .iter()
        .map(|k| names::field(k))
        .collect();
    let derivatives = stacked(part, data);

    w.open("fn snapshot(&mut self) {");
    for field in &integrated {
        w.line(format!("self.preserve_{field} = self.{field};"));
    }
    w.close("}");
    w.line("");

    w.open("fn restore(&mut self) {");
    for field in &integrated {
        w.line(format!("self.{field} = self.preserve_{field};"));
    }
    w.close("}");
    w.line("");

    w.open("fn push_derivative(&mut self) {");
    for field in &derivatives {
        w.line(format!("self.stack_{field}.push(self.{field});"));
    }
    w.close("}");
    w.line("");

    w.open("fn multiply_add_to_stack(&mut self, weight: u32) {");
    for field in &derivatives {
        w.line(format!(
            "*self.stack_{field}.last_mut().unwrap() += \
             self.{field}.times(weight as i64);"
        ));
    }
    w.close("}");
    w.line("");

    w.open("fn multiply(&mut self, factor: f64) {");
    for field in &derivatives {
        w.line(format!(
            "*self.stack_{field}.last_mut().unwrap() = \
             T::from_f64(self.stack_{field}.last().unwrap().to_f64() * factor);"
        ));
    }
    w.close("}");
    w.line("");

    w.open("fn add_to_members(&mut self) {");
    for field in &derivatives {
        w.line(format!("self.{field} = self.stack_{field}.pop().unwrap();"));
    }
    w.close("}");
    w.line("");
}

fn emit_structure_accessors(
    w: &mut Writer,
    root: &EquationSet,
    part: &EquationSet,
    path: &[String],
    data: &BackendData,
    settings: &Settings,
) {
    if data.needs_index {
        w.line("fn get_index(&self) -> usize { self.index }");
        w.line("");
    }

    match data.live_storage {
        LiveStorage::Stored => {
            let bit = data.flags.live.unwrap();
            w.line(format!(
                "fn get_live(&self) -> bool {{ (self.flags >> {bit}) & 1 == 1 }}"
            ));
            w.line("");
        }
        LiveStorage::Accessor => {
            let reach = if let Some(binding) = part.connection_bindings.first() {
                format!(
                    "self.{}.as_ref().map(|e| e.borrow().get_live()).unwrap_or(false)",
                    binding.alias
                )
            } else {
                "self.container.as_ref().and_then(|c| c.upgrade())\
                 .map(|c| c.borrow().get_live()).unwrap_or(true)"
                    .to_string()
            };
            w.line(format!("fn get_live(&self) -> bool {{ {reach} }}"));
            w.line("");
        }
        LiveStorage::Constant => {}
    }

    if let Some(bit) = data.flags.newborn {
        w.line(format!(
            "fn get_newborn(&self) -> bool {{ (self.flags >> {bit}) & 1 == 1 }}"
        ));
        w.line("");
    }

    if part.is_connection() {
        w.open("fn set_part(&mut self, index: usize, part: &InstanceRef<T>) {");
        w.open("match index {");
        for binding in &part.connection_bindings {
            w.line(format!(
                "{} => self.{} = Some(part.clone()),",
                binding.index, binding.alias
            ));
        }
        w.line("_ => {}");
        w.close("}");
        w.close("}");
        w.line("");
        w.open("fn get_part(&self, index: usize) -> Option<InstanceRef<T>> {");
        w.open("match index {");
        for binding in &part.connection_bindings {
            w.line(format!("{} => self.{}.clone(),", binding.index, binding.alias));
        }
        w.line("_ => None,");
        w.close("}");
        w.close("}");
        w.line("");
    }

    // Connection probability, evaluated on demand.
    if let Some(p) = part.find_variable(&VariableKey::new("$p", 0)) {
        if p.has(Attribute::Temporary) {
            w.open("fn get_p(&mut self, sim: &mut Simulator<T>) -> f64 {");
            let ctx = context(root, part, path, settings, Phase::Connect, String::new());
            multiconditional(w, part, p, &ctx);
            let field = names::field(&p.key());
            if settings.target == dendrite_digest::Target::Int {
                w.line(format!("fixed::to_f64({field}, {})", p.exponent.max(0)));
            } else {
                w.line(format!("{field}.to_f64()"));
            }
            w.close("}");
            w.line("");
        }
    }

    if let Some(xyz) = part.find_variable(&VariableKey::new("$xyz", 0)) {
        let field = names::field(&xyz.key());
        w.open("fn get_xyz(&mut self, _sim: &mut Simulator<T>) -> [f64; 3] {");
        w.line(format!(
            "[self.{field}.get(0, 0).to_f64(), self.{field}.get(1, 0).to_f64(), \
             self.{field}.get(2, 0).to_f64()]"
        ));
        w.close("}");
        w.line("");
    }

    if let Some(cm) = &part.connection_matrix {
        w.open("fn map_index(&self, index: usize, coordinate: i64) -> i64 {");
        w.line(format!(
            "// identity maps for bindings {} and {}",
            cm.row_binding, cm.col_binding
        ));
        w.line("let _ = index;");
        w.line("coordinate");
        w.close("}");
        w.line("");
    }

    w.open("fn die(&mut self, sim: &mut Simulator<T>) {");
    w.line("let _ = sim;");
    if let Some(bit) = data.flags.live {
        w.line(format!("self.flags &= !(1u64 << {bit});"));
    }
    for binding in &part.connection_bindings {
        w.line(format!("self.{} = None;", binding.alias));
    }
    if data.needs_index {
        w.open("if let Some(pop) = self.population.upgrade() {");
        w.line("pop.borrow_mut().release(self.index);");
        w.close("}");
    } else {
        w.open("if let Some(pop) = self.population.upgrade() {");
        w.line("pop.borrow_mut().release(0);");
        w.close("}");
    }
    w.close("}");
    w.line("");

    w.open("fn path(&self) -> String {");
    let label = path.join(".");
    if data.needs_index {
        w.line(format!("format!(\"{label}[{{}}]\", self.index)"));
    } else {
        w.line(format!("{label:?}.to_string()"));
    }
    w.close("}");
    w.line("");
}

fn emit_event_support(
    w: &mut Writer,
    root: &EquationSet,
    part: &EquationSet,
    path: &[String],
    data: &BackendData,
    settings: &Settings,
) {
    if data.event_targets.is_empty() {
        return;
    }

    w.open("fn event_test(&mut self, sim: &mut Simulator<T>, target: usize) -> bool {");
    w.open("match target {");
    for target in &data.event_targets {
        let ctx = context(root, part, path, settings, Phase::Update, String::new());
        let current = render::render(&target.condition, &ctx);
        let test = match target.edge {
            TriggerEdge::Nonzero => {
                if target.timestamped {
                    format!(
                        "{{ let after = {current}; \
                         let fired = after != T::zero() && self.event_time{i} != sim.time(); \
                         if fired {{ self.event_time{i} = sim.time(); }} fired }}",
                        i = target.value_index
                    )
                } else {
                    format!("({current}) != T::zero()")
                }
            }
            edge => {
                let before = match &target.tracking_variable {
                    Some(tracker) => format!("self.{}", names::field(tracker)),
                    None => current.clone(),
                };
                let comparison = match edge {
                    TriggerEdge::Rise => "before == T::zero() && after != T::zero()",
                    TriggerEdge::Fall => "before != T::zero() && after == T::zero()",
                    TriggerEdge::Change => "before != after",
                    TriggerEdge::Nonzero => unreachable!(),
                };
                let update_tracker = match &target.tracking_variable {
                    Some(tracker) => format!("self.{} = after;", names::field(tracker)),
                    None => String::new(),
                };
                format!(
                    "{{ let before = {before}; let after = {current}; \
                     let fired = {comparison}; {update_tracker} fired }}"
                )
            }
        };
        w.line(format!("{} => {test},", target.value_index));
    }
    w.line("_ => false,");
    w.close("}");
    w.close("}");
    w.line("");

    w.open("fn event_delay(&mut self, sim: &mut Simulator<T>, target: usize) -> T {");
    w.line("let _ = sim;");
    w.open("match target {");
    for target in &data.event_targets {
        let delay = match &target.delay {
            EventDelay::None => "-T::one()".to_string(),
            EventDelay::Constant(v) => format!("T::from_f64({v:?})"),
            EventDelay::Expression(e) => {
                let ctx = context(root, part, path, settings, Phase::Update, String::new());
                render::render(e, &ctx)
            }
        };
        w.line(format!("{} => {delay},", target.value_index));
    }
    w.line("_ => -T::one(),");
    w.close("}");
    w.close("}");
    w.line("");

    w.open("fn set_latch(&mut self, target: usize) {");
    w.line(format!(
        "self.flags |= 1u64 << ({} + target as u32);",
        data.flags.latch_base
    ));
    w.close("}");
    w.line("");

    w.open("fn finalize_event(&mut self, sim: &mut Simulator<T>) {");
    w.line("// Re-evaluate promptly, then clear the latches.");
    w.line("self.update(sim);");
    w.line("self.finalize(sim);");
    w.line(format!(
        "self.flags &= !(((1u64 << {}) - 1) << {});",
        data.flags.latch_count, data.flags.latch_base
    ));
    w.close("}");
    w.line("");
}
