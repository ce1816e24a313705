//! Per-part population emission.
//!
//! The population struct carries global (population-scope) variables, the
//! membership table, and (for connections) the iterator tree used during
//! formation. Its `Population<T>` impl mirrors the instance lifecycle at
//! collection scope.

use dendrite_model::analysis::BackendData;
use dendrite_model::eqset::{
    Assignment, Attribute, EquationSet, ResolveStep, Variable, VariableKey,
};
use dendrite_model::expr::{ExprKind, Value, VarType};

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

fn context<'a>(
    root: &'a EquationSet,
    part: &'a EquationSet,
    path: &'a [String],
    settings: &Settings,
    phase: Phase,
) -> RenderContext<'a> {
    RenderContext {
        root,
        part,
        path,
        target: settings.target,
        phase,
        column: String::new(),
        global: true,
    }
}

/// Population-scope equivalent of the instance multiconditional.
fn global_multiconditional(w: &mut Writer, variable: &Variable, ctx: &RenderContext) {
    let key = variable.key();
    let buffered =
        variable.has(Attribute::ExternalWrite) || variable.has(Attribute::Cycle);
    let destination = if buffered {
        format!("self.{}", names::next_field(&key))
    } else {
        format!("self.{}", names::field(&key))
    };
    let assign = |value: String| -> String {
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
    let conditional: Vec<_> = variable
        .equations
        .iter()
        .filter(|e| e.condition.is_some())
        .collect();
    let default = variable.equations.iter().find(|e| e.is_default());
    if conditional.is_empty() {
        if let Some(equation) = default {
            w.line(assign(render::render(&equation.expression, ctx)));
        }
        return;
    }
    for (i, equation) in conditional.iter().enumerate() {
        let head = if i == 0 { "if" } else { "} else if" };
        w.open(format!(
            "{head} {} {{",
            render::render_bool(equation.condition.as_ref().unwrap(), ctx)
        ));
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

pub fn emit_population(
    w: &mut Writer,
    root: &EquationSet,
    part: &EquationSet,
    path: &[String],
    settings: &Settings,
) -> Result<(), EmitError> {
    let data = backend(part, path)?;
    let name = names::population_type(path);
    let instance = names::instance_type(path);

    w.open(format!("pub struct {name} {{"));
    w.line("pub container: Option<Weak<RefCell<dyn Instance<T>>>>,");
    w.line("pub myself: Weak<RefCell<Self>>,");
    w.line("pub members: Members<T>,");
    if part.singleton {
        w.line("pub instance: Option<InstanceRef<T>>,");
    }
    for key in &data.global_members {
        let variable = part.find_variable(key).unwrap();
        w.line(format!(
            "pub {}: {},",
            names::field(key),
            storage_type(variable.ty)
        ));
    }
    for key in &data.global_buffered {
        let variable = part.find_variable(key).unwrap();
        w.line(format!(
            "pub {}: {},",
            names::next_field(key),
            storage_type(variable.ty)
        ));
    }
    for key in &data.global_integrated {
        w.line(format!("pub preserve_{}: T,", names::field(key)));
    }
    w.close("}");
    w.line("");

    // Construction and membership plumbing.
    w.open(format!("impl {name} {{"));
    w.open("pub fn shared() -> Rc<RefCell<Self>> {");
    w.open("Rc::new_cyclic(|myself| {");
    w.open("RefCell::new(Self {");
    w.line("container: None,");
    w.line("myself: myself.clone(),");
    w.line("members: Members::default(),");
    if part.singleton {
        w.line("instance: None,");
    }
    for key in &data.global_members {
        let variable = part.find_variable(key).unwrap();
        w.line(format!("{}: {},", names::field(key), zero_of(variable.ty)));
    }
    for key in &data.global_buffered {
        let variable = part.find_variable(key).unwrap();
        w.line(format!(
            "{}: {},",
            names::next_field(key),
            zero_of(variable.ty)
        ));
    }
    for key in &data.global_integrated {
        w.line(format!("preserve_{}: T::zero(),", names::field(key)));
    }
    w.close("})");
    w.close("})");
    w.close("}");
    w.line("");

    w.open("pub fn release(&mut self, index: usize) {");
    w.line("self.members.remove(index);");
    if part.singleton {
        w.line("self.instance = None;");
    }
    w.close("}");
    w.line("");

    // Spawn one member and hand it to the scheduler.
    w.open("pub fn spawn(&mut self, sim: &mut Simulator<T>) {");
    w.line("let instance = self.create(sim);");
    w.line("self.add(sim, &instance);");
    w.line("sim.request_birth(&instance, T::zero());");
    w.close("}");
    w.close("}");
    w.line("");

    emit_impl(w, root, part, path, data, settings, &name, &instance);
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn emit_impl(
    w: &mut Writer,
    root: &EquationSet,
    part: &EquationSet,
    path: &[String],
    data: &BackendData,
    settings: &Settings,
    name: &str,
    instance: &str,
) {
    w.open(format!("impl Population<T> for {name} {{"));
    w.line("fn as_any(&self) -> &dyn Any { self }");
    w.line("fn as_any_mut(&mut self) -> &mut dyn Any { self }");
    w.line("");

    // create: construct a blank instance wired to this population.
    w.open("fn create(&mut self, _sim: &mut Simulator<T>) -> InstanceRef<T> {");
    w.line(format!(
        "let instance: InstanceRef<T> = Rc::new(RefCell::new({instance}::new(\
         self.container.clone(), self.myself.clone())));"
    ));
    w.open("{");
    w.line(format!(
        "let mut inner = instance.borrow_mut();"
    ));
    w.line(format!(
        "inner.as_any_mut().downcast_mut::<{instance}>().unwrap().wire(&instance);"
    ));
    w.close("}");
    w.line("instance");
    w.close("}");
    w.line("");

    // add: claim a slot, stamp index and newborn.
    w.open("fn add(&mut self, _sim: &mut Simulator<T>, instance: &InstanceRef<T>) {");
    w.line("let index = self.members.add(instance);");
    w.open("{");
    w.line("let mut inner = instance.borrow_mut();");
    w.line(format!(
        "let concrete = inner.as_any_mut().downcast_mut::<{instance}>().unwrap();"
    ));
    if data.needs_index {
        w.line("concrete.index = index;");
    } else {
        w.line("let _ = index;");
    }
    if let Some(bit) = data.flags.newborn {
        w.line(format!("concrete.flags |= 1u64 << {bit};"));
    }
    if let Some(bit) = data.flags.live {
        w.line(format!("concrete.flags |= 1u64 << {bit};"));
    }
    w.close("}");
    if part.singleton {
        w.line("self.instance = Some(instance.clone());");
    }
    w.close("}");
    w.line("");

    w.open("fn remove(&mut self, _sim: &mut Simulator<T>, instance: &InstanceRef<T>) {");
    w.line("self.members.remove_instance(instance);");
    if part.singleton {
        w.line("self.instance = None;");
    }
    w.close("}");
    w.line("");

    // init: global equations, then the initial membership.
    w.open("fn init(&mut self, sim: &mut Simulator<T>) {");
    for key in &data.global_init {
        let variable = part.find_variable(key).unwrap();
        let ctx = context(root, part, path, settings, Phase::Init);
        global_multiconditional(w, variable, &ctx);
    }
    for key in &data.global_buffered {
        w.line(format!(
            "self.{} = self.{};",
            names::field(key),
            names::next_field(key)
        ));
    }
    if part.is_connection() {
        w.line("let myself = self.myself.upgrade().unwrap();");
        w.line("sim.request_connect(&(myself as PopulationRef<T>));");
    } else if part.singleton {
        w.line("self.spawn(sim);");
    } else {
        let n = names::field(&VariableKey::new("$n", 0));
        let count = if settings.target == dendrite_digest::Target::Int {
            let e = part
                .find_variable(&VariableKey::new("$n", 0))
                .map(|v| v.exponent.max(0))
                .unwrap_or(0);
            format!("fixed::to_f64(self.{n}, {e}) as usize")
        } else {
            format!("self.{n}.to_f64() as usize")
        };
        w.line(format!("let count = {count};"));
        w.open("for _ in 0..count {");
        w.line("self.spawn(sim);");
        w.close("}");
    }
    w.close("}");
    w.line("");

    // update/finalize at population scope.
    if !data.global_update.is_empty() || data.can_resize {
        w.open("fn update(&mut self, sim: &mut Simulator<T>) {");
        w.line("let _ = sim;");
        for key in &data.global_update {
            let variable = part.find_variable(key).unwrap();
            let ctx = context(root, part, path, settings, Phase::Update);
            global_multiconditional(w, variable, &ctx);
        }
        w.close("}");
        w.line("");
    }

    let needs_finalize = !data.global_buffered.is_empty() || data.can_resize;
    if needs_finalize {
        w.open("fn finalize(&mut self, sim: &mut Simulator<T>) -> bool {");
        for key in &data.global_buffered {
            let variable = part.find_variable(key).unwrap();
            let field = names::field(key);
            let next = names::next_field(key);
            w.line(format!("self.{field} = self.{next};"));
            if data.global_buffered_external_write.contains(key) {
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
        if data.can_resize {
            let n = names::field(&VariableKey::new("$n", 0));
            let count = if settings.target == dendrite_digest::Target::Int {
                let e = part
                    .find_variable(&VariableKey::new("$n", 0))
                    .map(|v| v.exponent.max(0))
                    .unwrap_or(0);
                format!("fixed::to_f64(self.{n}, {e}) as usize")
            } else {
                format!("self.{n}.to_f64() as usize")
            };
            w.line(format!("let target = {count};"));
            w.open("if target != self.members.n() {");
            w.line("let myself = self.myself.upgrade().unwrap();");
            w.line("sim.request_resize(&(myself as PopulationRef<T>), target);");
            w.close("}");
        }
        w.line("true");
        w.close("}");
        w.line("");
    }

    // resize toward a target count.
    if data.can_resize || data.can_grow_or_die {
        w.open("fn resize(&mut self, sim: &mut Simulator<T>, n: usize) {");
        w.open("match self.members.plan_resize(n) {");
        w.open("ResizePlan::Grow(count) => {");
        w.open("for _ in 0..count {");
        w.line("self.spawn(sim);");
        w.close("}");
        w.close("}");
        w.open("ResizePlan::Shrink(doomed) => {");
        w.open("for instance in doomed {");
        w.line("sim.dequeue(&instance, T::zero());");
        w.line("sim.request_death(&instance);");
        w.close("}");
        w.close("}");
        w.close("}");
        w.close("}");
        w.line("");
    }

    w.line("fn get_n(&self) -> usize { self.members.n() }");
    w.line("");

    // clear_new: drop newborn marks here and on our endpoints.
    w.open("fn clear_new(&mut self) {");
    w.line("self.members.clear_new();");
    if let Some(bit) = data.flags.newborn {
        w.open("for instance in self.members.collect() {");
        w.line("let mut inner = instance.borrow_mut();");
        w.line(format!(
            "if let Some(concrete) = inner.as_any_mut().downcast_mut::<{instance}>() \
             {{ concrete.flags &= !(1u64 << {bit}); }}"
        ));
        w.close("}");
    }
    w.close("}");
    w.line("");

    if part.is_connection() {
        emit_get_iterators(w, root, part, path, data, settings);
    }

    // Population-scope integration support.
    if !data.global_integrated.is_empty() {
        emit_global_integrator(w, part, data, settings);
    }
    if !data.global_derivative.is_empty() {
        w.open("fn update_derivative(&mut self, sim: &mut Simulator<T>) {");
        w.line("let _ = sim;");
        for key in &data.global_derivative {
            let variable = part.find_variable(key).unwrap();
            let ctx = context(root, part, path, settings, Phase::Derivative);
            global_multiconditional(w, variable, &ctx);
        }
        w.close("}");
        w.line("");
    }

    w.open("fn path(&self) -> String {");
    w.line(format!("{:?}.to_string()", path.join(".")));
    w.close("}");

    w.close("}");
    w.line("");
}

/// Build the ConnectIterator tree for this connection.
fn emit_get_iterators(
    w: &mut Writer,
    root: &EquationSet,
    part: &EquationSet,
    path: &[String],
    data: &BackendData,
    settings: &Settings,
) {
    w.open(
        "fn get_iterators(&mut self, sim: &mut Simulator<T>) \
         -> Option<Box<dyn ConnectIterator<T>>> {",
    );

    // Collect each endpoint's live members by walking the binding path
    // from the shared container.
    for holder in &data.connection_holders {
        let variable = format!("level{}", holder.index);
        let expr = endpoint_members_expr(root, path, &holder.resolution);
        w.line(format!("let {variable}_members = {expr};"));
    }

    if let Some(cm) = &part.connection_matrix {
        let ctx = context(root, part, path, settings, Phase::Connect);
        let file = match &cm.source.kind {
            ExprKind::Constant(Value::Text(t)) => format!("{t:?}"),
            _ => render::render(&cm.source, &ctx),
        };
        let row = cm.row_binding;
        let col = cm.col_binding;
        w.line(format!(
            "let nonzeros: Vec<(usize, usize)> = \
             sim.holders.get_matrix_sparse(&{file}.to_string())\
             .iter_nonzero().map(|(r, c, _)| (r, c)).collect();"
        ));
        w.line(format!(
            "return Some(Box::new(ConnectMatrix::new({row}, level{row}_members, \
             {col}, level{col}_members, nonzeros)));"
        ));
        w.close("}");
        w.line("");
        return;
    }

    // Chain levels innermost-last; the first binding iterates outermost.
    let mut holders: Vec<_> = data.connection_holders.iter().collect();
    holders.reverse();
    w.line("let filter_old = self.members.n() > 0;");
    w.line("let mut chain: Option<Box<dyn ConnectIterator<T>>> = None;");
    for holder in holders {
        let index = holder.index;
        w.open(format!("chain = Some(Box::new({{"));
        w.line(format!(
            "let mut level = ConnectPopulation::new({index}, level{index}_members);"
        ));
        if holder.max > 0 {
            w.line(format!("level.max = {};", holder.max));
        }
        if holder.min > 0 {
            w.line(format!("level.min = {};", holder.min));
        }
        if holder.k > 0 {
            w.line(format!("level.k = {};", holder.k));
        }
        if holder.radius > 0.0 {
            w.line(format!("level.radius = {:?};", holder.radius));
        }
        w.line("level.filter_old = filter_old;");
        if holder.spatial() {
            w.line("let mut level = level.with_spatial(sim);");
            w.open("if let Some(inner) = chain.take() {");
            w.line("level = level.wrap(inner);");
            w.close("}");
            w.line("level");
        } else {
            w.open("if let Some(inner) = chain.take() {");
            w.line("level = level.wrap(inner);");
            w.close("}");
            w.line("level");
        }
        w.close("}));");
    }
    // Established connections count against the per-endpoint caps.
    w.open("if let Some(chain) = chain.as_mut() {");
    w.line("chain.seed(&self.members.collect());");
    w.close("}");
    w.line("chain");
    w.close("}");
    w.line("");
}

/// Expression collecting the live instances of the endpoint reached by
/// `resolution`, starting from this population's container.
fn endpoint_members_expr(
    root: &EquationSet,
    path: &[String],
    resolution: &[ResolveStep],
) -> String {
    // The first Up (from the connection instance to the shared container)
    // is absorbed by the population's own container link.
    let mut steps = resolution.to_vec();
    let mut current: Vec<String> = path.to_vec();
    let mut acc = String::from(
        "self.container.as_ref().unwrap().upgrade().unwrap().borrow()",
    );
    if let Some(ResolveStep::Up) = steps.first() {
        steps.remove(0);
        current.pop();
        let container_type = names::instance_type(&current);
        acc = format!(
            "{acc}.as_any().downcast_ref::<{container_type}>().unwrap()"
        );
    }
    for step in &steps {
        match step {
            ResolveStep::Up => {
                current.pop();
                let container_type = names::instance_type(&current);
                acc = format!(
                    "{acc}.container.as_ref().unwrap().upgrade().unwrap().borrow()\
                     .as_any().downcast_ref::<{container_type}>().unwrap()"
                );
            }
            ResolveStep::Down(name) => {
                current.push(name.clone());
                let pop = names::population_field(name);
                // Final Down lands on the population itself.
                if std::ptr::eq(step, steps.last().unwrap()) {
                    acc = format!("{acc}.{pop}.borrow().members.collect()");
                } else {
                    let child_type = names::instance_type(&current);
                    acc = format!(
                        "{acc}.{pop}.borrow().instance.as_ref().unwrap().borrow()\
                         .as_any().downcast_ref::<{child_type}>().unwrap()"
                    );
                }
            }
            ResolveStep::Endpoint(_) => {}
        }
    }
    let _ = root;
    acc
}

/// Population-scope Runge-Kutta plumbing mirrors the instance version.
fn emit_global_integrator(
    w: &mut Writer,
    part: &EquationSet,
    data: &BackendData,
    settings: &Settings,
) {
    let fields: Vec<String> = data
        .global_integrated
        .iter()
        .map(|k| names::field(k))
        .collect();
    let derivatives: Vec<String> = data
        .global_integrated
        .iter()
        .filter_map(|k| part.find_variable(k).and_then(|v| v.derivative.clone()))
        .map(|k| names::field(&k))
        .collect();
    let _ = settings;

    w.open("fn integrate(&mut self, sim: &mut Simulator<T>, dt: T) {");
    for (field, dfield) in fields.iter().zip(&derivatives) {
        w.open("if sim.preserving() {");
        w.line(format!(
            "self.{field} = self.preserve_{field} + self.{dfield} * dt;"
        ));
        w.close("} else {");
        w.indent += 1;
        w.line(format!("self.{field} = self.{field} + self.{dfield} * dt;"));
        w.close("}");
    }
    w.close("}");
    w.line("");

    w.open("fn snapshot(&mut self) {");
    for field in &fields {
        w.line(format!("self.preserve_{field} = self.{field};"));
    }
    w.close("}");
    w.line("");

    w.open("fn restore(&mut self) {");
    for field in &fields {
        w.line(format!("self.{field} = self.preserve_{field};"));
    }
    w.close("}");
    w.line("");
}
