//! Whole-program scaffolding: file header, the wrapper root, `main`, and
//! the library ABI.

use dendrite_digest::{CliParam, Target};
use dendrite_model::eqset::{Attribute, EquationSet, VariableKey};
use dendrite_model::expr::Value;

use crate::{instance, names, population, EmitError, Settings, Writer};

pub fn emit_header(w: &mut Writer, settings: &Settings) {
    w.line("// Generated by dendrite. Do not edit.");
    w.line("#![allow(non_snake_case)]");
    w.line("#![allow(unused_variables, unused_parens, unused_mut, unused_imports)]");
    w.line("#![allow(dead_code, clippy::all)]");
    w.line("");
    w.line("use std::any::Any;");
    w.line("use std::cell::RefCell;");
    w.line("use std::collections::HashMap;");
    w.line("use std::rc::{Rc, Weak};");
    w.line("");
    let rt = &settings.runtime_crate;
    w.line(format!(
        "use {rt}::{{fixed, same_instance, ConnectIterator, ConnectMatrix, \
         ConnectPopulation, DelayBuffer, Instance, InstanceRef, Integrator, Matrix, \
         Members, Population, PopulationRef, Real, ResizePlan, Simulator, SpikeTarget}};"
    ));
    w.line("");
    w.line(format!("type T = {};", settings.target.type_name()));
    w.line("");
}

/// The root part compiles like any other, under the `Wrapper` name.
pub fn emit_wrapper(
    w: &mut Writer,
    model: &EquationSet,
    settings: &Settings,
) -> Result<(), EmitError> {
    instance::emit_instance(w, model, model, &[], settings)?;
    population::emit_population(w, model, model, &[], settings)?;
    Ok(())
}

/// Simulation duration: `$metadata duration` on the root, else one second.
fn duration(model: &EquationSet) -> f64 {
    model
        .metadata
        .get("duration")
        .parse::<f64>()
        .unwrap_or(1.0)
}

fn default_dt(model: &EquationSet) -> f64 {
    model
        .find_variable(&VariableKey::new("$t", 1))
        .and_then(|v| v.default_equation())
        .and_then(|e| e.expression.as_constant())
        .and_then(Value::as_scalar)
        .unwrap_or(dendrite_digest::specials::DEFAULT_DT)
}

fn emit_bootstrap(w: &mut Writer, model: &EquationSet, params: &[CliParam], settings: &Settings) {
    let dt = default_dt(model);
    w.line(format!(
        "let mut sim = Simulator::<T>::new(Integrator::Euler, T::from_f64({dt:?}), {});",
        settings.seed
    ));
    w.line("let root_pop = WrapperPopulation::shared();");
    w.line(
        "let root: InstanceRef<T> = Rc::new(RefCell::new(WrapperInstance::new(None, \
         Rc::downgrade(&root_pop))));",
    );
    w.open("{");
    w.line("let mut inner = root.borrow_mut();");
    w.line(
        "let concrete = inner.as_any_mut().downcast_mut::<WrapperInstance>().unwrap();",
    );
    w.line("concrete.wire(&root);");
    // Place command-line parameters before init runs.
    for param in params {
        if param.name.contains('.') {
            continue; // nested parameters apply through the params file
        }
        let field = names::field(&VariableKey::parse(&param.name));
        let fallback = &param.value;
        if settings.target == Target::Int {
            let exponent = model
                .find_variable(&VariableKey::parse(&param.name))
                .map(|v| v.exponent.max(0))
                .unwrap_or(0);
            w.line(format!(
                "concrete.{field} = fixed::from_f64(params.get({:?})\
                 .and_then(|v| v.parse::<f64>().ok()).unwrap_or({fallback}), {exponent});",
                param.name
            ));
        } else {
            w.line(format!(
                "concrete.{field} = T::from_f64(params.get({:?})\
                 .and_then(|v| v.parse::<f64>().ok()).unwrap_or({fallback}));",
                param.name
            ));
        }
    }
    w.close("}");
    w.line("sim.init(&root);");
}

pub fn emit_main(
    w: &mut Writer,
    model: &EquationSet,
    params: &[CliParam],
    settings: &Settings,
) {
    w.open("fn load_params(path: &str, params: &mut HashMap<String, String>) {");
    w.open("if let Ok(text) = std::fs::read_to_string(path) {");
    w.open("for line in text.lines() {");
    w.open("if let Some(file) = line.strip_prefix(\"-include \") {");
    w.line("load_params(file.trim(), params);");
    w.close("} else if let Some((key, value)) = line.split_once('=') {");
    w.indent += 1;
    w.line("params.insert(key.trim().to_string(), value.trim().to_string());");
    w.close("}");
    w.close("}");
    w.close("}");
    w.close("}");
    w.line("");

    w.open("fn run_simulation() -> Result<(), String> {");
    w.line("let mut params: HashMap<String, String> = HashMap::new();");
    w.line("let mut args = std::env::args().skip(1);");
    w.open("while let Some(arg) = args.next() {");
    w.open("if arg == \"-include\" {");
    w.open("if let Some(file) = args.next() {");
    w.line("load_params(&file, &mut params);");
    w.close("}");
    w.close("} else if let Some((key, value)) = arg.split_once('=') {");
    w.indent += 1;
    w.line("params.insert(key.to_string(), value.to_string());");
    w.close("}");
    w.close("}");
    w.line("");
    emit_bootstrap(w, model, params, settings);
    let until = duration(model);
    w.line(format!(
        "let until = params.get(\"duration\")\
         .and_then(|v| v.parse::<f64>().ok()).unwrap_or({until:?});"
    ));
    w.line("sim.run(T::from_f64(until));");
    w.line("sim.finish();");
    w.line("Ok(())");
    w.close("}");
    w.line("");

    w.open("fn main() {");
    w.open("if let Err(message) = run_simulation() {");
    w.line("eprintln!(\"Exception: {message}\");");
    w.line("std::process::exit(1);");
    w.close("}");
    w.close("}");
}

/// Library surface: `init`/`run`/`finish` plus vector accessors.
pub fn emit_library_abi(
    w: &mut Writer,
    model: &EquationSet,
    params: &[CliParam],
    settings: &Settings,
) {
    w.open("thread_local! {");
    w.line(
        "static STATE: RefCell<Option<(Simulator<T>, InstanceRef<T>)>> = \
         RefCell::new(None);",
    );
    w.close("}");
    w.line("");

    w.open("pub fn init(args: &[String]) {");
    w.line("let mut params: HashMap<String, String> = HashMap::new();");
    w.open("for arg in args {");
    w.open("if let Some((key, value)) = arg.split_once('=') {");
    w.line("params.insert(key.to_string(), value.to_string());");
    w.close("}");
    w.close("}");
    emit_bootstrap(w, model, params, settings);
    w.line("STATE.with(|s| *s.borrow_mut() = Some((sim, root)));");
    w.close("}");
    w.line("");

    w.open("pub fn run(until: f64) {");
    w.open("STATE.with(|s| {");
    w.open("if let Some((sim, _)) = s.borrow_mut().as_mut() {");
    w.line("sim.run(T::from_f64(until));");
    w.close("}");
    w.close("});");
    w.close("}");
    w.line("");

    w.open("pub fn finish() {");
    w.open("STATE.with(|s| {");
    w.open("if let Some((mut sim, _)) = s.borrow_mut().take() {");
    w.line("sim.finish();");
    w.close("}");
    w.close("});");
    w.close("}");
    w.line("");

    emit_vector_accessors(w, model);
}

/// One accessor per variable tagged `backend/rust/vector`: exposes the
/// population's values by instance index.
fn emit_vector_accessors(w: &mut Writer, model: &EquationSet) {
    let mut tagged: Vec<(Vec<String>, VariableKey)> = Vec::new();
    model.walk(&mut |path, part| {
        for variable in part.variables.values() {
            let vector = variable
                .metadata
                .as_ref()
                .map(|m| m.flag(&["backend", "rust", "vector"]))
                .unwrap_or(false);
            if vector && !variable.has(Attribute::Global) {
                tagged.push((path.to_vec(), variable.key()));
            }
        }
    });
    if tagged.is_empty() {
        return;
    }

    w.open("pub struct IOvector {");
    w.line("pub values: Vec<f64>,");
    w.close("}");
    w.line("");
    w.open("impl IOvector {");
    w.line("pub fn size(&self) -> usize { self.values.len() }");
    w.line("pub fn get(&self, i: usize) -> f64 { self.values[i] }");
    w.line("pub fn set(&mut self, i: usize, v: f64) { self.values[i] = v; }");
    w.close("}");
    w.line("");

    for (path, key) in tagged {
        let field = names::field(&key);
        let accessor = format!("get_{}_{}", names::type_prefix(&path), field);
        let target_type = names::instance_type(&path);

        // Chain from the wrapper through singleton hops to the population
        // holding this part's instances.
        let mut chain = String::from(
            "root.borrow().as_any().downcast_ref::<WrapperInstance>().unwrap()",
        );
        for (depth, segment) in path.iter().enumerate() {
            let pop = names::population_field(segment);
            if depth + 1 == path.len() {
                chain = format!("{chain}.{pop}.borrow().members.collect()");
            } else {
                let hop_type = names::instance_type(&path[..depth + 1]);
                chain = format!(
                    "{chain}.{pop}.borrow().instance.as_ref().unwrap().borrow()\
                     .as_any().downcast_ref::<{hop_type}>().unwrap()"
                );
            }
        }

        w.open(format!("pub fn {accessor}() -> IOvector {{"));
        w.line("let mut values = Vec::new();");
        w.open("STATE.with(|s| {");
        w.open("if let Some((_, root)) = s.borrow().as_ref() {");
        w.line(format!("let members = {chain};"));
        w.open("for member in members {");
        w.line("let inner = member.borrow();");
        w.open(format!(
            "if let Some(concrete) = inner.as_any().downcast_ref::<{target_type}>() {{"
        ));
        w.line(format!("values.push(concrete.{field}.to_f64());"));
        w.close("}");
        w.close("}");
        w.close("}");
        w.close("});");
        w.line("IOvector { values }");
        w.close("}");
        w.line("");
    }
}
