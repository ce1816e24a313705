//! The digest pipeline.
//!
//! Runs the analysis passes in their required order over a parsed model
//! hierarchy. Each stage assumes the completion of the ones before it.
//! Errors are collected along the way; the pipeline aborts with the whole
//! batch rather than recovering.

use dendrite_model::eqset::EquationSet;
use tracing::{debug, info};

use crate::error::{DigestError, DigestResult};
use crate::specials::CliParam;
use crate::{attrs, backend, bindings, cmatrix, death, events, exponent, flatten, order,
    planner, resolve, simplify, specials};

/// Numeric regime the model compiles against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Target {
    Float,
    #[default]
    Double,
    /// Fixed-point `i32` with inferred exponents.
    Int,
}

impl Target {
    pub fn type_name(self) -> &'static str {
        match self {
            Target::Float => "f32",
            Target::Double => "f64",
            Target::Int => "i32",
        }
    }
}

/// Summary of digest results beyond the decorated tree itself.
#[derive(Debug, Default)]
pub struct Digest {
    /// Command-line parameters exported by tagged constants.
    pub params: Vec<CliParam>,
}

/// Digest a model in place.
///
/// On success the tree is decorated and frozen: references resolved,
/// variables ordered and attributed, backend data filled. On failure the
/// collected diagnostics come back and the tree is abandoned.
pub fn digest(model: &mut EquationSet, target: Target) -> DigestResult<Digest> {
    info!(?target, "digest started");
    let mut errors: Vec<DigestError> = Vec::new();

    bindings::resolve_connection_bindings(model, &mut errors);
    specials::add_specials(model);
    specials::seed_attributes(model);
    let params = specials::tag_cli_parameters(model);

    resolve::resolve_lhs(model, &mut errors);
    resolve::fill_integrated(model);
    resolve::resolve_rhs(model, &mut errors);
    if !errors.is_empty() {
        return Err(errors);
    }

    if flatten::flatten(model) {
        debug!("re-resolving after flatten");
        resolve::clear_references(model);
        resolve::resolve_lhs(model, &mut errors);
        resolve::resolve_rhs(model, &mut errors);
        if !errors.is_empty() {
            return Err(errors);
        }
    }

    order::sort_parts(model);
    attrs::check_units(model, &mut errors);
    simplify::find_constants(model);
    death::collect_splits(model, &mut errors);
    death::find_death(model);
    simplify::remove_unused(model);
    order::collect_dependencies(model);
    order::determine_order(model);
    attrs::find_init_only(model);
    simplify::remove_unused(model);
    attrs::set_attributes_live(model);
    attrs::determine_types(model, &mut errors);
    if target == Target::Int {
        exponent::determine_exponents(model, &mut errors);
    }
    cmatrix::find_connection_matrix(model, &mut errors);
    events::analyze_events(model, &mut errors);

    backend::find_singletons(model);
    planner::plan_connections(model);
    attrs::find_temporary(model);
    backend::analyze(model);

    if errors.is_empty() {
        info!("digest complete");
        Ok(Digest { params })
    } else {
        Err(errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dendrite_model::eqset::{Attribute, VariableKey};
    use dendrite_model::Node;

    fn load(text: &str) -> EquationSet {
        let doc = Node::from_text(text).unwrap();
        EquationSet::from_node("", &doc).unwrap()
    }

    #[test]
    fn full_pipeline_on_decay_model() {
        let mut model = load("cell:\n $n:3\n V:$init@1\n V':0-V\n");
        let digest = digest(&mut model, Target::Double);
        assert!(digest.is_ok(), "{digest:?}");
        let cell = model.find_part("cell").unwrap();
        assert!(!cell.ordered.is_empty());
        let data = cell.backend_data.as_ref().unwrap();
        assert!(data.local_integrated.contains(&VariableKey::new("V", 0)));
        let v = cell.find_variable(&VariableKey::new("V", 0)).unwrap();
        assert_eq!(v.derivative, Some(VariableKey::new("V", 1)));
    }

    #[test]
    fn connection_pipeline() {
        let text = "A:\n $n:10\n V:0\nB:\n $n:10\n V:0\nC:\n pre:A\n post:B\n \
                    $p:1\n pre.$max:3\n w:$init@0.5\n";
        let mut model = load(text);
        let result = digest(&mut model, Target::Double);
        assert!(result.is_ok(), "{result:?}");
        let c = model.find_part("C").unwrap();
        assert!(c.is_connection());
        let data = c.backend_data.as_ref().unwrap();
        assert_eq!(data.connection_holders.len(), 2);
        assert_eq!(data.connection_holders[0].max, 3);
    }

    #[test]
    fn unresolved_aborts_with_batch() {
        let mut model = load("p:\n a:ghost1\n b:ghost2\n");
        let result = digest(&mut model, Target::Double);
        let errors = result.unwrap_err();
        assert!(errors.len() >= 2);
    }

    #[test]
    fn fixed_point_requires_exponents() {
        let mut model = load("p:\n V:input(\"data\",0,0)\n");
        let result = digest(&mut model, Target::Int);
        assert!(result.is_err());
    }

    #[test]
    fn digest_is_idempotent_on_attributes() {
        let text = "cell:\n $n:3\n V:$init@1\n V':0-V\n";
        let mut once = load(text);
        digest(&mut once, Target::Double).unwrap();

        // Digest the already-digested tree again.
        let mut twice = once.clone();
        digest(&mut twice, Target::Double).unwrap();

        let collect = |model: &EquationSet| {
            let mut out = Vec::new();
            model.walk(&mut |path, part| {
                for v in part.variables.values() {
                    out.push((path.to_vec(), v.key(), v.attributes.clone()));
                }
            });
            out
        };
        assert_eq!(collect(&once), collect(&twice));
    }

    #[test]
    fn cli_params_surface() {
        let text = "tau:0.02\n $metadata:\n  param:1\nV:$init@tau\n";
        let mut model = load(text);
        let digest = digest(&mut model, Target::Double).unwrap();
        assert_eq!(digest.params.len(), 1);
        assert_eq!(digest.params[0].name, "tau");
        let tau = model.find_variable(&VariableKey::new("tau", 0)).unwrap();
        assert!(tau.has(Attribute::Cli));
    }
}
