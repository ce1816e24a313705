//! Injection of language specials and attribute seeding.
//!
//! Every part receives the `$` variables the runtime contract relies on:
//! `$t`, `$t'`, `$init`, `$connect`, `$live`, and (below the root) `$n` and
//! `$index`. Unused ones are pruned again at the end of the pipeline.

use dendrite_model::eqset::{Attribute, EquationEntry, EquationSet, Variable, VariableKey};
use dendrite_model::expr::Expr;
use tracing::trace;

/// Default step period when the model does not set `$t'`, in seconds.
pub const DEFAULT_DT: f64 = 1e-4;

pub fn add_specials(root: &mut EquationSet) {
    let paths = root.part_paths();
    for path in paths {
        let is_root = path.is_empty();
        let part = root.part_at_mut(&path).unwrap();
        ensure(part, "$t", 0, &[Attribute::Preexistent]);
        ensure(part, "$t", 1, &[Attribute::Preexistent]);
        ensure(part, "$init", 0, &[Attribute::Preexistent, Attribute::Temporary]);
        ensure(part, "$connect", 0, &[Attribute::Preexistent, Attribute::Temporary]);
        ensure(part, "$live", 0, &[]);
        if !is_root {
            let n = ensure(part, "$n", 0, &[Attribute::Global]);
            if n.equations.is_empty() {
                n.equations.push(EquationEntry {
                    condition: None,
                    expression: Expr::scalar(1.0),
                });
            }
            ensure(part, "$index", 0, &[Attribute::Preexistent]);
        }
        if is_root {
            // The root keeps a concrete default step so the whole model has
            // a period even when no part names one.
            let dt = part
                .find_variable_mut(&VariableKey::new("$t", 1))
                .unwrap();
            if dt.equations.is_empty() {
                dt.equations.push(EquationEntry {
                    condition: None,
                    expression: Expr::scalar(DEFAULT_DT),
                });
            }
        }
    }
}

fn ensure<'a>(
    part: &'a mut EquationSet,
    name: &str,
    order: usize,
    attributes: &[Attribute],
) -> &'a mut Variable {
    let key = VariableKey::new(name, order);
    if !part.variables.contains_key(&key) {
        trace!(part = %part.name, variable = %key, "special injected");
        part.variables.insert(key.clone(), Variable::new(key.clone()));
    }
    let variable = part.variables.get_mut(&key).unwrap();
    for attribute in attributes {
        variable.add_attribute(*attribute);
    }
    variable
}

/// Seed fixed attributes on the connection-formation and membership
/// specials.
pub fn seed_attributes(root: &mut EquationSet) {
    let paths = root.part_paths();
    for path in paths {
        let part = root.part_at_mut(&path).unwrap();
        for variable in part.variables.values_mut() {
            let tail = variable
                .name
                .rsplit_once('.')
                .map(|(_, t)| t)
                .unwrap_or(&variable.name);
            match tail {
                "$max" | "$min" | "$k" | "$radius" => {
                    variable.add_attribute(Attribute::Global);
                    variable.add_attribute(Attribute::InitOnly);
                }
                "$n" => variable.add_attribute(Attribute::Global),
                "$index" => variable.add_attribute(Attribute::Preexistent),
                "$t" => variable.add_attribute(Attribute::Preexistent),
                _ => {}
            }
        }
    }
}

/// One command-line parameter exported by the model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CliParam {
    /// Dotted full name of the variable.
    pub name: String,
    /// Default value, as written in the model.
    pub value: String,
    /// Format/range hint from metadata, may be empty.
    pub hint: String,
}

/// Tag overridable constants.
///
/// A variable qualifies when it is a single unconditional constant carrying
/// the `param` metadata flag, or `backend/rust/cli` which takes precedence
/// in both directions. Tagged variables become `initOnly` so simplification
/// cannot fold them away.
pub fn tag_cli_parameters(root: &mut EquationSet) -> Vec<CliParam> {
    let mut params = Vec::new();
    let paths = root.part_paths();
    for path in paths {
        let part = root.part_at_mut(&path).unwrap();
        for variable in part.variables.values_mut() {
            let Some(metadata) = variable.metadata.clone() else {
                continue;
            };
            let enabled = match metadata.child_path(&["backend", "rust", "cli"]) {
                Some(node) => node.value != "0",
                None => metadata.flag(&["param"]),
            };
            if !enabled || !variable.is_simple_constant() {
                continue;
            }
            variable.add_attribute(Attribute::InitOnly);
            variable.add_attribute(Attribute::Cli);
            variable.add_attribute(Attribute::Param);

            let mut name = path.join(".");
            if !name.is_empty() {
                name.push('.');
            }
            name.push_str(&variable.name);
            let hint = metadata.get("param").to_string();
            params.push(CliParam {
                name,
                value: variable.equations[0].expression.to_string(),
                hint,
            });
        }
    }
    params
}

#[cfg(test)]
mod tests {
    use super::*;
    use dendrite_model::Node;

    fn build(text: &str) -> EquationSet {
        let doc = Node::from_text(text).unwrap();
        EquationSet::from_node("", &doc).unwrap()
    }

    #[test]
    fn specials_injected() {
        let mut model = build("layer:\n V:0\n");
        add_specials(&mut model);
        let layer = model.find_part("layer").unwrap();
        assert!(layer.variables.contains_key(&VariableKey::new("$t", 0)));
        assert!(layer.variables.contains_key(&VariableKey::new("$t", 1)));
        assert!(layer.variables.contains_key(&VariableKey::new("$n", 0)));
        // Root has no $n.
        assert!(!model.variables.contains_key(&VariableKey::new("$n", 0)));
    }

    #[test]
    fn default_n_is_one() {
        let mut model = build("layer:\n V:0\n");
        add_specials(&mut model);
        let layer = model.find_part("layer").unwrap();
        let n = layer.find_variable(&VariableKey::new("$n", 0)).unwrap();
        assert_eq!(n.equations.len(), 1);
    }

    #[test]
    fn user_n_kept() {
        let mut model = build("layer:\n $n:10\n");
        add_specials(&mut model);
        let layer = model.find_part("layer").unwrap();
        let n = layer.find_variable(&VariableKey::new("$n", 0)).unwrap();
        assert_eq!(n.equations.len(), 1);
        assert_eq!(
            n.equations[0].expression.as_constant().unwrap(),
            &dendrite_model::Value::Scalar(10.0)
        );
    }

    #[test]
    fn seeding_covers_dotted_aliases() {
        let mut model = build("A:\n V:0\nC:\n pre:A\n pre.$max:3\n");
        add_specials(&mut model);
        seed_attributes(&mut model);
        let c = model.find_part("C").unwrap();
        let m = c
            .find_variable(&VariableKey::new("pre.$max", 0))
            .unwrap();
        assert!(m.has(Attribute::Global));
        assert!(m.has(Attribute::InitOnly));
    }

    #[test]
    fn cli_tagging() {
        let text = "tau:0.01\n $metadata:\n  param:1\nV:0\n";
        let mut model = build(text);
        let params = tag_cli_parameters(&mut model);
        assert_eq!(params.len(), 1);
        assert_eq!(params[0].name, "tau");
        let tau = model
            .find_variable(&VariableKey::new("tau", 0))
            .unwrap();
        assert!(tau.has(Attribute::Cli));
        assert!(tau.has(Attribute::InitOnly));
    }
}
