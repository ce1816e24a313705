//! Connection planning.
//!
//! For each endpoint binding of each connection, decide how candidate
//! instances are enumerated: sparse-matrix driven, nearest-neighbor, or
//! plain nested iteration with `$max`/`$min` caps. The result is one
//! [`ConnectionHolder`] per binding; holders with identical plans share a
//! registry index.

use dendrite_model::analysis::ConnectionHolder;
use dendrite_model::eqset::{EquationSet, VariableKey};
use dendrite_model::expr::Value;
use tracing::debug;

pub fn plan_connections(root: &mut EquationSet) {
    let mut registry: Vec<ConnectionHolder> = Vec::new();
    let paths = root.part_paths();
    for path in paths {
        let part = root.part_at(&path).unwrap();
        if !part.is_connection() {
            continue;
        }
        let mut holders = Vec::new();
        for binding in &part.connection_bindings {
            let read = |name: &str| -> f64 {
                // `alias.$name` binds tighter than a bare `$name`, which
                // applies to the first endpoint.
                let scoped = VariableKey::new(format!("{}.{name}", binding.alias), 0);
                let bare = VariableKey::new(name, 0);
                let variable = part.find_variable(&scoped).or_else(|| {
                    if binding.index == 0 {
                        part.find_variable(&bare)
                    } else {
                        None
                    }
                });
                variable
                    .and_then(|v| v.default_equation())
                    .and_then(|e| e.expression.as_constant())
                    .and_then(Value::as_scalar)
                    .unwrap_or(0.0)
            };
            let has_project = part
                .find_variable(&VariableKey::new(
                    format!("{}.$project", binding.alias),
                    0,
                ))
                .is_some()
                || part
                    .find_variable(&VariableKey::new("$project", 0))
                    .is_some();

            let mut holder = ConnectionHolder {
                index: 0,
                k: read("$k") as usize,
                min: read("$min") as usize,
                max: read("$max") as usize,
                radius: read("$radius"),
                has_project,
                endpoint: binding.endpoint.clone(),
                resolution: binding.resolution.clone(),
            };
            holder.index = match registry.iter().find(|h| h.same_plan(&holder)) {
                Some(existing) => existing.index,
                None => {
                    let index = registry.len();
                    holder.index = index;
                    registry.push(holder.clone());
                    index
                }
            };
            holders.push(holder);
        }
        debug!(
            part = path.join("."),
            bindings = holders.len(),
            "connection planned"
        );
        let part = root.part_at_mut(&path).unwrap();
        part.backend_data
            .get_or_insert_with(Default::default)
            .connection_holders = holders;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bindings::resolve_connection_bindings;
    use crate::resolve::{resolve_lhs, resolve_rhs};
    use crate::specials::add_specials;
    use dendrite_model::Node;

    fn build(text: &str) -> EquationSet {
        let doc = Node::from_text(text).unwrap();
        let mut model = EquationSet::from_node("", &doc).unwrap();
        let mut errors = Vec::new();
        resolve_connection_bindings(&mut model, &mut errors);
        add_specials(&mut model);
        resolve_lhs(&mut model, &mut errors);
        resolve_rhs(&mut model, &mut errors);
        assert!(errors.is_empty(), "{errors:?}");
        model
    }

    #[test]
    fn scoped_caps_read() {
        let mut model =
            build("A:\n V:0\nB:\n V:0\nC:\n pre:A\n post:B\n pre.$max:3\n post.$k:5\n");
        plan_connections(&mut model);
        let c = model.find_part("C").unwrap();
        let holders = &c.backend_data.as_ref().unwrap().connection_holders;
        assert_eq!(holders[0].max, 3);
        assert_eq!(holders[0].k, 0);
        assert_eq!(holders[1].k, 5);
        assert!(holders[1].spatial());
    }

    #[test]
    fn bare_cap_applies_to_first_binding() {
        let mut model = build("A:\n V:0\nB:\n V:0\nC:\n pre:A\n post:B\n $max:3\n");
        plan_connections(&mut model);
        let c = model.find_part("C").unwrap();
        let holders = &c.backend_data.as_ref().unwrap().connection_holders;
        assert_eq!(holders[0].max, 3);
        assert_eq!(holders[1].max, 0);
    }

    #[test]
    fn identical_plans_coalesce() {
        let text = "A:\n V:0\nC1:\n pre:A\n w:$init@1\nC2:\n pre:A\n w:$init@2\n";
        let mut model = build(text);
        plan_connections(&mut model);
        let h1 = model.find_part("C1").unwrap().backend_data.as_ref().unwrap()
            .connection_holders[0]
            .index;
        let h2 = model.find_part("C2").unwrap().backend_data.as_ref().unwrap()
            .connection_holders[0]
            .index;
        assert_eq!(h1, h2);
    }
}
