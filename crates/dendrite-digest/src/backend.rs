//! BackendData analysis: storage classes, phase lists, flag layout, and
//! structural needs per part. Emission reads only this record plus the
//! decorated tree; it makes no decisions of its own.

use dendrite_model::analysis::LiveStorage;
use dendrite_model::eqset::{Attribute, EquationSet, Variable, VariableKey};
use dendrite_model::expr::{ExprKind, Value};
use tracing::debug;

/// Mark singleton parts: compartments whose `$n` is the constant 1 and
/// that no `$type` split targets.
pub fn find_singletons(root: &mut EquationSet) {
    let mut split_targets: Vec<Vec<String>> = Vec::new();
    root.walk(&mut |_path, part| {
        for split in &part.splits {
            split_targets.extend(split.iter().cloned());
        }
    });

    let paths = root.part_paths();
    for path in paths {
        let part = root.part_at(&path).unwrap();
        let singleton = if path.is_empty() {
            true
        } else if part.is_connection() || split_targets.contains(&path) {
            false
        } else {
            match part.find_variable(&VariableKey::new("$n", 0)) {
                None => true,
                Some(n) => {
                    n.equations.len() == 1
                        && n.equations[0].is_default()
                        && matches!(
                            n.equations[0].expression.as_constant(),
                            Some(Value::Scalar(v)) if *v == 1.0
                        )
                        && !n.has(Attribute::ExternalWrite)
                }
            }
        };
        root.part_at_mut(&path).unwrap().singleton = singleton;
    }
}

fn stored(variable: &Variable) -> bool {
    !variable.has(Attribute::Temporary)
        && !variable.has(Attribute::Constant)
        && !variable.has(Attribute::Accessor)
        && !variable.has(Attribute::Dummy)
        && !variable.has(Attribute::Reference)
        && !(variable.has(Attribute::Preexistent) && variable.name != "$index")
}

/// Fill every part's [`BackendData`] from the decorated tree.
pub fn analyze(root: &mut EquationSet) {
    // Which parts serve as connection endpoints, and with which caps.
    let mut endpoints: Vec<(Vec<String>, bool)> = Vec::new(); // (path, accountable)
    root.walk(&mut |_path, part| {
        let planned = part
            .backend_data
            .as_ref()
            .map(|d| !d.connection_holders.is_empty())
            .unwrap_or(false);
        if planned {
            for holder in &part.backend_data.as_ref().unwrap().connection_holders {
                endpoints.push((holder.endpoint.clone(), holder.max > 0 || holder.min > 0));
            }
        } else {
            for binding in &part.connection_bindings {
                endpoints.push((binding.endpoint.clone(), false));
            }
        }
    });

    let paths = root.part_paths();
    for path in paths {
        let part = root.part_at(&path).unwrap();
        let mut data = part.backend_data.clone().map(|b| *b).unwrap_or_default();

        data.local_members.clear();
        data.local_init.clear();
        data.local_update.clear();
        data.local_integrated.clear();
        data.local_derivative.clear();
        data.local_buffered.clear();
        data.local_buffered_internal.clear();
        data.local_buffered_external.clear();
        data.local_buffered_external_write.clear();
        data.global_members.clear();
        data.global_init.clear();
        data.global_update.clear();
        data.global_integrated.clear();
        data.global_derivative.clear();
        data.global_buffered.clear();
        data.global_buffered_internal.clear();
        data.global_buffered_external.clear();
        data.global_buffered_external_write.clear();
        data.local_columns.clear();
        data.global_columns.clear();
        data.delays = 0;

        let order: Vec<VariableKey> = if part.ordered.is_empty() {
            part.variables.keys().cloned().collect()
        } else {
            part.ordered.clone()
        };

        // Integration reads these through a field even when folding marked
        // them constant.
        let derivative_targets: Vec<VariableKey> = part
            .variables
            .values()
            .filter_map(|v| v.derivative.clone())
            .collect();

        for key in &order {
            let Some(variable) = part.find_variable(key) else {
                continue;
            };
            let global = variable.has(Attribute::Global);
            let is_stored = stored(variable) || derivative_targets.contains(key);
            let has_equations = !variable.equations.is_empty();

            macro_rules! lists {
                ($members:ident, $init:ident, $update:ident, $integrated:ident,
                 $derivative:ident, $buffered:ident, $internal:ident,
                 $external:ident, $external_write:ident) => {{
                    if is_stored {
                        data.$members.push(key.clone());
                    }
                    if has_equations && !variable.has(Attribute::Preexistent) {
                        data.$init.push(key.clone());
                        if !variable.has(Attribute::InitOnly)
                            && !variable.has(Attribute::Constant)
                        {
                            if key.order == 0 {
                                data.$update.push(key.clone());
                            } else {
                                data.$derivative.push(key.clone());
                            }
                        }
                    }
                    if variable.derivative.is_some() && is_stored {
                        data.$integrated.push(key.clone());
                    }
                    if variable.has(Attribute::ExternalWrite) {
                        data.$buffered.push(key.clone());
                        data.$external.push(key.clone());
                        data.$external_write.push(key.clone());
                    } else if variable.has(Attribute::Cycle) {
                        data.$buffered.push(key.clone());
                        data.$internal.push(key.clone());
                    }
                }};
            }
            if global {
                lists!(
                    global_members,
                    global_init,
                    global_update,
                    global_integrated,
                    global_derivative,
                    global_buffered,
                    global_buffered_internal,
                    global_buffered_external,
                    global_buffered_external_write
                );
            } else {
                lists!(
                    local_members,
                    local_init,
                    local_update,
                    local_integrated,
                    local_derivative,
                    local_buffered,
                    local_buffered_internal,
                    local_buffered_external,
                    local_buffered_external_write
                );
            }

            // Output columns for watched variables.
            if variable
                .metadata
                .as_ref()
                .map(|m| m.flag(&["watch"]))
                .unwrap_or(false)
            {
                let mut column = path.join(".");
                if !column.is_empty() {
                    column.push('.');
                }
                column.push_str(&variable.name);
                if global {
                    data.global_columns.push(column);
                } else {
                    data.local_columns.push(column);
                }
            }

            variable.visit_expressions(&mut |e| {
                if let ExprKind::Call { name, .. } = &e.kind {
                    if name == "delay" {
                        data.delays += 1;
                    }
                }
                true
            });
        }

        // Flag word layout: live, newborn, then one latch per event target.
        let own_death = part.lethal_p || !part.splits.is_empty();
        let reach_death = part.lethal_container || part.lethal_connection;
        data.live_storage = if own_death {
            LiveStorage::Stored
        } else if reach_death {
            LiveStorage::Accessor
        } else {
            LiveStorage::Constant
        };
        let mut bit = 0u32;
        data.flags.live = if data.live_storage == LiveStorage::Stored {
            let b = bit;
            bit += 1;
            Some(b)
        } else {
            None
        };
        let is_endpoint = endpoints.iter().any(|(p, _)| p == &path);
        data.flags.newborn = if is_endpoint || part.is_connection() {
            let b = bit;
            bit += 1;
            Some(b)
        } else {
            None
        };
        data.flags.latch_base = bit;
        data.flags.latch_count = data.event_targets.len() as u32;
        for (i, target) in data.event_targets.iter_mut().enumerate() {
            target.latch_bit = bit + i as u32;
        }

        data.needs_index = !part.singleton;
        data.needs_instance_tracking = is_endpoint;
        data.needs_refcount = is_endpoint && (own_death || reach_death);
        data.needs_last_t = part
            .find_variable(&VariableKey::new("$t", 1))
            .map(|dt| !dt.equations.is_empty() && !path.is_empty())
            .unwrap_or(false);
        data.track_n = !part.singleton;
        data.can_resize = part
            .find_variable(&VariableKey::new("$n", 0))
            .map(|n| {
                n.has(Attribute::ExternalWrite)
                    || n.equations
                        .iter()
                        .any(|e| !e.expression.is_constant() || e.condition.is_some())
            })
            .unwrap_or(false);
        data.can_grow_or_die =
            data.can_resize || own_death || reach_death || !part.splits.is_empty();

        // A connection whose endpoint lives beside it reaches the shared
        // container through that endpoint, saving a field.
        data.container_through_endpoint = None;
        if part.is_connection() && !path.is_empty() {
            let container = &path[..path.len() - 1];
            for binding in &part.connection_bindings {
                if binding.endpoint.len() == container.len() + 1
                    && binding.endpoint.starts_with(container)
                {
                    data.container_through_endpoint = Some(binding.alias.clone());
                    break;
                }
            }
        }

        debug!(
            part = path.join("."),
            members = data.local_members.len() + data.global_members.len(),
            "backend data"
        );
        root.part_at_mut(&path).unwrap().backend_data = Some(Box::new(data));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bindings::resolve_connection_bindings;
    use crate::order::{collect_dependencies, determine_order};
    use crate::resolve::{fill_integrated, resolve_lhs, resolve_rhs};
    use crate::specials::{add_specials, seed_attributes};
    use dendrite_model::Node;

    fn build(text: &str) -> EquationSet {
        let doc = Node::from_text(text).unwrap();
        let mut model = EquationSet::from_node("", &doc).unwrap();
        let mut errors = Vec::new();
        resolve_connection_bindings(&mut model, &mut errors);
        add_specials(&mut model);
        seed_attributes(&mut model);
        resolve_lhs(&mut model, &mut errors);
        resolve_rhs(&mut model, &mut errors);
        fill_integrated(&mut model);
        collect_dependencies(&mut model);
        determine_order(&mut model);
        find_singletons(&mut model);
        analyze(&mut model);
        model
    }

    #[test]
    fn storage_classes() {
        let model = build("layer:\n $n:10\n V:$init@1\n V':0-V\n");
        let layer = model.find_part("layer").unwrap();
        let data = layer.backend_data.as_ref().unwrap();
        assert!(data.local_members.contains(&VariableKey::new("V", 0)));
        assert!(data.local_integrated.contains(&VariableKey::new("V", 0)));
        assert!(data.local_derivative.contains(&VariableKey::new("V", 1)));
        // $n is population state.
        assert!(data.global_members.contains(&VariableKey::new("$n", 0)));
        assert!(data.needs_index);
        assert!(!layer.singleton);
    }

    #[test]
    fn singleton_detection() {
        let model = build("one:\n V:0\nmany:\n $n:4\n V:0\n");
        assert!(model.find_part("one").unwrap().singleton);
        assert!(!model.find_part("many").unwrap().singleton);
        let one = model.find_part("one").unwrap();
        assert!(!one.backend_data.as_ref().unwrap().needs_index);
    }

    #[test]
    fn buffered_external_write() {
        let model =
            build("A:\n I:+=0\n V:I*2\nC:\n pre:A\n w:$init@1\n pre.I:+=w\n");
        let a = model.find_part("A").unwrap();
        let data = a.backend_data.as_ref().unwrap();
        assert!(data
            .local_buffered_external_write
            .contains(&VariableKey::new("I", 0)));
    }

    #[test]
    fn connection_reaches_container_through_endpoint() {
        let model = build("A:\n V:0\nC:\n pre:A\n w:$init@1\n");
        let c = model.find_part("C").unwrap();
        let data = c.backend_data.as_ref().unwrap();
        assert_eq!(data.container_through_endpoint.as_deref(), Some("pre"));
    }

    #[test]
    fn newborn_flag_on_endpoints() {
        let model = build("A:\n V:0\nC:\n pre:A\n w:$init@1\n");
        let a = model.find_part("A").unwrap();
        assert!(a.backend_data.as_ref().unwrap().flags.newborn.is_some());
        let c = model.find_part("C").unwrap();
        assert!(c.backend_data.as_ref().unwrap().flags.newborn.is_some());
    }
}
