//! Event-operator analysis.
//!
//! Each `event(condition[, delay[, edge]])` call becomes an
//! [`EventTarget`] on the part containing it, with a latch bit, a trigger
//! edge, and a delay classification. The part whose variables the condition
//! watches gains an [`EventSource`], so its finalize scans the listeners.

use dendrite_model::analysis::{EventDelay, EventSource, EventTarget, TriggerEdge};
use dendrite_model::eqset::{EquationSet, Variable, VariableKey};
use dendrite_model::expr::{ExprKind, Value};
use tracing::debug;

use crate::error::{DigestError, DigestErrorKind};

pub fn analyze_events(root: &mut EquationSet, errors: &mut Vec<DigestError>) {
    let paths = root.part_paths();
    for path in paths {
        let part = root.part_at(&path).unwrap();

        // Collect event calls in declaration order.
        let mut calls: Vec<(Vec<dendrite_model::Expr>,)> = Vec::new();
        for variable in part.variables.values() {
            variable.visit_expressions(&mut |e| {
                if let ExprKind::Call { name, args } = &e.kind {
                    if name == "event" {
                        calls.push((args.clone(),));
                    }
                }
                true
            });
        }
        if calls.is_empty() {
            continue;
        }

        let mut targets: Vec<EventTarget> = Vec::new();
        let mut sources: Vec<(Vec<String>, EventSource)> = Vec::new();
        let mut aux: Vec<Variable> = Vec::new();

        for (value_index, (args,)) in calls.into_iter().enumerate() {
            let Some(condition) = args.first() else {
                errors.push(DigestError::at_variable(
                    DigestErrorKind::IllFormedType,
                    &path,
                    "event",
                    "event() needs a condition",
                ));
                continue;
            };

            let delay = match args.get(1) {
                None => EventDelay::None,
                Some(d) => match d.as_constant() {
                    Some(Value::Scalar(v)) if *v == 0.0 => EventDelay::None,
                    Some(Value::Scalar(v)) => EventDelay::Constant(*v),
                    _ => EventDelay::Expression(d.clone()),
                },
            };

            let edge = match args.get(2).and_then(|e| e.as_constant()) {
                Some(Value::Text(t)) => match t.as_str() {
                    "rise" => TriggerEdge::Rise,
                    "fall" => TriggerEdge::Fall,
                    "change" => TriggerEdge::Change,
                    "nonzero" => TriggerEdge::Nonzero,
                    other => {
                        errors.push(DigestError::at_variable(
                            DigestErrorKind::IllFormedType,
                            &path,
                            "event",
                            format!("unknown edge '{other}'"),
                        ));
                        TriggerEdge::Rise
                    }
                },
                _ => TriggerEdge::Rise,
            };

            // Edge detection compares against the previous test value.
            // Stored variables are no substitute: by the time the scan
            // runs, finalize has already committed their buffers, so every
            // edge gets its own slot.
            let tracking_variable = match edge {
                TriggerEdge::Nonzero => None,
                _ => {
                    let key = VariableKey::new(format!("eventaux{value_index}"), 0);
                    aux.push(Variable::new(key.clone()));
                    Some(key)
                }
            };

            // The source part is where the watched variables live.
            let mut source_part = path.clone();
            condition.visit(&mut |e| {
                if let ExprKind::Ident {
                    reference: Some(r), ..
                } = &e.kind
                {
                    if !r.is_local() && source_part == path {
                        source_part = r.target_part.clone();
                    }
                }
                true
            });

            let timestamped = edge == TriggerEdge::Nonzero
                && !matches!(delay, EventDelay::None);

            debug!(
                part = path.join("."),
                value_index,
                ?edge,
                "event target"
            );
            targets.push(EventTarget {
                value_index,
                edge,
                condition: condition.clone(),
                delay: delay.clone(),
                tracking_variable,
                latch_bit: 0, // assigned with the flag layout
                timestamped,
            });
            sources.push((
                source_part,
                EventSource {
                    monitored_part: path.clone(),
                    target_index: value_index,
                    latch_only: matches!(delay, EventDelay::None),
                },
            ));
        }

        let part = root.part_at_mut(&path).unwrap();
        for variable in aux {
            part.variables.insert(variable.key(), variable);
        }
        part.backend_data
            .get_or_insert_with(Default::default)
            .event_targets = targets;

        for (source_part, source) in sources {
            let Some(part) = root.part_at_mut(&source_part) else {
                continue;
            };
            part.backend_data
                .get_or_insert_with(Default::default)
                .event_sources
                .push(source);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bindings::resolve_connection_bindings;
    use crate::resolve::resolve_rhs;
    use crate::specials::add_specials;
    use dendrite_model::Node;

    fn build(text: &str) -> EquationSet {
        let doc = Node::from_text(text).unwrap();
        let mut model = EquationSet::from_node("", &doc).unwrap();
        let mut errors = Vec::new();
        resolve_connection_bindings(&mut model, &mut errors);
        add_specials(&mut model);
        resolve_rhs(&mut model, &mut errors);
        assert!(errors.is_empty(), "{errors:?}");
        model
    }

    #[test]
    fn local_event_analyzed() {
        let mut model = build("cell:\n V:0\n I:event(V,0.2,\"rise\")@1\n");
        let mut errors = Vec::new();
        analyze_events(&mut model, &mut errors);
        assert!(errors.is_empty(), "{errors:?}");
        let cell = model.find_part("cell").unwrap();
        let data = cell.backend_data.as_ref().unwrap();
        assert_eq!(data.event_targets.len(), 1);
        let target = &data.event_targets[0];
        assert_eq!(target.edge, TriggerEdge::Rise);
        assert_eq!(target.delay, EventDelay::Constant(0.2));
        // Even a stored-variable condition tracks its previous value: the
        // buffer commit runs before the scan, so the stored slot alone
        // cannot expose an edge.
        assert_eq!(
            target.tracking_variable,
            Some(VariableKey::new("eventaux0", 0))
        );
        assert!(cell
            .find_variable(&VariableKey::new("eventaux0", 0))
            .is_some());
        assert_eq!(data.event_sources.len(), 1);
        assert!(!data.event_sources[0].latch_only);
    }

    #[test]
    fn cross_part_event_source() {
        let mut model =
            build("A:\n V:0\nC:\n pre:A\n g:0\n w:event(pre.V)@1\n");
        let mut errors = Vec::new();
        analyze_events(&mut model, &mut errors);
        assert!(errors.is_empty(), "{errors:?}");
        let a = model.find_part("A").unwrap();
        let data = a.backend_data.as_ref().unwrap();
        assert_eq!(data.event_sources.len(), 1);
        assert_eq!(data.event_sources[0].monitored_part, vec!["C".to_string()]);
        // No delay: spikes only set latches.
        assert!(data.event_sources[0].latch_only);
    }

    #[test]
    fn expression_condition_gets_tracker() {
        let mut model = build("cell:\n V:0\n x:event(V>0.5,0,\"change\")@1\n");
        let mut errors = Vec::new();
        analyze_events(&mut model, &mut errors);
        let cell = model.find_part("cell").unwrap();
        let data = cell.backend_data.as_ref().unwrap();
        assert!(data.event_targets[0].tracking_variable.is_some());
        assert!(cell
            .find_variable(&VariableKey::new("eventaux0", 0))
            .is_some());
    }
}
