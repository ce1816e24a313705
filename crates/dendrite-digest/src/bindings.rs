//! Connection-binding resolution.
//!
//! A variable whose single unconditional equation is a bare part name turns
//! into an endpoint binding: the variable is removed and the part becomes a
//! connection. Resolution searches the container chain for the named part,
//! recording the step path used to enumerate endpoint instances.

use dendrite_model::eqset::{ConnectionBinding, EquationSet, ResolveStep};
use dendrite_model::expr::ExprKind;
use tracing::debug;

use crate::error::DigestError;

pub fn resolve_connection_bindings(root: &mut EquationSet, _errors: &mut [DigestError]) {
    let paths = root.part_paths();
    for path in paths {
        let part = root.part_at(&path).unwrap();
        // Candidate aliases, in declaration order.
        let mut candidates: Vec<(dendrite_model::VariableKey, Vec<String>)> = Vec::new();
        for (key, variable) in &part.variables {
            if key.order != 0 || variable.is_special() {
                continue;
            }
            if variable.equations.len() != 1 || !variable.equations[0].is_default() {
                continue;
            }
            if let ExprKind::Ident {
                path: prefix,
                name,
                order: 0,
                ..
            } = &variable.equations[0].expression.kind
            {
                let mut segments = prefix.clone();
                segments.push(name.clone());
                candidates.push((key.clone(), segments));
            }
        }

        let mut bindings = Vec::new();
        for (key, segments) in candidates {
            if let Some((endpoint, resolution)) = find_part(root, &path, &segments) {
                debug!(
                    connection = path.join("."),
                    alias = %key.name,
                    endpoint = endpoint.join("."),
                    "binding resolved"
                );
                bindings.push((key, endpoint, resolution));
            }
            // Names that do not resolve to a part stay behind as ordinary
            // variables; if they resolve to nothing at all, RHS resolution
            // reports them.
        }

        if bindings.is_empty() {
            continue;
        }
        let part = root.part_at_mut(&path).unwrap();
        for (key, endpoint, resolution) in bindings {
            part.variables.shift_remove(&key);
            let index = part.connection_bindings.len();
            part.connection_bindings.push(ConnectionBinding {
                alias: key.name,
                endpoint,
                index,
                resolution,
            });
        }
    }
}

/// Locate a part by name segments, searching outward from `from`.
///
/// Returns the absolute path of the target and the `Up`/`Down` steps that
/// reach it from `from`.
pub fn find_part(
    root: &EquationSet,
    from: &[String],
    segments: &[String],
) -> Option<(Vec<String>, Vec<ResolveStep>)> {
    let mut base = from.to_vec();
    let mut ups = 0usize;
    loop {
        if let Some(found) = descend(root, &base, segments) {
            let mut steps: Vec<ResolveStep> = vec![ResolveStep::Up; ups];
            steps.extend(segments.iter().map(|s| ResolveStep::Down(s.clone())));
            return Some((found, steps));
        }
        if base.is_empty() {
            return None;
        }
        base.pop();
        ups += 1;
    }
}

fn descend(root: &EquationSet, base: &[String], segments: &[String]) -> Option<Vec<String>> {
    let mut path = base.to_vec();
    let mut part = root.part_at(&path)?;
    for segment in segments {
        part = part.find_part(segment)?;
        path.push(segment.clone());
    }
    Some(path)
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
    fn sibling_binding_resolves() {
        let mut model = build("A:\n V:0\nB:\n V:0\nC:\n pre:A\n post:B\n I:1\n");
        let mut errors = Vec::new();
        resolve_connection_bindings(&mut model, &mut errors);
        let c = model.find_part("C").unwrap();
        assert!(c.is_connection());
        assert_eq!(c.connection_bindings.len(), 2);
        assert_eq!(c.connection_bindings[0].alias, "pre");
        assert_eq!(c.connection_bindings[0].endpoint, vec!["A".to_string()]);
        assert_eq!(c.connection_bindings[1].index, 1);
        // The alias variables are gone; ordinary variables stay.
        assert!(c.variables.len() == 1);
    }

    #[test]
    fn binding_steps_ascend_then_descend() {
        let mut model = build("A:\n V:0\nnest:\n C:\n  pre:A\n");
        let mut errors = Vec::new();
        resolve_connection_bindings(&mut model, &mut errors);
        let c = model
            .part_at(&["nest".to_string(), "C".to_string()])
            .unwrap();
        assert_eq!(
            c.connection_bindings[0].resolution,
            vec![ResolveStep::Up, ResolveStep::Up, ResolveStep::Down("A".into())]
        );
    }

    #[test]
    fn non_part_name_left_alone() {
        let mut model = build("A:\n V:0\n alias:V\n");
        let mut errors = Vec::new();
        resolve_connection_bindings(&mut model, &mut errors);
        let a = model.find_part("A").unwrap();
        assert!(!a.is_connection());
        assert_eq!(a.variables.len(), 2);
    }
}
