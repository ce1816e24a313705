//! Detection of sparse-matrix-driven connections.
//!
//! A two-endpoint connection whose `$p` reads an element of one matrix,
//! indexed by the endpoints' `$index`, is formed by iterating that matrix's
//! nonzero coordinates instead of the full cross product.

use dendrite_model::eqset::{
    Attribute, ConnectionMatrix, EquationSet, ResolveStep, VariableKey,
};
use dendrite_model::expr::{Expr, ExprKind, Value};
use tracing::debug;

use crate::error::{DigestError, DigestErrorKind};

pub fn find_connection_matrix(root: &mut EquationSet, errors: &mut Vec<DigestError>) {
    let paths = root.part_paths();
    for path in paths {
        let part = root.part_at(&path).unwrap();
        if part.connection_bindings.len() != 2 {
            continue;
        }
        let Some(p) = part.find_variable(&VariableKey::new("$p", 0)) else {
            continue;
        };
        if p.equations.len() != 1 {
            continue;
        }
        let expression = &p.equations[0].expression;
        let ExprKind::Element { base, args } = &expression.kind else {
            continue;
        };
        if args.len() != 2 {
            continue;
        }

        // The driving matrix: a direct matrix() read or a variable that
        // holds one.
        let source = match matrix_source(part, base) {
            Some(s) => s,
            None => continue,
        };
        if !matches!(
            source.kind,
            ExprKind::Constant(Value::Text(_)) | ExprKind::Call { .. }
        ) {
            errors.push(DigestError::at_variable(
                DigestErrorKind::NonStringFileName,
                &path,
                "$p",
                "matrix source must be a literal file name",
            ));
            continue;
        }

        let row_binding = binding_in(part, &args[0]);
        let col_binding = binding_in(part, &args[1]);
        let (Some(row_binding), Some(col_binding)) = (row_binding, col_binding) else {
            continue;
        };
        if row_binding == col_binding {
            continue;
        }

        debug!(part = path.join("."), "connection driven by sparse matrix");
        let info = ConnectionMatrix {
            source,
            row_binding,
            col_binding,
            row_map: args[0].clone(),
            col_map: args[1].clone(),
        };
        let matrix_pointer_target = if let ExprKind::Ident {
            reference: Some(r), ..
        } = &base.kind
        {
            Some(r.target.clone())
        } else {
            None
        };
        let part = root.part_at_mut(&path).unwrap();
        part.connection_matrix = Some(info);
        if let Some(target) = matrix_pointer_target {
            if let Some(variable) = part.find_variable_mut(&target) {
                variable.add_attribute(Attribute::MatrixPointer);
            }
        }
    }
}

/// The file-name expression behind the matrix being read.
fn matrix_source(part: &EquationSet, base: &Expr) -> Option<Expr> {
    match &base.kind {
        ExprKind::Call { name, args } if name == "matrix" => args.first().cloned(),
        ExprKind::Ident {
            reference: Some(r), ..
        } if r.is_local() => {
            let variable = part.find_variable(&r.target)?;
            let equation = variable.default_equation()?;
            match &equation.expression.kind {
                ExprKind::Call { name, args } if name == "matrix" => args.first().cloned(),
                _ => None,
            }
        }
        _ => None,
    }
}

/// Which binding's `$index` the coordinate expression reads.
fn binding_in(part: &EquationSet, expr: &Expr) -> Option<usize> {
    let mut found = None;
    expr.visit(&mut |e| {
        if let ExprKind::Ident {
            reference: Some(r),
            name,
            ..
        } = &e.kind
        {
            if name == "$index" {
                if let Some(ResolveStep::Endpoint(alias)) = r.steps.first() {
                    let index = part
                        .connection_bindings
                        .iter()
                        .find(|b| &b.alias == alias)
                        .map(|b| b.index);
                    if found.is_none() {
                        found = index;
                    }
                }
            }
        }
        true
    });
    found
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
    fn matrix_drive_detected() {
        let text = "A:\n V:0\nB:\n V:0\nC:\n pre:A\n post:B\n \
                    $p:matrix(\"w.csv\")(pre.$index,post.$index)\n";
        let mut model = build(text);
        let mut errors = Vec::new();
        find_connection_matrix(&mut model, &mut errors);
        assert!(errors.is_empty(), "{errors:?}");
        let c = model.find_part("C").unwrap();
        let cm = c.connection_matrix.as_ref().unwrap();
        assert_eq!(cm.row_binding, 0);
        assert_eq!(cm.col_binding, 1);
    }

    #[test]
    fn plain_p_not_matrix_driven() {
        let mut model = build("A:\n V:0\nB:\n V:0\nC:\n pre:A\n post:B\n $p:0.5\n");
        let mut errors = Vec::new();
        find_connection_matrix(&mut model, &mut errors);
        assert!(model.find_part("C").unwrap().connection_matrix.is_none());
    }
}
