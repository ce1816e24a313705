//! Hand-written recursive-descent parser for equation text.

mod expr;
mod stream;

pub use stream::TokenStream;

use crate::error::{ModelError, Result};
use crate::expr::Expr;
use crate::lexer;

/// Parse one expression from source text.
pub fn parse_expression(source: &str) -> Result<Expr> {
    let tokens = lexer::tokenize(source)
        .map_err(|pos| ModelError::equation(source, format!("bad character at offset {pos}")))?;
    let mut stream = TokenStream::new(&tokens);
    let parsed = expr::parse_expr(&mut stream)
        .map_err(|message| ModelError::equation(source, message))?;
    if !stream.at_end() {
        return Err(ModelError::equation(source, "trailing tokens"));
    }
    Ok(parsed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::{BinaryOp, ExprKind, Value};

    #[test]
    fn precedence() {
        let e = parse_expression("1+2*3").unwrap();
        match e.kind {
            ExprKind::Binary { op, right, .. } => {
                assert_eq!(op, BinaryOp::Add);
                assert!(matches!(right.kind, ExprKind::Binary { op: BinaryOp::Mul, .. }));
            }
            _ => panic!(),
        }
    }

    #[test]
    fn right_assoc_pow() {
        let e = parse_expression("2^3^2").unwrap();
        match e.kind {
            ExprKind::Binary { op, left, .. } => {
                assert_eq!(op, BinaryOp::Pow);
                assert!(matches!(left.kind, ExprKind::Constant(Value::Scalar(v)) if v == 2.0));
            }
            _ => panic!(),
        }
    }

    #[test]
    fn call_and_args() {
        let e = parse_expression("uniform()+gaussian(1,2)").unwrap();
        let ids: Vec<String> = {
            let mut names = Vec::new();
            e.visit(&mut |node| {
                if let ExprKind::Call { name, .. } = &node.kind {
                    names.push(name.clone());
                }
                true
            });
            names
        };
        assert_eq!(ids, vec!["uniform".to_string(), "gaussian".to_string()]);
    }

    #[test]
    fn dotted_down_reference() {
        let e = parse_expression("layer.V'").unwrap();
        match e.kind {
            ExprKind::Ident {
                path, name, order, ..
            } => {
                assert_eq!(path, vec!["layer".to_string()]);
                assert_eq!(name, "V");
                assert_eq!(order, 1);
            }
            _ => panic!(),
        }
    }

    #[test]
    fn matrix_literal() {
        let e = parse_expression("[1,2;3,4]").unwrap();
        match e.kind {
            ExprKind::MatrixLiteral { rows } => {
                assert_eq!(rows.len(), 2);
                assert_eq!(rows[0].len(), 2);
            }
            _ => panic!(),
        }
    }

    #[test]
    fn comparison_chain_with_logic() {
        let e = parse_expression("V>1&&$t<10").unwrap();
        assert!(matches!(
            e.kind,
            ExprKind::Binary { op: BinaryOp::And, .. }
        ));
    }

    #[test]
    fn element_access() {
        let e = parse_expression("W(r,c)*2").unwrap();
        let mut saw_element = false;
        e.visit(&mut |node| {
            if matches!(node.kind, ExprKind::Element { .. }) {
                saw_element = true;
            }
            true
        });
        assert!(saw_element);
    }

    #[test]
    fn trailing_garbage_rejected() {
        assert!(parse_expression("1+2 3").is_err());
    }
}
