//! Pratt expression parser (precedence climbing).

use super::TokenStream;
use crate::expr::{BinaryOp, Expr, ExprKind, UnaryOp, Value};
use crate::lexer::Token;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Assoc {
    Left,
    Right,
}

/// Binary operator metadata: precedence (higher binds tighter),
/// associativity, and the operator itself.
fn binary_op_info(token: &Token) -> Option<(u8, Assoc, BinaryOp)> {
    match token {
        Token::OrOr => Some((10, Assoc::Left, BinaryOp::Or)),
        Token::AndAnd => Some((20, Assoc::Left, BinaryOp::And)),
        Token::EqEq => Some((30, Assoc::Left, BinaryOp::Eq)),
        Token::BangEq => Some((30, Assoc::Left, BinaryOp::Ne)),
        Token::Lt => Some((30, Assoc::Left, BinaryOp::Lt)),
        Token::LtEq => Some((30, Assoc::Left, BinaryOp::Le)),
        Token::Gt => Some((30, Assoc::Left, BinaryOp::Gt)),
        Token::GtEq => Some((30, Assoc::Left, BinaryOp::Ge)),
        Token::Plus => Some((40, Assoc::Left, BinaryOp::Add)),
        Token::Minus => Some((40, Assoc::Left, BinaryOp::Sub)),
        Token::Star => Some((50, Assoc::Left, BinaryOp::Mul)),
        Token::Slash => Some((50, Assoc::Left, BinaryOp::Div)),
        Token::Percent => Some((50, Assoc::Left, BinaryOp::Mod)),
        Token::Caret => Some((60, Assoc::Right, BinaryOp::Pow)),
        _ => None,
    }
}

pub fn parse_expr(stream: &mut TokenStream) -> Result<Expr, String> {
    parse_pratt(stream, 0)
}

fn parse_pratt(stream: &mut TokenStream, min_prec: u8) -> Result<Expr, String> {
    let mut left = parse_prefix(stream)?;

    while let Some(token) = stream.peek() {
        let Some((prec, assoc, op)) = binary_op_info(token) else {
            break;
        };
        if prec < min_prec {
            break;
        }
        stream.advance();
        let next_prec = if assoc == Assoc::Left { prec + 1 } else { prec };
        let right = parse_pratt(stream, next_prec)?;
        left = Expr::new(ExprKind::Binary {
            op,
            left: Box::new(left),
            right: Box::new(right),
        });
    }

    Ok(left)
}

fn parse_prefix(stream: &mut TokenStream) -> Result<Expr, String> {
    match stream.peek() {
        Some(Token::Minus) => {
            stream.advance();
            let operand = parse_prefix(stream)?;
            // Fold negation of literals so "-1" is a constant.
            if let ExprKind::Constant(Value::Scalar(v)) = operand.kind {
                return Ok(Expr::scalar(-v));
            }
            Ok(Expr::new(ExprKind::Unary {
                op: UnaryOp::Neg,
                operand: Box::new(operand),
            }))
        }
        Some(Token::Bang) => {
            stream.advance();
            let operand = parse_prefix(stream)?;
            Ok(Expr::new(ExprKind::Unary {
                op: UnaryOp::Not,
                operand: Box::new(operand),
            }))
        }
        _ => parse_postfix(stream),
    }
}

fn parse_postfix(stream: &mut TokenStream) -> Result<Expr, String> {
    let mut expr = parse_atom(stream)?;

    // `name(...)` is a call for known identifiers and an element access for
    // anything else that evaluates to a matrix; further argument lists keep
    // indexing the result, as in `matrix("w")(row, col)`.
    let mut first = true;
    while matches!(stream.peek(), Some(Token::LParen)) {
        let args = parse_call_args(stream)?;
        expr = match expr.kind {
            ExprKind::Ident {
                ref path,
                ref name,
                order: 0,
                ..
            } if first && path.is_empty() && is_function_name(name) => {
                Expr::new(ExprKind::Call {
                    name: name.clone(),
                    args,
                })
            }
            _ => Expr::new(ExprKind::Element {
                base: Box::new(expr),
                args,
            }),
        };
        first = false;
    }

    Ok(expr)
}

fn parse_atom(stream: &mut TokenStream) -> Result<Expr, String> {
    match stream.advance().cloned() {
        Some(Token::Number(v)) => Ok(Expr::scalar(v)),
        Some(Token::Str(s)) => Ok(Expr::new(ExprKind::Constant(Value::Text(s)))),
        Some(Token::Ident(first)) => {
            // Dotted parts accumulate into the path; the final segment is
            // the variable name with any derivative order.
            let mut segments = vec![first];
            while stream.eat(&Token::Dot) {
                match stream.advance().cloned() {
                    Some(Token::Ident(next)) => segments.push(next),
                    other => return Err(format!("expected name after '.', found {other:?}")),
                }
            }
            let last = segments.pop().unwrap();
            let mut expr = Expr::ident(last);
            if let ExprKind::Ident { path, .. } = &mut expr.kind {
                *path = segments;
            }
            Ok(expr)
        }
        Some(Token::LParen) => {
            let inner = parse_expr(stream)?;
            stream.expect(Token::RParen)?;
            Ok(inner)
        }
        Some(Token::LBracket) => parse_matrix(stream),
        other => Err(format!("expected expression, found {other:?}")),
    }
}

fn parse_matrix(stream: &mut TokenStream) -> Result<Expr, String> {
    let mut rows = vec![Vec::new()];
    loop {
        let e = parse_expr(stream)?;
        rows.last_mut().unwrap().push(e);
        match stream.advance().cloned() {
            Some(Token::Comma) => {}
            Some(Token::Semicolon) => rows.push(Vec::new()),
            Some(Token::RBracket) => break,
            other => return Err(format!("expected ',', ';' or ']', found {other:?}")),
        }
    }
    let width = rows[0].len();
    if rows.iter().any(|r| r.len() != width) {
        return Err("ragged matrix literal".to_string());
    }
    Ok(Expr::new(ExprKind::MatrixLiteral { rows }))
}

fn parse_call_args(stream: &mut TokenStream) -> Result<Vec<Expr>, String> {
    stream.expect(Token::LParen)?;
    let mut args = Vec::new();
    if stream.eat(&Token::RParen) {
        return Ok(args);
    }
    loop {
        args.push(parse_expr(stream)?);
        if stream.eat(&Token::RParen) {
            break;
        }
        stream.expect(Token::Comma)?;
    }
    Ok(args)
}

/// Names recognized as built-in functions rather than matrix reads.
pub fn is_function_name(name: &str) -> bool {
    matches!(
        name,
        "abs" | "atan"
            | "ceil"
            | "cos"
            | "delay"
            | "event"
            | "exp"
            | "floor"
            | "gaussian"
            | "input"
            | "log"
            | "matrix"
            | "max"
            | "min"
            | "norm"
            | "output"
            | "round"
            | "sin"
            | "sqrt"
            | "tan"
            | "tanh"
            | "uniform"
    )
}
