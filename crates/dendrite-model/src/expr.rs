//! Expression trees for the equation language.
//!
//! Expressions are built by the parser and then decorated in place by the
//! digest: identifiers gain resolved [`VariableReference`]s, every node gains
//! a type, and under a fixed-point target every node gains an exponent pair.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::eqset::VariableReference;
use crate::units::Unit;

/// Sentinel for an exponent that has not been determined yet.
pub const UNKNOWN_EXPONENT: i32 = i32::MIN;

/// Storage type of a value or variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VarType {
    Scalar,
    Matrix,
    Text,
}

/// A literal value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Scalar(f64),
    Matrix {
        rows: usize,
        cols: usize,
        data: Vec<f64>,
    },
    Text(String),
}

impl Value {
    pub fn var_type(&self) -> VarType {
        match self {
            Value::Scalar(_) => VarType::Scalar,
            Value::Matrix { .. } => VarType::Matrix,
            Value::Text(_) => VarType::Text,
        }
    }

    pub fn as_scalar(&self) -> Option<f64> {
        match self {
            Value::Scalar(v) => Some(*v),
            _ => None,
        }
    }

    /// Truthiness used by conditions: nonzero scalar, nonempty text.
    pub fn is_true(&self) -> bool {
        match self {
            Value::Scalar(v) => *v != 0.0,
            Value::Matrix { data, .. } => data.iter().any(|v| *v != 0.0),
            Value::Text(t) => !t.is_empty(),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Scalar(v) => write!(f, "{v}"),
            Value::Text(t) => write!(f, "{t:?}"),
            Value::Matrix { rows, cols, data } => {
                write!(f, "[")?;
                for r in 0..*rows {
                    if r > 0 {
                        write!(f, ";")?;
                    }
                    for c in 0..*cols {
                        if c > 0 {
                            write!(f, ",")?;
                        }
                        write!(f, "{}", data[r * cols + c])?;
                    }
                }
                write!(f, "]")
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnaryOp {
    Neg,
    Not,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Pow,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
}

impl BinaryOp {
    /// True for operators whose result is 0/1.
    pub fn is_boolean(self) -> bool {
        matches!(
            self,
            BinaryOp::Eq
                | BinaryOp::Ne
                | BinaryOp::Lt
                | BinaryOp::Le
                | BinaryOp::Gt
                | BinaryOp::Ge
                | BinaryOp::And
                | BinaryOp::Or
        )
    }
}

/// Expression node kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ExprKind {
    Constant(Value),
    /// A variable occurrence. `path` holds any leading part names
    /// (`layer.V` keeps `["layer"]`), `name`/`order` identify the variable.
    Ident {
        path: Vec<String>,
        name: String,
        order: usize,
        reference: Option<VariableReference>,
    },
    Unary {
        op: UnaryOp,
        operand: Box<Expr>,
    },
    Binary {
        op: BinaryOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Call {
        name: String,
        args: Vec<Expr>,
    },
    /// Matrix element access `base(row, col)`.
    Element {
        base: Box<Expr>,
        args: Vec<Expr>,
    },
    /// Matrix literal `[a,b;c,d]`, row major.
    MatrixLiteral {
        rows: Vec<Vec<Expr>>,
    },
}

/// A decorated expression.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Expr {
    pub kind: ExprKind,
    pub ty: Option<VarType>,
    pub unit: Option<Unit>,
    /// Power-of-two position of the MSB of this node's value (fixed-point).
    pub exponent: i32,
    /// Exponent this node's parent expects of it (fixed-point).
    pub exponent_next: i32,
}

impl Expr {
    pub fn new(kind: ExprKind) -> Self {
        Self {
            kind,
            ty: None,
            unit: None,
            exponent: UNKNOWN_EXPONENT,
            exponent_next: UNKNOWN_EXPONENT,
        }
    }

    pub fn scalar(v: f64) -> Self {
        Self::new(ExprKind::Constant(Value::Scalar(v)))
    }

    pub fn ident(name: impl Into<String>) -> Self {
        let full: String = name.into();
        let order = full.chars().rev().take_while(|c| *c == '\'').count();
        let name = full[..full.len() - order].to_string();
        Self::new(ExprKind::Ident {
            path: Vec::new(),
            name,
            order,
            reference: None,
        })
    }

    pub fn as_constant(&self) -> Option<&Value> {
        match &self.kind {
            ExprKind::Constant(v) => Some(v),
            _ => None,
        }
    }

    pub fn is_constant(&self) -> bool {
        matches!(self.kind, ExprKind::Constant(_))
    }

    /// Depth-first visit; the callback returns false to prune a subtree.
    pub fn visit(&self, f: &mut impl FnMut(&Expr) -> bool) {
        if !f(self) {
            return;
        }
        match &self.kind {
            ExprKind::Constant(_) | ExprKind::Ident { .. } => {}
            ExprKind::Unary { operand, .. } => operand.visit(f),
            ExprKind::Binary { left, right, .. } => {
                left.visit(f);
                right.visit(f);
            }
            ExprKind::Call { args, .. } => {
                for a in args {
                    a.visit(f);
                }
            }
            ExprKind::Element { base, args } => {
                base.visit(f);
                for a in args {
                    a.visit(f);
                }
            }
            ExprKind::MatrixLiteral { rows } => {
                for row in rows {
                    for e in row {
                        e.visit(f);
                    }
                }
            }
        }
    }

    /// Depth-first mutable transform, children first.
    pub fn transform(&mut self, f: &mut impl FnMut(&mut Expr)) {
        match &mut self.kind {
            ExprKind::Constant(_) | ExprKind::Ident { .. } => {}
            ExprKind::Unary { operand, .. } => operand.transform(f),
            ExprKind::Binary { left, right, .. } => {
                left.transform(f);
                right.transform(f);
            }
            ExprKind::Call { args, .. } => {
                for a in args {
                    a.transform(f);
                }
            }
            ExprKind::Element { base, args } => {
                base.transform(f);
                for a in args {
                    a.transform(f);
                }
            }
            ExprKind::MatrixLiteral { rows } => {
                for row in rows {
                    for e in row {
                        e.transform(f);
                    }
                }
            }
        }
        f(self);
    }

    /// Collect every identifier occurrence as `(path, name, order)`.
    pub fn identifiers(&self) -> Vec<(Vec<String>, String, usize)> {
        let mut out = Vec::new();
        self.visit(&mut |e| {
            if let ExprKind::Ident {
                path, name, order, ..
            } = &e.kind
            {
                out.push((path.clone(), name.clone(), *order));
            }
            true
        });
        out
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            ExprKind::Constant(v) => write!(f, "{v}"),
            ExprKind::Ident {
                path, name, order, ..
            } => {
                for p in path {
                    write!(f, "{p}.")?;
                }
                write!(f, "{name}{}", "'".repeat(*order))
            }
            ExprKind::Unary { op, operand } => {
                let symbol = match op {
                    UnaryOp::Neg => "-",
                    UnaryOp::Not => "!",
                };
                write!(f, "{symbol}{operand}")
            }
            ExprKind::Binary { op, left, right } => {
                let symbol = match op {
                    BinaryOp::Add => "+",
                    BinaryOp::Sub => "-",
                    BinaryOp::Mul => "*",
                    BinaryOp::Div => "/",
                    BinaryOp::Mod => "%",
                    BinaryOp::Pow => "^",
                    BinaryOp::Eq => "==",
                    BinaryOp::Ne => "!=",
                    BinaryOp::Lt => "<",
                    BinaryOp::Le => "<=",
                    BinaryOp::Gt => ">",
                    BinaryOp::Ge => ">=",
                    BinaryOp::And => "&&",
                    BinaryOp::Or => "||",
                };
                write!(f, "({left}{symbol}{right})")
            }
            ExprKind::Call { name, args } => {
                write!(f, "{name}(")?;
                for (i, a) in args.iter().enumerate() {
                    if i > 0 {
                        write!(f, ",")?;
                    }
                    write!(f, "{a}")?;
                }
                write!(f, ")")
            }
            ExprKind::Element { base, args } => {
                write!(f, "{base}(")?;
                for (i, a) in args.iter().enumerate() {
                    if i > 0 {
                        write!(f, ",")?;
                    }
                    write!(f, "{a}")?;
                }
                write!(f, ")")
            }
            ExprKind::MatrixLiteral { rows } => {
                write!(f, "[")?;
                for (r, row) in rows.iter().enumerate() {
                    if r > 0 {
                        write!(f, ";")?;
                    }
                    for (c, e) in row.iter().enumerate() {
                        if c > 0 {
                            write!(f, ",")?;
                        }
                        write!(f, "{e}")?;
                    }
                }
                write!(f, "]")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ident_strips_order() {
        let e = Expr::ident("V''");
        match e.kind {
            ExprKind::Ident { name, order, .. } => {
                assert_eq!(name, "V");
                assert_eq!(order, 2);
            }
            _ => panic!(),
        }
    }

    #[test]
    fn identifiers_collected() {
        let e = Expr::new(ExprKind::Binary {
            op: BinaryOp::Add,
            left: Box::new(Expr::ident("a")),
            right: Box::new(Expr::ident("b'")),
        });
        let ids = e.identifiers();
        assert_eq!(ids.len(), 2);
        assert_eq!(ids[1].1, "b");
        assert_eq!(ids[1].2, 1);
    }

    #[test]
    fn value_truthiness() {
        assert!(Value::Scalar(2.0).is_true());
        assert!(!Value::Scalar(0.0).is_true());
        assert!(!Value::Text(String::new()).is_true());
    }
}
