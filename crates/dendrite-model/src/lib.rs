//! Model representation for the dendrite compiler.
//!
//! A model enters the pipeline as a key/value [`tree::Node`], is assembled
//! into an [`eqset::EquationSet`] hierarchy, and its equation text is parsed
//! into [`expr::Expr`] trees by the lexer/parser pair. Everything downstream
//! (digest, planning, code emission) decorates these structures in place.

pub mod analysis;
pub mod error;
pub mod eqset;
pub mod expr;
pub mod lexer;
pub mod parser;
pub mod tree;
pub mod units;

pub use error::ModelError;
pub use eqset::{
    Assignment, ConnectionBinding, EquationEntry, EquationSet, ResolveStep, Variable, VariableKey,
    VariableReference,
};
pub use expr::{BinaryOp, Expr, ExprKind, UnaryOp, Value};
pub use tree::Node;
