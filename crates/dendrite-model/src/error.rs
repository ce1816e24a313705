//! Model-loading errors.

use thiserror::Error;

/// Result type for model loading and parsing.
pub type Result<T> = std::result::Result<T, ModelError>;

/// Errors raised while reading a model tree or parsing equation text.
#[derive(Debug, Error)]
pub enum ModelError {
    #[error("line {line}: {message}")]
    Tree { line: usize, message: String },

    #[error("in '{context}': {message}")]
    Equation { context: String, message: String },

    #[error("unknown unit '{0}'")]
    UnknownUnit(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl ModelError {
    pub fn equation(context: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Equation {
            context: context.into(),
            message: message.into(),
        }
    }
}
