//! Runtime errors.
//!
//! Stream problems are recoverable: they are logged and the operation
//! returns a safe default. Everything else terminates the run cooperatively.

use thiserror::Error;

/// Runtime result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Simulation-phase errors.
#[derive(Debug, Error)]
pub enum Error {
    #[error("ill-formed matrix in '{file}': {message}")]
    BadMatrix { file: String, message: String },

    #[error("missing input file '{0}'")]
    MissingInput(String),

    #[error("holder '{name}' already open with a different role")]
    HolderConflict { name: String },

    #[error("simulation aborted: {0}")]
    Abort(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
