//! Digest diagnostics.
//!
//! Digest errors are collected with the path of the offending node and
//! surfaced as a single batch; the pipeline does not attempt recovery.

use std::fmt;

use thiserror::Error;

/// Category of digest failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DigestErrorKind {
    /// A name does not resolve to any variable or part.
    UnresolvedReference,
    /// A down-reference lands in a non-singleton part.
    AmbiguousReference,
    /// Incompatible units on either side of add/subtract.
    UnitMismatch,
    /// Conflicting storage types inferred for one variable.
    TypeInconsistency,
    /// Fixed-point exponent could not be determined.
    ExponentUnderdetermined,
    /// `$type` expression does not name parts.
    IllFormedType,
    /// A `$type` transition target cannot satisfy a connection binding.
    UnfulfilledBinding,
    /// Dynamic file name that is not a string expression.
    NonStringFileName,
    /// Connection alias does not bind to a part.
    UnresolvedBinding,
}

impl DigestErrorKind {
    pub fn name(self) -> &'static str {
        match self {
            DigestErrorKind::UnresolvedReference => "unresolved reference",
            DigestErrorKind::AmbiguousReference => "ambiguous reference",
            DigestErrorKind::UnitMismatch => "unit mismatch",
            DigestErrorKind::TypeInconsistency => "type inconsistency",
            DigestErrorKind::ExponentUnderdetermined => "underdetermined exponent",
            DigestErrorKind::IllFormedType => "ill-formed $type expression",
            DigestErrorKind::UnfulfilledBinding => "unfulfilled connection binding",
            DigestErrorKind::NonStringFileName => "file name is not a string expression",
            DigestErrorKind::UnresolvedBinding => "unresolved connection binding",
        }
    }
}

/// One digest diagnostic: kind, node path, human-readable message.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub struct DigestError {
    pub kind: DigestErrorKind,
    /// Dotted path of the part (and variable) the diagnostic refers to.
    pub path: String,
    pub message: String,
}

impl DigestError {
    pub fn new(kind: DigestErrorKind, path: &[String], message: impl Into<String>) -> Self {
        Self {
            kind,
            path: path.join("."),
            message: message.into(),
        }
    }

    /// Diagnostic anchored at a variable within a part.
    pub fn at_variable(
        kind: DigestErrorKind,
        path: &[String],
        variable: impl fmt::Display,
        message: impl Into<String>,
    ) -> Self {
        let mut path = path.join(".");
        if !path.is_empty() {
            path.push('.');
        }
        Self {
            kind,
            path: format!("{path}{variable}"),
            message: message.into(),
        }
    }
}

impl fmt::Display for DigestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.path.is_empty() {
            write!(f, "{}: {}", self.kind.name(), self.message)
        } else {
            write!(f, "{}: {}: {}", self.kind.name(), self.path, self.message)
        }
    }
}

/// Result carrying a batch of diagnostics on failure.
pub type DigestResult<T> = Result<T, Vec<DigestError>>;
