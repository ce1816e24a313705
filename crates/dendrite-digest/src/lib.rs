//! Semantic analysis for the dendrite compiler.
//!
//! The digest transforms a parsed equation hierarchy into a decorated,
//! ordered, attributed form the code emitter can translate mechanically:
//! connection bindings resolve, specials are injected, every identifier
//! gains a [`dendrite_model::VariableReference`], parts and variables are
//! dependency-sorted, attributes and (for fixed-point targets) exponents
//! are inferred, and each part's
//! [`dendrite_model::analysis::BackendData`] is filled. The connection
//! planner classifies how each endpoint binding enumerates candidates.

pub mod attrs;
pub mod backend;
pub mod bindings;
pub mod cmatrix;
pub mod death;
pub mod error;
pub mod events;
pub mod exponent;
pub mod flatten;
pub mod order;
pub mod pipeline;
pub mod planner;
pub mod resolve;
pub mod simplify;
pub mod specials;

pub use error::{DigestError, DigestErrorKind, DigestResult};
pub use pipeline::{digest, Digest, Target};
pub use specials::CliParam;
