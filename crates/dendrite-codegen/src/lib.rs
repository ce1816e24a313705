//! Code emission.
//!
//! A digested model lowers to one Rust source file: for every part an
//! instance struct and a population struct implementing the
//! `dendrite-runtime` protocols, plus a wrapper root and a `main` that
//! parses `key=value` arguments. Emission is a single mechanical pass; all
//! semantic decisions were recorded in `BackendData` by the digest.

pub mod instance;
pub mod names;
pub mod population;
pub mod program;
pub mod render;

use dendrite_digest::{CliParam, Target};
use dendrite_model::eqset::EquationSet;
use thiserror::Error;
use tracing::info;

/// Emission failures (a digested tree should never produce one; they guard
/// against inconsistent input).
#[derive(Debug, Error)]
pub enum EmitError {
    #[error("part '{0}' has no backend data; digest must run first")]
    MissingBackendData(String),
}

/// Options for one emission run.
#[derive(Debug, Clone)]
pub struct Settings {
    pub target: Target,
    /// Crate name of the runtime library in the generated program.
    pub runtime_crate: String,
    /// Random seed baked into the generated `main`.
    pub seed: u64,
    /// Export `init`/`run`/`finish` and IOvector accessors instead of a
    /// standalone `main`.
    pub library: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            target: Target::Double,
            runtime_crate: "dendrite_runtime".to_string(),
            seed: 1,
            library: false,
        }
    }
}

/// Indented source writer.
#[derive(Default)]
pub struct Writer {
    out: String,
    indent: usize,
}

impl Writer {
    pub fn line(&mut self, text: impl AsRef<str>) {
        let text = text.as_ref();
        if text.is_empty() {
            self.out.push('\n');
            return;
        }
        for _ in 0..self.indent {
            self.out.push_str("    ");
        }
        self.out.push_str(text);
        self.out.push('\n');
    }

    /// Open a block: writes the line and indents until the matching close.
    pub fn open(&mut self, text: impl AsRef<str>) {
        self.line(text);
        self.indent += 1;
    }

    pub fn close(&mut self, text: impl AsRef<str>) {
        self.indent = self.indent.saturating_sub(1);
        self.line(text);
    }

    pub fn finish(self) -> String {
        self.out
    }
}

/// Emit the complete program for a digested model.
pub fn emit_program(
    model: &EquationSet,
    params: &[CliParam],
    settings: &Settings,
) -> Result<String, EmitError> {
    info!(target = ?settings.target, "emitting program");
    let mut w = Writer::default();
    program::emit_header(&mut w, settings);

    // Parts emit depth-first so referenced types exist before referencing
    // ones; order among siblings follows the digest's part sort.
    emit_parts(&mut w, model, model, &mut Vec::new(), settings)?;

    program::emit_wrapper(&mut w, model, settings)?;
    if settings.library {
        program::emit_library_abi(&mut w, model, params, settings);
    } else {
        program::emit_main(&mut w, model, params, settings);
    }
    Ok(w.finish())
}

fn emit_parts(
    w: &mut Writer,
    root: &EquationSet,
    part: &EquationSet,
    path: &mut Vec<String>,
    settings: &Settings,
) -> Result<(), EmitError> {
    let order: Vec<usize> = if part.ordered_parts.is_empty() {
        (0..part.parts.len()).collect()
    } else {
        part.ordered_parts.clone()
    };
    for index in order {
        let child = &part.parts[index];
        path.push(child.name.clone());
        emit_parts(w, root, child, path, settings)?;
        instance::emit_instance(w, root, child, path, settings)?;
        population::emit_population(w, root, child, path, settings)?;
        path.pop();
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use dendrite_digest::{digest, Target};
    use dendrite_model::Node;

    fn emit(text: &str) -> String {
        let doc = Node::from_text(text).unwrap();
        let mut model = dendrite_model::EquationSet::from_node("", &doc).unwrap();
        let digest = digest(&mut model, Target::Double).unwrap();
        emit_program(&model, &digest.params, &Settings::default()).unwrap()
    }

    #[test]
    fn decay_model_emits_instance_and_population() {
        let source = emit("cell:\n $n:3\n V:$init@1\n V':0-V\n");
        assert!(source.contains("struct CellInstance"));
        assert!(source.contains("struct CellPopulation"));
        assert!(source.contains("impl Instance<T> for CellInstance"));
        assert!(source.contains("impl Population<T> for CellPopulation"));
        assert!(source.contains("fn integrate"));
        assert!(source.contains("fn main()"));
    }

    #[test]
    fn combiner_reset_present() {
        let source = emit(
            "A:\n $n:2\n I:+=0\n V:I*2\nC:\n pre:A\n w:$init@1\n pre.I:+=w\n",
        );
        // The ADD combiner resets its buffer to zero during finalize.
        assert!(source.contains("next_I"));
        assert!(source.contains("fn finalize"));
    }

    #[test]
    fn singleton_elides_index() {
        let source = emit("one:\n V:$init@1\n V':0-V\n");
        assert!(source.contains("struct OneInstance"));
        // Singletons carry no population-index machinery.
        assert!(!source.contains("pub index: usize"));
    }

    #[test]
    fn event_edges_lower_to_their_truth_tables() {
        let source = emit(
            "cell:\n $n:2\n V:$init@0\n V':1\n \
             r:event(V>0.5,0.2,\"rise\")@1\n \
             f:event(V>0.5,0.2,\"fall\")@1\n \
             c:event(V>0.5,0.2,\"change\")@1\n",
        );
        assert!(source.contains("before == T::zero() && after != T::zero()"));
        assert!(source.contains("before != T::zero() && after == T::zero()"));
        assert!(source.contains("before != after"));
        assert!(source.contains("fn set_latch"));
        assert!(source.contains("schedule_spike"));
        // Edge detection always compares against a tracked previous value;
        // the stored variable has already committed by scan time.
        assert!(source.contains("self.eventaux0 = after;"));
        // A part in its own monitor list must not re-borrow itself while
        // finalize holds the mutable borrow.
        assert!(source.contains("same_instance(&me, &monitor)"));
        assert!(source.contains("if own { self.event_test(sim, 0) }"));
    }

    #[test]
    fn writer_indentation() {
        let mut w = Writer::default();
        w.open("fn f() {");
        w.line("let x = 1;");
        w.close("}");
        assert_eq!(w.finish(), "fn f() {\n    let x = 1;\n}\n");
    }
}
