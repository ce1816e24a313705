//! Parse -> Digest -> Emit pipeline tests over realistic models.

use dendrite_codegen::{emit_program, Settings};
use dendrite_digest::{digest, DigestErrorKind, Target};
use dendrite_model::eqset::VariableKey;
use dendrite_model::{EquationSet, Node};

fn compile(text: &str, target: Target) -> (EquationSet, String) {
    let doc = Node::from_text(text).unwrap();
    let mut model = EquationSet::from_node("net", &doc).unwrap();
    let digest = digest(&mut model, target).expect("digest");
    let settings = Settings {
        target,
        ..Settings::default()
    };
    let source = emit_program(&model, &digest.params, &settings).expect("emit");
    (model, source)
}

/// Leaky integrate-and-fire network: two populations and a connection.
const LIF_NET: &str = "\
pre:
 $n:10
 V:$init@uniform()
 V':0-V/tau
 tau:0.02
 spike:V>thresh@1
  @:0
 thresh:0.8
post:
 $n:10
 V:$init@0
 V':(I-V)/tau
 tau:0.01
 I:+=0
syn:
 a:pre
 b:post
 $p:0.5
 a.$max:3
 w:$init@uniform()
 b.I:+=w*a.spike
";

#[test]
fn lif_network_compiles_end_to_end() {
    let (model, source) = compile(LIF_NET, Target::Double);

    let syn = model.find_part("syn").unwrap();
    assert!(syn.is_connection());
    assert_eq!(syn.connection_bindings.len(), 2);

    // Both class pairs for every part.
    for part in ["Pre", "Post", "Syn"] {
        assert!(source.contains(&format!("struct {part}Instance")), "{part}");
        assert!(source.contains(&format!("struct {part}Population")), "{part}");
    }
    // The connection writes through to post.I's buffer.
    assert!(source.contains("next_I"));
    assert!(source.contains("downcast_mut::<PostInstance>"));
    assert!(source.contains("next_I +="));
    // Connection formation builds an iterator chain with the $max cap.
    assert!(source.contains("level.max = 3;"));
    assert!(source.contains("fn get_iterators"));
    // Integration appears for both membrane potentials.
    assert!(source.contains("fn integrate"));
}

#[test]
fn emitted_main_parses_key_value_arguments() {
    let (_, source) = compile("tau:0.02\n $metadata:\n  param:1\nV:$init@tau\n", Target::Double);
    assert!(source.contains("fn main()"));
    assert!(source.contains("split_once('=')"));
    assert!(source.contains("-include"));
    assert!(source.contains("Exception:"));
}

#[test]
fn library_mode_exports_abi() {
    let doc = Node::from_text("layer:\n $n:4\n V:$init@1\n  $metadata:\n   backend:\n    rust:\n     vector:1\n V':0-V\n").unwrap();
    let mut model = EquationSet::from_node("net", &doc).unwrap();
    let digest = digest(&mut model, Target::Double).unwrap();
    let settings = Settings {
        library: true,
        ..Settings::default()
    };
    let source = emit_program(&model, &digest.params, &settings).unwrap();
    assert!(source.contains("pub fn init(args: &[String])"));
    assert!(source.contains("pub fn run(until: f64)"));
    assert!(source.contains("pub fn finish()"));
    assert!(source.contains("struct IOvector"));
    assert!(source.contains("pub fn get_Layer_V()"));
}

#[test]
fn fixed_point_emission_uses_shifts() {
    let model = "\
cell:
 $n:2
 V:$init@1
 V':0-V
";
    let (decorated, source) = compile(model, Target::Int);
    assert!(source.contains("type T = i32;"));
    assert!(source.contains("fixed::multiply"));

    let cell = decorated.find_part("cell").unwrap();
    let v = cell.find_variable(&VariableKey::new("V", 0)).unwrap();
    assert_ne!(v.exponent, dendrite_model::expr::UNKNOWN_EXPONENT);
}

#[test]
fn ambiguous_reference_fails_digest() {
    let doc = Node::from_text("layer:\n $n:5\n V:0\ntop:\n x:layer.V\n").unwrap();
    let mut model = EquationSet::from_node("net", &doc).unwrap();
    let errors = digest(&mut model, Target::Double).unwrap_err();
    assert!(errors
        .iter()
        .any(|e| e.kind == DigestErrorKind::AmbiguousReference));
}

#[test]
fn matrix_driven_connection_detected_and_emitted() {
    let text = "\
A:
 $n:4
 V:$init@1
 V':0-V
B:
 $n:4
 V:$init@0
 V':0-V
C:
 row:A
 col:B
 $p:matrix(\"weights.csv\")(row.$index,col.$index)
 w:$init@1
";
    let (model, source) = compile(text, Target::Double);
    let c = model.find_part("C").unwrap();
    assert!(c.connection_matrix.is_some());
    assert!(source.contains("ConnectMatrix::new"));
    assert!(source.contains("get_matrix_sparse"));
}

#[test]
fn splits_emit_transition_machinery() {
    let text = "\
larva:
 $n:5
 V:$init@0
 V':1
 $type:V>0.5@adult
adult:
 $n:0
 V:$init@1
 V':0-V
";
    let (model, source) = compile(text, Target::Double);
    assert_eq!(model.find_part("larva").unwrap().splits.len(), 1);
    assert!(source.contains("type_select"));
    assert!(source.contains("split_targets"));
}
