//! The equation-set hierarchy.
//!
//! An [`EquationSet`] is one part in the model: a bag of named variables and
//! sub-parts. A part with connection bindings is a connection; otherwise it
//! is a compartment. Parts are created from the model tree, mutated only
//! during digest, then frozen for code emission.
//!
//! Container back-links are realized as index paths from the root rather
//! than owning pointers; navigation helpers on `EquationSet` take the root.

use std::collections::BTreeSet;
use std::fmt;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::analysis::BackendData;
use crate::error::{ModelError, Result};
use crate::expr::{Expr, ExprKind, VarType};
use crate::parser;
use crate::tree::Node;
use crate::units::{self, Unit};

/// Reduction operator combining multiple writes to one variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Assignment {
    #[default]
    Replace,
    Add,
    Multiply,
    Divide,
    Min,
    Max,
}

/// Attribute tags attached to variables during digest.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum Attribute {
    Constant,
    InitOnly,
    Temporary,
    Accessor,
    Preexistent,
    Global,
    ExternalRead,
    ExternalWrite,
    Cycle,
    MatrixPointer,
    Dummy,
    Param,
    Cli,
    Reference,
}

/// Identity of a variable within its part: base name plus derivative order.
#[derive(
    Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct VariableKey {
    pub name: String,
    pub order: usize,
}

impl VariableKey {
    pub fn new(name: impl Into<String>, order: usize) -> Self {
        Self {
            name: name.into(),
            order,
        }
    }

    /// Parse `V''` into name `V`, order 2.
    pub fn parse(text: &str) -> Self {
        let order = text.chars().rev().take_while(|c| *c == '\'').count();
        Self {
            name: text[..text.len() - order].to_string(),
            order,
        }
    }

    /// The key one derivative order below this one.
    pub fn integrated(&self) -> Option<VariableKey> {
        if self.order == 0 {
            None
        } else {
            Some(VariableKey::new(self.name.clone(), self.order - 1))
        }
    }
}

impl fmt::Display for VariableKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.name, "'".repeat(self.order))
    }
}

/// One step along a resolution path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResolveStep {
    /// Ascend to the container part.
    Up,
    /// Descend into the named sub-part.
    Down(String),
    /// Follow the named connection endpoint.
    Endpoint(String),
}

/// Resolved path from an expression's part to the variable it names.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VariableReference {
    pub steps: Vec<ResolveStep>,
    /// Absolute path (part names from root) of the part holding the target.
    pub target_part: Vec<String>,
    pub target: VariableKey,
}

impl VariableReference {
    /// A reference to a variable in the same part.
    pub fn local(part: Vec<String>, target: VariableKey) -> Self {
        Self {
            steps: Vec::new(),
            target_part: part,
            target,
        }
    }

    pub fn is_local(&self) -> bool {
        self.steps.is_empty()
    }
}

/// Endpoint binding of a connection part.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionBinding {
    pub alias: String,
    /// Absolute path of the endpoint part.
    pub endpoint: Vec<String>,
    /// Slot index within the connection instance.
    pub index: usize,
    /// Path used to enumerate endpoint instances.
    pub resolution: Vec<ResolveStep>,
}

/// One `condition -> expression` pair of a variable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EquationEntry {
    pub condition: Option<Expr>,
    pub expression: Expr,
}

impl EquationEntry {
    pub fn is_default(&self) -> bool {
        self.condition.is_none()
    }
}

/// A named quantity in a part.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Variable {
    pub name: String,
    pub order: usize,
    pub assignment: Assignment,
    pub equations: Vec<EquationEntry>,
    pub ty: VarType,
    pub unit: Option<Unit>,
    /// Key of the next-higher-order variable that drives this one.
    pub derivative: Option<VariableKey>,
    /// Resolved target when this variable aliases one in another part.
    pub reference: Option<VariableReference>,
    pub attributes: BTreeSet<Attribute>,
    /// Fixed-point exponent of the stored value.
    pub exponent: i32,
    /// Per-variable metadata subtree (`$metadata` child), if any.
    pub metadata: Option<Node>,
    /// Same-part variables this one reads. Filled during digest.
    pub depends_on: Vec<VariableKey>,
    /// Number of users (variables or parts) that read this one.
    pub user_count: usize,
}

impl Variable {
    pub fn new(key: VariableKey) -> Self {
        Self {
            name: key.name,
            order: key.order,
            assignment: Assignment::default(),
            equations: Vec::new(),
            ty: VarType::Scalar,
            unit: None,
            derivative: None,
            reference: None,
            attributes: BTreeSet::new(),
            exponent: crate::expr::UNKNOWN_EXPONENT,
            metadata: None,
            depends_on: Vec::new(),
            user_count: 0,
        }
    }

    pub fn key(&self) -> VariableKey {
        VariableKey::new(self.name.clone(), self.order)
    }

    pub fn has(&self, attribute: Attribute) -> bool {
        self.attributes.contains(&attribute)
    }

    pub fn add_attribute(&mut self, attribute: Attribute) {
        self.attributes.insert(attribute);
    }

    pub fn remove_attribute(&mut self, attribute: Attribute) {
        self.attributes.remove(&attribute);
    }

    /// The default (unconditional) equation, if present.
    pub fn default_equation(&self) -> Option<&EquationEntry> {
        self.equations.iter().find(|e| e.is_default())
    }

    /// True when the variable is a single unconditional constant.
    pub fn is_simple_constant(&self) -> bool {
        self.equations.len() == 1
            && self.equations[0].is_default()
            && self.equations[0].expression.is_constant()
    }

    /// Visit every expression of this variable (conditions included).
    pub fn visit_expressions(&self, f: &mut impl FnMut(&Expr) -> bool) {
        for e in &self.equations {
            if let Some(c) = &e.condition {
                c.visit(f);
            }
            e.expression.visit(f);
        }
    }

    /// `$name` variables receive special handling throughout.
    pub fn is_special(&self) -> bool {
        self.name.starts_with('$')
    }
}

/// Sparse matrix driving connection formation, detected during digest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionMatrix {
    /// File-name expression of the driving matrix.
    pub source: Expr,
    /// Binding index mapped from matrix rows.
    pub row_binding: usize,
    /// Binding index mapped from matrix columns.
    pub col_binding: usize,
    /// Expressions converting a matrix coordinate to an endpoint `$index`.
    pub row_map: Expr,
    pub col_map: Expr,
}

/// A node in the part hierarchy.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EquationSet {
    pub name: String,
    pub parts: Vec<EquationSet>,
    pub variables: IndexMap<VariableKey, Variable>,
    /// Non-empty exactly for connection parts.
    pub connection_bindings: Vec<ConnectionBinding>,
    pub connection_matrix: Option<ConnectionMatrix>,
    pub metadata: Node,
    /// Variables in evaluation order. Filled during digest.
    pub ordered: Vec<VariableKey>,
    /// Indices into `parts`, dependency-sorted. Filled during digest.
    pub ordered_parts: Vec<usize>,
    pub singleton: bool,
    pub lethal_p: bool,
    pub lethal_container: bool,
    pub lethal_connection: bool,
    /// `$type` split targets: each split lists absolute part paths.
    pub splits: Vec<Vec<Vec<String>>>,
    /// Component analysis output, created during emission planning.
    pub backend_data: Option<Box<BackendData>>,
}

impl EquationSet {
    /// Assemble a part hierarchy from a model tree node.
    ///
    /// Children whose key parses as a variable name and whose content looks
    /// like equations become variables; everything else becomes a sub-part.
    /// Connection bindings are not distinguished here; the digest converts
    /// variables whose lone equation is a bare part name.
    pub fn from_node(name: impl Into<String>, node: &Node) -> Result<EquationSet> {
        let name = name.into();
        trace!(part = %name, "building equation set");
        let mut set = EquationSet {
            name,
            ..EquationSet::default()
        };
        for child in node.children.values() {
            match child.key.as_str() {
                "$metadata" => {
                    set.metadata = child.clone();
                    continue;
                }
                "$inherit" | "$include" | "$reference" => continue,
                _ => {}
            }
            if is_variable_node(child) {
                let variable = parse_variable(child)?;
                set.variables.insert(variable.key(), variable);
            } else {
                let part = EquationSet::from_node(child.key.clone(), child)?;
                set.parts.push(part);
            }
        }
        Ok(set)
    }

    pub fn is_connection(&self) -> bool {
        !self.connection_bindings.is_empty()
    }

    pub fn find_variable(&self, key: &VariableKey) -> Option<&Variable> {
        self.variables.get(key)
    }

    pub fn find_variable_mut(&mut self, key: &VariableKey) -> Option<&mut Variable> {
        self.variables.get_mut(key)
    }

    pub fn find_part(&self, name: &str) -> Option<&EquationSet> {
        self.parts.iter().find(|p| p.name == name)
    }

    pub fn find_part_mut(&mut self, name: &str) -> Option<&mut EquationSet> {
        self.parts.iter_mut().find(|p| p.name == name)
    }

    /// Descend along an absolute path. The root itself is `&[]`.
    pub fn part_at(&self, path: &[String]) -> Option<&EquationSet> {
        let mut part = self;
        for name in path {
            part = part.find_part(name)?;
        }
        Some(part)
    }

    pub fn part_at_mut(&mut self, path: &[String]) -> Option<&mut EquationSet> {
        let mut part = self;
        for name in path {
            part = part.find_part_mut(name)?;
        }
        Some(part)
    }

    /// Depth-first walk over this part and all sub-parts with their paths.
    pub fn walk(&self, f: &mut impl FnMut(&[String], &EquationSet)) {
        fn go(
            part: &EquationSet,
            path: &mut Vec<String>,
            f: &mut impl FnMut(&[String], &EquationSet),
        ) {
            f(path, part);
            for child in &part.parts {
                path.push(child.name.clone());
                go(child, path, f);
                path.pop();
            }
        }
        go(self, &mut Vec::new(), f);
    }

    /// Collect the absolute paths of all parts, depth first.
    pub fn part_paths(&self) -> Vec<Vec<String>> {
        let mut out = Vec::new();
        self.walk(&mut |path, _| out.push(path.to_vec()));
        out
    }
}

/// Heuristic separating variables from sub-parts.
fn is_variable_node(node: &Node) -> bool {
    // A part key is a plain name; a variable key may carry derivative marks.
    // A node with a value is an equation. A node without a value is a
    // variable only when all its children are extra equations or metadata.
    if !node.value.is_empty() {
        return true;
    }
    if node.children.is_empty() {
        return true; // bare name, e.g. an output dummy; keep as variable
    }
    node.children
        .keys()
        .all(|k| k.starts_with('@') || k.starts_with('$'))
}

fn parse_variable(node: &Node) -> Result<Variable> {
    let key = VariableKey::parse(&node.key);
    let mut variable = Variable::new(key);
    if !node.value.is_empty() {
        parse_equation_text(&mut variable, &node.value, None)?;
    }
    for child in node.children.values() {
        if child.key == "$metadata" {
            variable.metadata = Some(child.clone());
        } else if let Some(condition) = child.key.strip_prefix('@') {
            let condition = if condition.is_empty() {
                None
            } else {
                Some(condition)
            };
            parse_equation_text(&mut variable, &child.value, condition)?;
        }
    }
    Ok(variable)
}

/// Parse one equation line: `[combiner][condition@]expression[;unit][?hint]`.
///
/// When `fixed_condition` is given (from an `@condition` child key), the
/// value holds only the expression side.
fn parse_equation_text(
    variable: &mut Variable,
    text: &str,
    fixed_condition: Option<&str>,
) -> Result<()> {
    let mut text = text.trim();

    for (prefix, assignment) in [
        ("+=", Assignment::Add),
        ("*=", Assignment::Multiply),
        ("/=", Assignment::Divide),
        ("<<=", Assignment::Min),
        (">>=", Assignment::Max),
    ] {
        if let Some(rest) = text.strip_prefix(prefix) {
            variable.assignment = assignment;
            text = rest.trim_start();
            break;
        }
    }

    // Suffixes strip back to front: hint, then unit.
    let text = match split_top_level(text, '?') {
        Some((body, _hint)) => body,
        None => text,
    };
    let (text, unit) = match split_top_level(text, ';') {
        Some((body, unit_text)) => (body, Some(units::parse(unit_text.trim())?)),
        None => (text, None),
    };
    if variable.unit.is_none() {
        variable.unit = unit;
    }

    let (condition_text, expression_text) = match fixed_condition {
        Some(c) => (Some(c), text),
        None => match split_top_level(text, '@') {
            Some((condition, expression)) => (Some(condition), expression),
            None => (None, text),
        },
    };

    let condition = match condition_text {
        Some(c) if !c.trim().is_empty() => Some(parser::parse_expression(c)?),
        _ => None,
    };
    let expression_text = expression_text.trim();
    if expression_text.is_empty() {
        return Err(ModelError::equation(
            variable.name.clone(),
            "empty expression",
        ));
    }
    let mut expression = parser::parse_expression(expression_text)?;
    if let Some(u) = unit {
        // Scale a literal with a unit suffix into SI base units.
        if let ExprKind::Constant(crate::expr::Value::Scalar(v)) = &expression.kind {
            expression = Expr::scalar(v * u.scale);
            expression.unit = Some(u);
        }
    }

    let entry = EquationEntry {
        condition,
        expression,
    };
    // At most one default equation; later defaults are ill-formed input.
    if entry.is_default() && variable.default_equation().is_some() {
        return Err(ModelError::equation(
            variable.name.clone(),
            "more than one default equation",
        ));
    }
    variable.equations.push(entry);
    Ok(())
}

/// Split `text` at the first occurrence of `target` that sits outside
/// brackets, parentheses, and string literals.
fn split_top_level(text: &str, target: char) -> Option<(&str, &str)> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut prev_escape = false;
    for (i, c) in text.char_indices() {
        if in_string {
            if c == '"' && !prev_escape {
                in_string = false;
            }
            prev_escape = c == '\\' && !prev_escape;
            continue;
        }
        match c {
            '"' => in_string = true,
            '(' | '[' => depth += 1,
            ')' | ']' => depth = depth.saturating_sub(1),
            c if c == target && depth == 0 => {
                return Some((&text[..i], &text[i + c.len_utf8()..]));
            }
            _ => {}
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::Value;

    fn build(text: &str) -> EquationSet {
        let doc = Node::from_text(text).unwrap();
        EquationSet::from_node("", &doc).unwrap()
    }

    #[test]
    fn simple_variable() {
        let set = build("x:1+2\n");
        let v = set.find_variable(&VariableKey::new("x", 0)).unwrap();
        assert_eq!(v.equations.len(), 1);
        assert_eq!(v.assignment, Assignment::Replace);
    }

    #[test]
    fn combiner_prefix() {
        let set = build("I:+=g*V\n");
        let v = set.find_variable(&VariableKey::new("I", 0)).unwrap();
        assert_eq!(v.assignment, Assignment::Add);
    }

    #[test]
    fn min_max_combiners() {
        let set = build("lo:<<=x\nhi:>>=x\n");
        assert_eq!(
            set.find_variable(&VariableKey::new("lo", 0)).unwrap().assignment,
            Assignment::Min
        );
        assert_eq!(
            set.find_variable(&VariableKey::new("hi", 0)).unwrap().assignment,
            Assignment::Max
        );
    }

    #[test]
    fn conditional_and_default() {
        let set = build("V:$init@0\n @V>1:V-1\n");
        let v = set.find_variable(&VariableKey::new("V", 0)).unwrap();
        assert_eq!(v.equations.len(), 2);
        assert!(v.equations[0].condition.is_some());
        assert!(v.equations[1].condition.is_some());
    }

    #[test]
    fn default_child_equation() {
        let set = build("V:$init@1\n @:V+1\n");
        let v = set.find_variable(&VariableKey::new("V", 0)).unwrap();
        assert!(v.default_equation().is_some());
    }

    #[test]
    fn unit_scales_literal() {
        let set = build("tau:10;ms\n");
        let v = set.find_variable(&VariableKey::new("tau", 0)).unwrap();
        let expr = &v.equations[0].expression;
        match expr.as_constant() {
            Some(Value::Scalar(s)) => assert!((s - 0.01).abs() < 1e-12),
            _ => panic!(),
        }
    }

    #[test]
    fn semicolon_in_matrix_is_not_unit() {
        let set = build("W:[1,2;3,4]\n");
        let v = set.find_variable(&VariableKey::new("W", 0)).unwrap();
        assert!(matches!(
            v.equations[0].expression.kind,
            ExprKind::MatrixLiteral { .. }
        ));
    }

    #[test]
    fn derivative_order_parsed() {
        let set = build("V':-V\n");
        let v = set.find_variable(&VariableKey::new("V", 1)).unwrap();
        assert_eq!(v.order, 1);
    }

    #[test]
    fn sub_parts_detected() {
        let set = build("layer:\n V:0\n n:10\n");
        assert_eq!(set.parts.len(), 1);
        assert_eq!(set.parts[0].name, "layer");
        assert_eq!(set.parts[0].variables.len(), 2);
    }

    #[test]
    fn part_paths_walk() {
        let set = build("a:\n x:1\n b:\n  y:2\n");
        let paths = set.part_paths();
        assert!(paths.contains(&vec!["a".to_string(), "b".to_string()]));
    }

    #[test]
    fn duplicate_default_rejected() {
        let doc = Node::from_text("x:1\n @:2\n").unwrap();
        assert!(EquationSet::from_node("", &doc).is_err());
    }

    #[test]
    fn hint_stripped() {
        let set = build("p:0.5?range 0..1\n");
        let v = set.find_variable(&VariableKey::new("p", 0)).unwrap();
        assert!(v.equations[0].expression.as_constant().is_some());
    }
}
