//! Key/value model tree.
//!
//! A model document is a tree of named nodes. Each node carries a string key
//! and a string value; children express part composition, additional
//! equations, and metadata. Reserved keys begin with `$`.
//!
//! The on-disk form is line oriented: one node per line as `key:value`, with
//! nesting expressed by one leading space per level. The first line of a
//! document may carry a schema tag (`N2A.schema=3`), which is preserved on
//! round trip.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::error::{ModelError, Result};

/// Current schema version written by [`Node::to_text`].
pub const SCHEMA_LINE: &str = "N2A.schema=3";

/// One node in a model document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub key: String,
    pub value: String,
    pub children: IndexMap<String, Node>,
}

impl Node {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            children: IndexMap::new(),
        }
    }

    /// Child lookup by key.
    pub fn child(&self, key: &str) -> Option<&Node> {
        self.children.get(key)
    }

    /// Descend along a path of keys.
    pub fn child_path(&self, path: &[&str]) -> Option<&Node> {
        let mut node = self;
        for key in path {
            node = node.children.get(*key)?;
        }
        Some(node)
    }

    /// Insert or replace a child, returning a mutable reference to it.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Node {
        let key = key.into();
        let node = Node::new(key.clone(), value);
        self.children.insert(key.clone(), node);
        self.children.get_mut(&key).unwrap()
    }

    /// Value of a child, or empty string when absent.
    pub fn get(&self, key: &str) -> &str {
        self.child(key).map(|n| n.value.as_str()).unwrap_or("")
    }

    /// True when the child exists with a non-"0" value.
    ///
    /// Used for metadata flags such as `param`.
    pub fn flag(&self, path: &[&str]) -> bool {
        match self.child_path(path) {
            Some(n) => n.value != "0",
            None => false,
        }
    }

    /// Parse a document from its line-oriented text form.
    pub fn from_text(text: &str) -> Result<Node> {
        let mut root = Node::default();
        // Stack of (depth, path-into-root). Paths avoid holding &mut across pushes.
        let mut stack: Vec<(usize, Vec<String>)> = vec![(usize::MAX, Vec::new())];
        for (lineno, raw) in text.lines().enumerate() {
            if raw.trim().is_empty() {
                continue;
            }
            if lineno == 0 && raw.starts_with("N2A.schema") {
                continue;
            }
            let depth = raw.len() - raw.trim_start_matches(' ').len();
            let line = &raw[depth..];
            let (key, value) = match line.split_once(':') {
                Some((k, v)) => (k.to_string(), v.to_string()),
                None => (line.to_string(), String::new()),
            };
            if key.is_empty() {
                return Err(ModelError::Tree {
                    line: lineno + 1,
                    message: "empty key".into(),
                });
            }
            while stack.len() > 1 && depth <= stack.last().unwrap().0 {
                stack.pop();
            }
            let parent_path = stack.last().unwrap().1.clone();
            let parent = root
                .node_at_mut(&parent_path)
                .expect("stack paths stay valid");
            parent.set(key.clone(), value);
            let mut path = parent_path;
            path.push(key);
            stack.push((depth, path));
        }
        Ok(root)
    }

    /// Render the document, including the schema line.
    pub fn to_text(&self) -> String {
        let mut out = String::from(SCHEMA_LINE);
        out.push('\n');
        for child in self.children.values() {
            child.write_indented(&mut out, 0);
        }
        out
    }

    fn write_indented(&self, out: &mut String, depth: usize) {
        for _ in 0..depth {
            out.push(' ');
        }
        out.push_str(&self.key);
        out.push(':');
        out.push_str(&self.value);
        out.push('\n');
        for child in self.children.values() {
            child.write_indented(out, depth + 1);
        }
    }

    fn node_at_mut(&mut self, path: &[String]) -> Option<&mut Node> {
        let mut node = self;
        for key in path {
            node = node.children.get_mut(key)?;
        }
        Some(node)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_flat() {
        let doc = Node::from_text("a:1\nb:2\n").unwrap();
        assert_eq!(doc.get("a"), "1");
        assert_eq!(doc.get("b"), "2");
    }

    #[test]
    fn parse_nested() {
        let text = "layer:\n V:10\n spike:V>1\n  @V<=1:0\n";
        let doc = Node::from_text(text).unwrap();
        let layer = doc.child("layer").unwrap();
        assert_eq!(layer.get("V"), "10");
        let spike = layer.child("spike").unwrap();
        assert_eq!(spike.value, "V>1");
        assert_eq!(spike.get("@V<=1"), "0");
    }

    #[test]
    fn schema_line_skipped() {
        let doc = Node::from_text("N2A.schema=3\nx:1\n").unwrap();
        assert_eq!(doc.get("x"), "1");
    }

    #[test]
    fn round_trip() {
        let text = "a:1\n b:2\n  c:3\nd:\n";
        let doc = Node::from_text(text).unwrap();
        let rendered = doc.to_text();
        let reparsed = Node::from_text(&rendered).unwrap();
        assert_eq!(doc, reparsed);
    }

    #[test]
    fn dedent_returns_to_ancestor() {
        let text = "a:\n b:\n  c:1\n d:2\ne:3\n";
        let doc = Node::from_text(text).unwrap();
        assert_eq!(doc.child_path(&["a", "b", "c"]).unwrap().value, "1");
        assert_eq!(doc.child_path(&["a", "d"]).unwrap().value, "2");
        assert_eq!(doc.get("e"), "3");
    }

    #[test]
    fn flag_semantics() {
        let doc = Node::from_text("m:\n param:1\n off:0\n").unwrap();
        let m = doc.child("m").unwrap();
        assert!(m.flag(&["param"]));
        assert!(!m.flag(&["off"]));
        assert!(!m.flag(&["absent"]));
    }
}
