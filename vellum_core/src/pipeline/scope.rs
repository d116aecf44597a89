//! Lexically nested variable bindings for a pipeline run.

use crate::node::{AttributeBag, NodeId};
use crate::tree::Tree;
use std::collections::{BTreeMap, HashMap};

/// A value bound to a pipeline variable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Node(NodeId),
    Text(String),
}

impl Value {
    pub fn as_node(&self) -> Option<NodeId> {
        match self {
            Value::Node(id) => Some(*id),
            Value::Text(_) => None,
        }
    }

    /// String form used when the value is substituted into text.
    ///
    /// Resources render as their full path, other nodes as their `Name`
    /// or, failing that, their tag.
    pub fn render(&self, tree: &Tree) -> String {
        let id = match self {
            Value::Text(text) => return text.clone(),
            Value::Node(id) => *id,
        };
        let Some(node) = tree.get(id) else {
            return String::new();
        };
        if node.kind().is_resource() {
            if let Ok(path) = tree.full_path(id) {
                return path.display().to_string();
            }
        }
        node.name().unwrap_or(node.tag()).to_string()
    }
}

impl From<NodeId> for Value {
    fn from(id: NodeId) -> Self {
        Value::Node(id)
    }
}

impl From<&str> for Value {
    fn from(text: &str) -> Self {
        Value::Text(text.to_string())
    }
}

impl From<String> for Value {
    fn from(text: String) -> Self {
        Value::Text(text)
    }
}

/// Lexically nested variable bindings.
///
/// Lookups see every enclosing frame; bindings go into the innermost one
/// and disappear when it is popped.
#[derive(Debug)]
pub struct Scope {
    frames: Vec<HashMap<String, Value>>,
}

impl Scope {
    pub fn new() -> Self {
        Self {
            frames: vec![HashMap::new()],
        }
    }

    pub fn push(&mut self) {
        self.frames.push(HashMap::new());
    }

    /// Drop the innermost frame. The outermost frame is never dropped.
    pub fn pop(&mut self) {
        if self.frames.len() > 1 {
            self.frames.pop();
        }
    }

    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    pub fn bind(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        if let Some(frame) = self.frames.last_mut() {
            frame.insert(name.into(), value.into());
        }
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.frames.iter().rev().find_map(|frame| frame.get(name))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// All visible bindings, inner frames shadowing outer ones.
    pub fn flatten(&self) -> BTreeMap<String, Value> {
        let mut visible = BTreeMap::new();
        for frame in &self.frames {
            for (name, value) in frame {
                visible.insert(name.clone(), value.clone());
            }
        }
        visible
    }
}

impl Default for Scope {
    fn default() -> Self {
        Self::new()
    }
}
