//! Operations callable from pipelines, keyed by module and function name.

use super::executor::Executor;
use super::scope::Value;
use crate::error::{Error, Result};
use crate::node::NodeId;
use crate::tree::Tree;
use std::collections::{BTreeMap, HashMap};
use std::fmt;

/// Nodes an operation changed and wants persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Changes {
    Nothing,
    Node(NodeId),
    Nodes(Vec<NodeId>),
}

impl Changes {
    pub fn into_vec(self) -> Vec<NodeId> {
        match self {
            Changes::Nothing => Vec::new(),
            Changes::Node(id) => vec![id],
            Changes::Nodes(ids) => ids,
        }
    }
}

/// Everything an operation is called with.
pub struct Invocation<'a> {
    pub tree: &'a mut Tree,
    /// Node the enclosing instruction is positioned at.
    pub position: NodeId,
    /// Visible variables overlaid with the call's own attributes.
    pub arguments: BTreeMap<String, Value>,
    /// The call's `Parameters` mapping.
    pub parameters: BTreeMap<String, Value>,
    /// Span to log under.
    pub span: tracing::Span,
    pub executor: &'a Executor,
}

impl Invocation<'_> {
    pub fn root(&self) -> NodeId {
        self.tree.root()
    }

    pub fn argument(&self, name: &str) -> Option<&Value> {
        self.arguments.get(name)
    }

    /// A node argument; text values are an error.
    pub fn node_argument(&self, name: &str) -> Result<Option<NodeId>> {
        match self.arguments.get(name) {
            None => Ok(None),
            Some(Value::Node(id)) => {
                self.tree.node(*id)?;
                Ok(Some(*id))
            }
            Some(Value::Text(text)) => Err(Error::failed(format!(
                "argument {name} must name a node, got {text:?}"
            ))),
        }
    }

    /// String form of a parameter.
    pub fn parameter(&self, name: &str) -> Option<String> {
        self.parameters.get(name).map(|v| v.render(self.tree))
    }

    pub fn require_parameter(&self, name: &str) -> Result<String> {
        self.parameter(name)
            .filter(|v| !v.is_empty())
            .ok_or_else(|| Error::failed(format!("missing parameter {name}")))
    }
}

type OperationFn = dyn Fn(&mut Invocation<'_>) -> Result<Changes> + Send + Sync;

/// Maps `(module, function)` to an operation.
#[derive(Default)]
pub struct OperationRegistry {
    operations: HashMap<(String, String), Box<OperationFn>>,
}

impl OperationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding the built-in `core` operations.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        crate::builtin::register(&mut registry);
        registry
    }

    pub fn register<F>(&mut self, module: &str, function: &str, operation: F) -> &mut Self
    where
        F: Fn(&mut Invocation<'_>) -> Result<Changes> + Send + Sync + 'static,
    {
        self.operations.insert(
            (module.to_string(), function.to_string()),
            Box::new(operation),
        );
        self
    }

    pub fn resolve(&self, module: &str, function: &str) -> Result<&OperationFn> {
        self.operations
            .get(&(module.to_string(), function.to_string()))
            .map(|op| op.as_ref())
            .ok_or_else(|| Error::UnknownOperation {
                module: module.to_string(),
                function: function.to_string(),
            })
    }

    pub fn contains(&self, module: &str, function: &str) -> bool {
        self.resolve(module, function).is_ok()
    }

    /// Registered operations as sorted `module.function` names.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .operations
            .keys()
            .map(|(module, function)| format!("{module}.{function}"))
            .collect();
        names.sort();
        names
    }
}

impl fmt::Debug for OperationRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OperationRegistry")
            .field("operations", &self.names())
            .finish()
    }
}
