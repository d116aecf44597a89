//! Executes pipeline descriptions against a metadata tree.
//!
//! The walk is a plain recursive descent over the instruction tree.
//! Failures fall into three groups:
//!
//! - local failures (`SelectFailed`, `RegexSearchFailed`, ...) end the
//!   body they occur in and are absorbed by the nearest `Iterate` or by
//!   the pipeline itself;
//! - operation failures are logged, the dirty documents are reloaded from
//!   disk and execution continues with the next instruction;
//! - everything else (unresolved variables, unknown operations, I/O
//!   errors during persistence) aborts the run.

use super::description::{Instruction, Pipeline};
use super::executor::Executor;
use super::registry::{Changes, Invocation, OperationRegistry};
use super::scope::{Scope, Value};
use super::substitute::{resolve_value, substitute};
use crate::error::{Error, Result};
use crate::journal::JournalEntry;
use crate::node::{AttributeBag, NodeId};
use crate::staleness::{Validity, clean_if_invalid};
use crate::tree::Tree;
use regex::Regex;
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::{debug, error, info, info_span, instrument, warn};

/// An operation failure that was recovered from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailureRecord {
    pub instruction: String,
    pub position: String,
    pub error: String,
}

/// Outcome of a pipeline run that did not abort.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunReport {
    pub calls_succeeded: usize,
    pub failures: Vec<FailureRecord>,
    /// Bodies ended early by a local failure.
    pub aborted_bodies: usize,
    /// Set when the pipeline's own body ended early.
    pub stopped: Option<String>,
}

/// Runs pipelines with a fixed set of operations.
#[derive(Debug)]
pub struct Interpreter {
    registry: OperationRegistry,
    executor: Executor,
    debug: bool,
}

impl Interpreter {
    pub fn new(registry: OperationRegistry, executor: Executor) -> Self {
        Self {
            registry,
            executor,
            debug: false,
        }
    }

    /// In debug mode operation failures abort the run instead of being
    /// rolled back.
    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    pub fn registry(&self) -> &OperationRegistry {
        &self.registry
    }

    /// Run `pipeline` from the tree root.
    ///
    /// `arguments` override the pipeline's declared argument defaults; all
    /// of them are visible as variables, as is `Volume` (the root).
    #[instrument(skip_all, fields(pipeline = %pipeline.name))]
    pub fn run(
        &self,
        tree: &mut Tree,
        pipeline: &Pipeline,
        arguments: &BTreeMap<String, String>,
    ) -> Result<RunReport> {
        let mut scope = Scope::new();
        let root = tree.root();
        scope.bind(tree.node(root)?.tag().to_string(), root);
        for declared_arg in &pipeline.arguments {
            if let Some(default) = &declared_arg.default {
                scope.bind(declared_arg.name.clone(), default.as_str());
            }
        }
        for (name, value) in arguments {
            scope.bind(name.clone(), value.as_str());
        }

        let mut run = Run {
            interpreter: self,
            tree,
            scope,
            report: RunReport::default(),
        };
        match run.execute_body(&pipeline.body, root) {
            Ok(()) => {}
            Err(e) if e.is_local() => {
                warn!(error = %e, "pipeline body stopped");
                run.report.aborted_bodies += 1;
                run.report.stopped = Some(e.to_string());
            }
            Err(e) => return Err(e),
        }

        let report = run.report;
        info!(
            calls = report.calls_succeeded,
            failures = report.failures.len(),
            aborted = report.aborted_bodies,
            "pipeline finished"
        );
        Ok(report)
    }
}

/// State of one pipeline run.
struct Run<'a> {
    interpreter: &'a Interpreter,
    tree: &'a mut Tree,
    scope: Scope,
    report: RunReport,
}

impl Run<'_> {
    fn execute_body(&mut self, body: &[Instruction], position: NodeId) -> Result<()> {
        for instruction in body {
            self.execute(instruction, position)?;
        }
        Ok(())
    }

    fn execute(&mut self, instruction: &Instruction, position: NodeId) -> Result<()> {
        match instruction {
            Instruction::Select {
                xpath,
                root,
                variable,
                clean_if_invalid: validate,
            } => self.select(xpath, root.as_deref(), variable, *validate, position),
            Instruction::Iterate {
                xpath,
                root,
                variable,
                body,
            } => self.iterate(xpath, root.as_deref(), variable.as_deref(), body, position),
            Instruction::RequireMatch {
                root,
                attribute,
                pattern,
            } => self.require_match(root.as_deref(), attribute, pattern, position),
            Instruction::Call {
                module,
                function,
                arguments,
                parameters,
            } => self.call(instruction, module, function, arguments, parameters, position),
        }
    }

    /// The node a search starts from: the variable named by `root`, or the
    /// current position.
    fn search_root(&self, root: Option<&str>, position: NodeId) -> Result<NodeId> {
        let Some(root) = root else {
            return Ok(position);
        };
        let name = root.strip_prefix('#').unwrap_or(root);
        match self.scope.get(name) {
            Some(Value::Node(id)) => {
                self.tree.node(*id)?;
                Ok(*id)
            }
            Some(Value::Text(text)) => Err(Error::invalid_pipeline(format!(
                "Root {name} is bound to {text:?}, not a node"
            ))),
            None => Err(Error::UnresolvedVariable {
                name: name.to_string(),
                text: root.to_string(),
            }),
        }
    }

    fn select(
        &mut self,
        xpath: &str,
        root: Option<&str>,
        variable: &str,
        validate: bool,
        position: NodeId,
    ) -> Result<()> {
        let query = substitute(xpath, &self.scope, self.tree)?;
        let from = self.search_root(root, position)?;

        let found = loop {
            let Some(candidate) = self.tree.find(from, &query)? else {
                break None;
            };
            if !validate {
                break Some(candidate);
            }
            let parent = self.tree.parent(candidate);
            match clean_if_invalid(self.tree, candidate)? {
                Validity::Removed => {
                    // The removal must reach disk before the next search.
                    if let Some(parent) = parent {
                        self.tree.save(parent, false)?;
                    }
                }
                validity => break validity.node(),
            }
        };

        let node = found.ok_or(Error::SelectFailed { query })?;
        debug!(variable, node = %self.tree.describe(node), "selected");
        self.scope.bind(variable, node);
        Ok(())
    }

    fn iterate(
        &mut self,
        xpath: &str,
        root: Option<&str>,
        variable: Option<&str>,
        body: &[Instruction],
        position: NodeId,
    ) -> Result<()> {
        let query = substitute(xpath, &self.scope, self.tree)?;
        let from = self.search_root(root, position)?;
        let mut matches = self.tree.find_all(from, &query)?;

        let mut succeeded = 0;
        while let Some(item) = matches.next(self.tree)? {
            self.scope.push();
            if let Some(variable) = variable {
                self.scope.bind(variable, item);
            }
            let outcome = self.execute_body(body, item);
            self.scope.pop();

            match outcome {
                Ok(()) => succeeded += 1,
                Err(e) if e.is_local() => {
                    debug!(item = %self.tree.describe(item), error = %e, "iteration skipped");
                    self.report.aborted_bodies += 1;
                }
                Err(e) => return Err(e),
            }
        }

        if succeeded == 0 {
            return Err(Error::SearchFailed { query });
        }
        Ok(())
    }

    fn require_match(
        &mut self,
        root: Option<&str>,
        attribute: &str,
        pattern: &str,
        position: NodeId,
    ) -> Result<()> {
        let pattern = substitute(pattern, &self.scope, self.tree)?;
        if pattern == "*" {
            return Ok(());
        }

        let node = self.tree.node(self.search_root(root, position)?)?;
        let value = node
            .attribute(attribute)
            .ok_or_else(|| Error::RequireMatchFailed {
                attribute: attribute.to_string(),
                tag: node.tag().to_string(),
            })?;

        if Regex::new(&pattern)?.is_match(value) {
            Ok(())
        } else {
            Err(Error::RegexSearchFailed {
                pattern,
                value: value.to_string(),
            })
        }
    }

    fn call(
        &mut self,
        instruction: &Instruction,
        module: &str,
        function: &str,
        call_arguments: &[(String, String)],
        call_parameters: &[(String, String)],
        position: NodeId,
    ) -> Result<()> {
        let interpreter = self.interpreter;
        let operation = interpreter.registry.resolve(module, function)?;

        let mut arguments = self.scope.flatten();
        for (name, text) in call_arguments {
            arguments.insert(name.clone(), resolve_value(text, &self.scope, self.tree)?);
        }
        let mut parameters = BTreeMap::new();
        for (name, text) in call_parameters {
            parameters.insert(name.clone(), resolve_value(text, &self.scope, self.tree)?);
        }

        let where_ = self.tree.describe(position);
        let span = info_span!("call", module, function, position = %where_);
        let outcome = {
            let mut invocation = Invocation {
                tree: &mut *self.tree,
                position,
                arguments,
                parameters,
                span: span.clone(),
                executor: &interpreter.executor,
            };
            span.in_scope(|| operation(&mut invocation))
        };

        match outcome.and_then(|changes| self.persist(changes)) {
            Ok(()) => {
                self.report.calls_succeeded += 1;
                self.journal("ok", position, format!("{module}.{function}"));
                Ok(())
            }
            Err(source) => {
                let e = Error::operation(module, function, source);
                error!(%instruction, position = %where_, error = %e, "operation failed");
                self.journal("failed", position, e.to_string());
                if interpreter.debug {
                    return Err(e);
                }
                self.report.failures.push(FailureRecord {
                    instruction: instruction.to_string(),
                    position: where_,
                    error: e.to_string(),
                });
                let reloaded = self.tree.reload_dirty()?;
                debug!(reloaded, "discarded unsaved changes");
                Ok(())
            }
        }
    }

    /// Save the highest of the changed nodes that are still attached.
    fn persist(&mut self, changes: Changes) -> Result<()> {
        let changed: Vec<NodeId> = changes
            .into_vec()
            .into_iter()
            .filter(|id| self.tree.contains(*id))
            .collect();
        let highest: Vec<NodeId> = changed
            .iter()
            .copied()
            .filter(|id| {
                !changed
                    .iter()
                    .any(|other| other != id && self.tree.is_ancestor(*other, *id))
            })
            .collect();

        for id in highest {
            self.tree.save(id, true)?;
            // A new linked container also changes the document that links it.
            if let Some(parent) = self.tree.parent(id) {
                let owner = self.tree.document_owner(parent)?;
                if self.tree.has_unsaved_changes(owner)? {
                    self.tree.save(owner, false)?;
                }
            }
        }
        Ok(())
    }

    fn journal(&self, status: &str, position: NodeId, detail: String) {
        if let Some(journal) = self.tree.journal() {
            let path = self
                .tree
                .full_path(position)
                .map(|p| p.display().to_string())
                .unwrap_or_default();
            journal.record(JournalEntry::now("call", status, path, detail));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::DOCUMENT_FILE;
    use crate::node::{KindRegistry, ResourceAttributes};
    use crate::pipeline::description::PipelineSet;
    use std::fs;
    use std::sync::{Arc, Mutex};
    use tempfile::TempDir;

    fn pipeline(body: &str) -> Pipeline {
        let json = format!(
            r#"{{"tag":"Pipelines","children":[{{"tag":"Pipeline","attributes":{{"Name":"Test"}},"children":{body}}}]}}"#
        );
        PipelineSet::from_json(&json)
            .unwrap()
            .select(None)
            .unwrap()
            .clone()
    }

    fn interpreter(registry: OperationRegistry) -> Interpreter {
        Interpreter::new(registry, Executor::new(1))
    }

    fn tree_with_items(dir: &std::path::Path, tag: &str, names: &[&str]) -> Tree {
        let mut tree = Tree::new(dir, "Volume");
        let root = tree.root();
        for name in names {
            let item = tree.create_element(tag);
            tree.set_attribute(item, "Name", *name).unwrap();
            tree.append_child(root, item).unwrap();
        }
        tree.save(root, true).unwrap();
        tree
    }

    #[test]
    fn test_failed_iteration_is_rolled_back_and_siblings_continue() {
        let temp_dir = TempDir::new().unwrap();
        let mut tree = tree_with_items(temp_dir.path(), "Transform", &["a", "b", "c"]);

        let mut registry = OperationRegistry::new();
        registry.register("test", "mark", |inv| {
            inv.tree.set_attribute(inv.position, "Processed", true)?;
            if inv.tree.node(inv.position)?.name() == Some("b") {
                return Err(Error::failed("cannot process b"));
            }
            Ok(Changes::Node(inv.position))
        });

        let body = r#"[{"tag":"Iterate","attributes":{"XPath":"Transform","VariableName":"Item"},"children":[
            {"tag":"PythonCall","attributes":{"Module":"test","Function":"mark"}}
        ]}]"#;
        let report = interpreter(registry)
            .run(&mut tree, &pipeline(body), &BTreeMap::new())
            .unwrap();

        assert_eq!(report.calls_succeeded, 2);
        assert_eq!(report.failures.len(), 1);
        assert!(report.failures[0].error.contains("cannot process b"));
        assert_eq!(report.stopped, None);

        let mut reopened = Tree::open(temp_dir.path(), KindRegistry::default()).unwrap();
        let root = reopened.root();
        let processed: Vec<Option<String>> = reopened
            .find_all(root, "Transform")
            .unwrap()
            .collect(&mut reopened)
            .unwrap()
            .into_iter()
            .map(|id| reopened[id].attribute("Processed").map(str::to_string))
            .collect();
        assert_eq!(
            processed,
            vec![Some("true".to_string()), None, Some("true".to_string())]
        );
    }

    #[test]
    fn test_attributes_set_on_linked_container_reach_its_placeholder() {
        let temp_dir = TempDir::new().unwrap();
        let mut tree = Tree::new(temp_dir.path(), "Volume");
        let root = tree.root();
        let section = tree.create_container("Section", "0001", true);
        tree.append_child(root, section).unwrap();
        tree.save(root, true).unwrap();

        let body = r#"[{"tag":"Iterate","attributes":{"XPath":"Section"},"children":[
            {"tag":"Call","attributes":{"Module":"core","Function":"set_attributes"},"children":[
                {"tag":"Parameters","attributes":{"Status":"done"}}
            ]}
        ]}]"#;
        let report = interpreter(OperationRegistry::with_builtins())
            .run(&mut tree, &pipeline(body), &BTreeMap::new())
            .unwrap();
        assert_eq!(report.calls_succeeded, 1);
        assert!(!tree.has_unsaved_changes(root).unwrap());

        let mut reopened = Tree::open(temp_dir.path(), KindRegistry::default()).unwrap();
        let reopened_root = reopened.root();
        assert!(
            reopened
                .find(reopened_root, "Section[@Status='done']")
                .unwrap()
                .is_some()
        );
    }

    #[test]
    fn test_require_match_skips_non_matching_items() {
        let temp_dir = TempDir::new().unwrap();
        let mut tree = tree_with_items(temp_dir.path(), "Item", &["Leveled16", "Raw8", "Leveled8"]);

        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut registry = OperationRegistry::new();
        let sink = Arc::clone(&seen);
        registry.register("test", "record", move |inv| {
            let name = inv.tree.node(inv.position)?.name().unwrap_or("").to_string();
            sink.lock().unwrap().push(name);
            Ok(Changes::Nothing)
        });

        let body = r#"[{"tag":"Iterate","attributes":{"XPath":"Item"},"children":[
            {"tag":"RequireMatch","attributes":{"Attribute":"Name","Pattern":"Leveled.*"}},
            {"tag":"Call","attributes":{"Module":"test","Function":"record"}}
        ]}]"#;
        let report = interpreter(registry)
            .run(&mut tree, &pipeline(body), &BTreeMap::new())
            .unwrap();

        assert_eq!(*seen.lock().unwrap(), vec!["Leveled16", "Leveled8"]);
        assert_eq!(report.aborted_bodies, 1);
        assert!(report.failures.is_empty());
        assert_eq!(report.stopped, None);
    }

    #[test]
    fn test_iteration_bindings_do_not_leak() {
        let temp_dir = TempDir::new().unwrap();
        let mut tree = tree_with_items(temp_dir.path(), "Item", &["one", "two"]);
        let root = tree.root();
        for item in tree.children(root).unwrap().to_vec() {
            let child = tree.create_element("Histogram");
            tree.append_child(item, child).unwrap();
        }

        let visible = Arc::new(Mutex::new(Vec::new()));
        let mut registry = OperationRegistry::new();
        let sink = Arc::clone(&visible);
        registry.register("test", "observe", move |inv| {
            sink.lock().unwrap().push(inv.argument("Inner").is_some());
            Ok(Changes::Nothing)
        });

        let body = r##"[
            {"tag":"Iterate","attributes":{"XPath":"Item","VariableName":"Item"},"children":[
                {"tag":"Call","attributes":{"Module":"test","Function":"observe"}},
                {"tag":"Select","attributes":{"XPath":"Histogram","VariableName":"Inner","CleanIfInvalid":"false"}}
            ]},
            {"tag":"Call","attributes":{"Module":"test","Function":"observe","Target":"#Item"}}
        ]"##;
        let err = interpreter(registry)
            .run(&mut tree, &pipeline(body), &BTreeMap::new())
            .unwrap_err();

        assert_eq!(*visible.lock().unwrap(), vec![false, false]);
        assert!(matches!(err, Error::UnresolvedVariable { ref name, .. } if name == "Item"));
    }

    #[test]
    fn test_select_retries_past_stale_candidates() {
        let temp_dir = TempDir::new().unwrap();
        let mut tree = Tree::new(temp_dir.path(), "Volume");
        let root = tree.root();
        for path in ["missing.png", "present.png"] {
            let image = tree.create_resource("Image", path);
            tree.append_child(root, image).unwrap();
        }
        tree.save(root, true).unwrap();
        fs::write(temp_dir.path().join("present.png"), b"pixels").unwrap();

        let selected = Arc::new(Mutex::new(None));
        let mut registry = OperationRegistry::new();
        let sink = Arc::clone(&selected);
        registry.register("test", "capture", move |inv| {
            let image = inv.node_argument("Image")?.ok_or_else(|| Error::failed("unbound"))?;
            *sink.lock().unwrap() = inv.tree.node(image)?.path().map(str::to_string);
            Ok(Changes::Nothing)
        });

        let body = r#"[
            {"tag":"Select","attributes":{"XPath":"Image","VariableName":"Image"}},
            {"tag":"Call","attributes":{"Module":"test","Function":"capture"}}
        ]"#;
        let report = interpreter(registry)
            .run(&mut tree, &pipeline(body), &BTreeMap::new())
            .unwrap();

        assert_eq!(report.calls_succeeded, 1);
        assert_eq!(selected.lock().unwrap().as_deref(), Some("present.png"));
        let saved = fs::read_to_string(temp_dir.path().join(DOCUMENT_FILE)).unwrap();
        assert!(!saved.contains("missing.png"));
    }

    #[test]
    fn test_top_level_select_failure_stops_the_body() {
        let mut tree = Tree::new("/nonexistent/volume", "Volume");
        let calls = Arc::new(Mutex::new(0));
        let mut registry = OperationRegistry::new();
        let counter = Arc::clone(&calls);
        registry.register("test", "count", move |_| {
            *counter.lock().unwrap() += 1;
            Ok(Changes::Nothing)
        });

        let body = r#"[
            {"tag":"Select","attributes":{"XPath":"Section","VariableName":"Section"}},
            {"tag":"Call","attributes":{"Module":"test","Function":"count"}}
        ]"#;
        let report = interpreter(registry)
            .run(&mut tree, &pipeline(body), &BTreeMap::new())
            .unwrap();

        assert_eq!(*calls.lock().unwrap(), 0);
        assert_eq!(report.aborted_bodies, 1);
        assert!(report.stopped.unwrap().contains("Section"));
    }

    #[test]
    fn test_unknown_operation_is_fatal() {
        let mut tree = Tree::new("/nonexistent/volume", "Volume");
        let body = r#"[{"tag":"Call","attributes":{"Module":"nope","Function":"missing"}}]"#;
        let err = interpreter(OperationRegistry::new())
            .run(&mut tree, &pipeline(body), &BTreeMap::new())
            .unwrap_err();
        assert!(err.is_configuration());
    }

    #[test]
    fn test_debug_mode_propagates_operation_errors() {
        let mut tree = Tree::new("/nonexistent/volume", "Volume");
        let mut registry = OperationRegistry::new();
        registry.register("test", "fail", |_| Err(Error::failed("boom")));

        let body = r#"[{"tag":"Call","attributes":{"Module":"test","Function":"fail"}}]"#;
        let err = interpreter(registry)
            .with_debug(true)
            .run(&mut tree, &pipeline(body), &BTreeMap::new())
            .unwrap_err();
        assert!(matches!(err, Error::Operation { ref function, .. } if function == "fail"));
    }

    #[test]
    fn test_arguments_override_defaults() {
        let mut tree = Tree::new("/nonexistent/volume", "Volume");
        let labels = Arc::new(Mutex::new(Vec::new()));
        let mut registry = OperationRegistry::new();
        let sink = Arc::clone(&labels);
        registry.register("test", "label", move |inv| {
            assert_eq!(inv.argument("Volume"), Some(&Value::Node(inv.root())));
            sink.lock().unwrap().push(inv.require_parameter("Label")?);
            Ok(Changes::Nothing)
        });

        let body = r##"[
            {"tag":"Arguments","children":[{"tag":"Argument","attributes":{"Name":"Filter","Default":"Leveled"}}]},
            {"tag":"Call","attributes":{"Module":"test","Function":"label"},"children":[
                {"tag":"Parameters","attributes":{"Label":"#Filter-x"}}
            ]}
        ]"##;
        let pipeline = pipeline(body);
        let interpreter = interpreter(registry);

        interpreter.run(&mut tree, &pipeline, &BTreeMap::new()).unwrap();
        let overrides = BTreeMap::from([("Filter".to_string(), "Raw8".to_string())]);
        interpreter.run(&mut tree, &pipeline, &overrides).unwrap();

        assert_eq!(
            *labels.lock().unwrap(),
            vec!["Leveled-x".to_string(), "Raw8-x".to_string()]
        );
    }
}
