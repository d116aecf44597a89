//! The metadata tree: an arena of nodes with parent back-references.
//!
//! Nodes are owned by the tree and addressed through [`NodeId`] handles. A
//! node lists its children by handle and records its parent as a plain
//! handle, which is a relation only: removing a node frees its whole
//! subtree regardless of who still holds a handle to it.

use crate::attribute::{FloatFamily, ToAttribute};
use crate::error::{Error, Result};
use crate::journal::{Journal, JournalEntry};
use crate::node::{KindRegistry, Node, NodeId, NodeKind, ResourceAttributes, names};
use std::fs;
use std::ops::Index;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Outcome of [`Tree::clean`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanOutcome {
    /// The node was detached and its backing paths deleted.
    Removed,
    /// Nothing was touched because `locked` (the node or a descendant) is locked.
    Refused { locked: NodeId },
}

/// A metadata tree rooted at a volume directory.
#[derive(Debug)]
pub struct Tree {
    nodes: Vec<Option<Node>>,
    root: NodeId,
    base_dir: PathBuf,
    registry: KindRegistry,
    journal: Option<Journal>,
}

impl Tree {
    /// Create an empty tree whose root container lives at `base_dir`.
    pub fn new(base_dir: impl Into<PathBuf>, root_tag: &str) -> Self {
        Self::from_root(
            base_dir.into(),
            KindRegistry::default(),
            Node::new(root_tag, NodeKind::Container { linked: false }),
        )
    }

    pub(crate) fn from_root(base_dir: PathBuf, registry: KindRegistry, root: Node) -> Self {
        Self {
            nodes: vec![Some(root)],
            root: NodeId(0),
            base_dir,
            registry,
            journal: None,
        }
    }

    /// Use `registry` to decide node kinds for documents loaded from now on.
    pub fn with_registry(mut self, registry: KindRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Record cleanups and pipeline calls in `journal`.
    pub fn set_journal(&mut self, journal: Journal) {
        self.journal = Some(journal);
    }

    pub fn journal(&self) -> Option<&Journal> {
        self.journal.as_ref()
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    /// Directory of the root document.
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn registry(&self) -> &KindRegistry {
        &self.registry
    }

    /// Whether `id` still refers to a live node.
    pub fn contains(&self, id: NodeId) -> bool {
        self.get(id).is_some()
    }

    pub fn get(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(id.0).and_then(|slot| slot.as_ref())
    }

    /// Get a live node or a [`Error::StaleNode`] error.
    pub fn node(&self, id: NodeId) -> Result<&Node> {
        self.get(id)
            .ok_or_else(|| Error::stale_node(format!("node {} no longer exists", id.0)))
    }

    pub(crate) fn node_mut(&mut self, id: NodeId) -> Result<&mut Node> {
        self.nodes
            .get_mut(id.0)
            .and_then(|slot| slot.as_mut())
            .ok_or_else(|| Error::stale_node(format!("node {} no longer exists", id.0)))
    }

    pub(crate) fn insert(&mut self, node: Node) -> NodeId {
        self.nodes.push(Some(node));
        NodeId(self.nodes.len() - 1)
    }

    /// Create a detached node of the given kind.
    pub fn create_node(&mut self, tag: &str, kind: NodeKind) -> NodeId {
        self.insert(Node::new(tag, kind))
    }

    pub fn create_element(&mut self, tag: &str) -> NodeId {
        self.create_node(tag, NodeKind::Element)
    }

    /// Create a detached resource backed by `path` relative to its future parent.
    pub fn create_resource(&mut self, tag: &str, path: &str) -> NodeId {
        let mut node = Node::new(tag, NodeKind::Resource);
        node.set_attribute(names::PATH, path.to_string());
        self.insert(node)
    }

    /// Create a detached container; `linked` containers persist as their own document.
    pub fn create_container(&mut self, tag: &str, path: &str, linked: bool) -> NodeId {
        let mut node = Node::new(tag, NodeKind::Container { linked });
        node.set_attribute(names::PATH, path.to_string());
        self.insert(node)
    }

    pub fn parent(&self, id: NodeId) -> Option<NodeId> {
        self.get(id).and_then(|node| node.parent)
    }

    pub fn children(&self, id: NodeId) -> Result<&[NodeId]> {
        Ok(self.node(id)?.children())
    }

    /// Iterate over the ancestors of `id`, nearest first.
    pub fn ancestors(&self, id: NodeId) -> impl Iterator<Item = NodeId> + '_ {
        std::iter::successors(self.parent(id), move |current| self.parent(*current))
    }

    /// Whether `ancestor` is a strict ancestor of `id`.
    pub fn is_ancestor(&self, ancestor: NodeId, id: NodeId) -> bool {
        self.ancestors(id).any(|a| a == ancestor)
    }

    /// Append `child` as the last child of `parent`.
    pub fn append_child(&mut self, parent: NodeId, child: NodeId) -> Result<()> {
        self.check_attachable(parent, child)?;
        self.node_mut(parent)?.children.push(child);
        self.attach(parent, child)
    }

    fn check_attachable(&self, parent: NodeId, child: NodeId) -> Result<()> {
        let parent_node = self.node(parent)?;
        let child_node = self.node(child)?;
        if parent == child || self.is_ancestor(child, parent) {
            return Err(Error::invariant(format!(
                "{} cannot become a descendant of itself",
                child_node.tag()
            )));
        }
        if child == self.root {
            return Err(Error::invariant("the root node cannot be re-parented"));
        }
        if child_node.parent.is_some() {
            return Err(Error::invariant(format!(
                "{} already has a parent; remove it before appending it to {}",
                child_node.tag(),
                parent_node.tag()
            )));
        }
        Ok(())
    }

    fn attach(&mut self, parent: NodeId, child: NodeId) -> Result<()> {
        self.node_mut(parent)?.children_changed = true;
        self.node_mut(child)?.parent = Some(parent);
        self.invalidate_full_paths(child);
        Ok(())
    }

    /// Detach `child` from `parent`. The child stays alive until discarded.
    pub fn remove_child(&mut self, parent: NodeId, child: NodeId) -> Result<()> {
        let parent_node = self.node_mut(parent)?;
        let Some(index) = parent_node.children.iter().position(|c| *c == child) else {
            return Err(Error::invariant(format!(
                "node {} is not a child of {}",
                child.0,
                parent_node.tag()
            )));
        };
        parent_node.children.remove(index);
        parent_node.children_changed = true;
        self.node_mut(child)?.parent = None;
        self.invalidate_full_paths(child);
        Ok(())
    }

    /// Put `new` in `old`'s place among `parent`'s children and free `old`.
    pub(crate) fn replace_child(&mut self, parent: NodeId, old: NodeId, new: NodeId) -> Result<()> {
        let parent_node = self.node_mut(parent)?;
        let Some(index) = parent_node.children.iter().position(|c| *c == old) else {
            return Err(Error::invariant(format!(
                "node {} is not a child of {}",
                old.0,
                parent_node.tag()
            )));
        };
        parent_node.children[index] = new;
        parent_node.children_changed = true;
        self.node_mut(new)?.parent = Some(parent);
        self.invalidate_full_paths(new);
        self.free_subtree(old);
        Ok(())
    }

    /// Free a detached node and its descendants.
    pub fn discard(&mut self, id: NodeId) -> Result<()> {
        if self.node(id)?.parent.is_some() || id == self.root {
            return Err(Error::invariant("only detached nodes can be discarded"));
        }
        self.free_subtree(id);
        Ok(())
    }

    pub(crate) fn free_subtree(&mut self, id: NodeId) {
        let Some(node) = self.nodes.get_mut(id.0).and_then(Option::take) else {
            return;
        };
        for child in node.children {
            self.free_subtree(child);
        }
    }

    /// Set an attribute from any typed value. Returns whether the value changed.
    pub fn set_attribute(
        &mut self,
        id: NodeId,
        name: &str,
        value: impl ToAttribute,
    ) -> Result<bool> {
        let changed = self.node_mut(id)?.set_attribute(name, value.to_attribute());
        if changed {
            self.attributes_touched(id, name)?;
        }
        Ok(changed)
    }

    /// Set a float attribute at the precision of its family.
    pub fn set_float(
        &mut self,
        id: NodeId,
        name: &str,
        value: f64,
        family: FloatFamily,
    ) -> Result<bool> {
        self.set_attribute(id, name, family.format(value))
    }

    pub fn delete_attribute(&mut self, id: NodeId, name: &str) -> Result<Option<String>> {
        let removed = self.node_mut(id)?.delete_attribute(name);
        if removed.is_some() {
            self.attributes_touched(id, name)?;
        }
        Ok(removed)
    }

    /// A linked container's attributes are replicated in the placeholder
    /// its parent's document holds, so that document is dirty as well.
    fn attributes_touched(&mut self, id: NodeId, name: &str) -> Result<()> {
        if name == names::PATH {
            self.invalidate_full_paths(id);
        }
        let node = self.node(id)?;
        if node.kind().is_linked_container() {
            if let Some(parent) = node.parent() {
                self.node_mut(parent)?.children_changed = true;
            }
        }
        Ok(())
    }

    pub fn set_text(&mut self, id: NodeId, text: Option<String>) -> Result<()> {
        self.node_mut(id)?.set_text(text);
        Ok(())
    }

    pub fn set_locked(&mut self, id: NodeId, locked: bool) -> Result<bool> {
        self.set_attribute(id, names::LOCKED, locked)
    }

    /// Absolute path of a node: its `Path` joined onto its nearest
    /// resource ancestor's full path. Non-resource nodes share their
    /// parent's full path; the root's is the volume directory.
    pub fn full_path(&self, id: NodeId) -> Result<PathBuf> {
        let node = self.node(id)?;
        if let Some(cached) = node.full_path.borrow().as_ref() {
            return Ok(cached.clone());
        }

        let path = if id == self.root {
            self.base_dir.clone()
        } else {
            let parent = node.parent.ok_or_else(|| {
                Error::invariant(format!("{} is detached and has no full path", node.tag()))
            })?;
            let base = self.full_path(parent)?;
            match node.path() {
                Some(segment) if node.kind().is_resource() && !segment.is_empty() => {
                    base.join(segment)
                }
                _ => base,
            }
        };

        *node.full_path.borrow_mut() = Some(path.clone());
        Ok(path)
    }

    pub(crate) fn invalidate_full_paths(&self, id: NodeId) {
        let Some(node) = self.get(id) else {
            return;
        };
        node.full_path.borrow_mut().take();
        for child in &node.children {
            self.invalidate_full_paths(*child);
        }
    }

    /// Whether `id` is persisted as the root of its own document.
    pub fn is_document_owner(&self, id: NodeId) -> bool {
        id == self.root
            || self
                .get(id)
                .is_some_and(|node| node.kind().is_linked_container())
    }

    /// The node whose document holds `id`: itself, or its nearest
    /// linked-container ancestor, or the root.
    pub fn document_owner(&self, id: NodeId) -> Result<NodeId> {
        self.node(id)?;
        std::iter::once(id)
            .chain(self.ancestors(id))
            .find(|candidate| self.is_document_owner(*candidate))
            .ok_or_else(|| Error::invariant(format!("node {} is not attached to a document", id.0)))
    }

    /// Whether `id` or any descendant persisted in the same document has
    /// unsaved changes. Linked containers save independently and are not
    /// part of the check.
    pub fn has_unsaved_changes(&self, id: NodeId) -> Result<bool> {
        let node = self.node(id)?;
        if node.attributes_changed || node.children_changed {
            return Ok(true);
        }
        for child in &node.children {
            if self.node(*child)?.kind().is_linked_container() {
                continue;
            }
            if self.has_unsaved_changes(*child)? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Clear change flags on `id` and on descendants in the same document.
    pub fn reset_change_flags(&mut self, id: NodeId) -> Result<()> {
        let node = self.node_mut(id)?;
        node.attributes_changed = false;
        node.children_changed = false;
        let children = node.children.clone();
        for child in children {
            if !self.node(child)?.kind().is_linked_container() {
                self.reset_change_flags(child)?;
            }
        }
        Ok(())
    }

    /// Remove `id` from the tree, deleting the backing file or directory of
    /// every resource in its subtree, children first.
    ///
    /// If the node or any descendant is locked nothing is touched and the
    /// refusal is reported instead.
    pub fn clean(&mut self, id: NodeId, reason: &str) -> Result<CleanOutcome> {
        if id == self.root {
            return Err(Error::invariant("the root node cannot be cleaned"));
        }
        self.node(id)?;

        if let Some(locked) = self.find_locked(id) {
            let description = self.describe(locked);
            warn!(node = %description, reason, "refusing to clean locked resource");
            if let Some(journal) = &self.journal {
                journal.record(JournalEntry::now("clean", "refused", description, reason));
            }
            return Ok(CleanOutcome::Refused { locked });
        }

        let description = self.describe(id);
        self.delete_subtree_paths(id, reason)?;
        if let Some(parent) = self.parent(id) {
            self.remove_child(parent, id)?;
        }
        self.free_subtree(id);

        debug!(node = %description, reason, "cleaned node");
        if let Some(journal) = &self.journal {
            journal.record(JournalEntry::now("clean", "ok", description, reason));
        }
        Ok(CleanOutcome::Removed)
    }

    /// First locked resource in the subtree at `id`, if any.
    pub(crate) fn find_locked(&self, id: NodeId) -> Option<NodeId> {
        let node = self.get(id)?;
        if node.kind().is_resource() && node.is_locked() {
            return Some(id);
        }
        node.children.iter().find_map(|child| self.find_locked(*child))
    }

    fn delete_subtree_paths(&self, id: NodeId, reason: &str) -> Result<()> {
        for child in self.children(id)? {
            self.delete_subtree_paths(*child, reason)?;
        }
        self.delete_backing_path(id, reason)
    }

    fn delete_backing_path(&self, id: NodeId, reason: &str) -> Result<()> {
        let node = self.node(id)?;
        if !node.kind().is_resource() {
            return Ok(());
        }
        // A node without its own segment shares its parent's directory.
        if matches!(node.path(), None | Some("") | Some(".")) {
            return Ok(());
        }
        let Ok(path) = self.full_path(id) else {
            return Ok(());
        };

        match fs::symlink_metadata(&path) {
            Ok(metadata) if metadata.is_dir() => fs::remove_dir_all(&path)?,
            Ok(_) => fs::remove_file(&path)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        }
        debug!(path = %path.display(), reason, "deleted backing path");
        Ok(())
    }

    /// Short human-readable description of a node for logs.
    pub fn describe(&self, id: NodeId) -> String {
        let Some(node) = self.get(id) else {
            return format!("<removed node {}>", id.0);
        };
        match self.full_path(id) {
            Ok(path) => format!("{} ({})", node.tag(), path.display()),
            Err(_) => node.tag().to_string(),
        }
    }
}

/// Direct node access by handle.
///
/// # Panics
///
/// Panics if `id` refers to a node that has been discarded. Use
/// [`Tree::node`] or [`Tree::get`] where the handle may be stale.
impl Index<NodeId> for Tree {
    type Output = Node;

    fn index(&self, id: NodeId) -> &Node {
        match self.get(id) {
            Some(node) => node,
            None => panic!("stale node handle {}", id.0),
        }
    }
}
