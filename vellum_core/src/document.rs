//! Persisted documents, link placeholders and lazy loading.
//!
//! Every document owner (the root and each linked container) is stored as
//! its own `Metadata.json` inside its `full_path`. Inside its parent's
//! document a linked container only appears as a `Tag_Link` placeholder
//! carrying the same attributes, which is enough to find and load the
//! real subtree the first time a query looks past it.

use crate::attribute::Attributes;
use crate::error::{Error, Result};
use crate::node::{
    AttributeBag, KindRegistry, LINK_SUFFIX, Node, NodeId, NodeKind, ResourceAttributes, names,
};
use crate::tree::Tree;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, instrument, warn};

/// File name of a persisted document inside its owner's directory.
pub const DOCUMENT_FILE: &str = "Metadata.json";

/// Serialized form of a node and its inline descendants.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentNode {
    pub tag: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Attributes::is_empty")]
    pub attributes: Attributes,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<DocumentNode>,
}

impl DocumentNode {
    /// Read a document from disk.
    pub fn read(path: &Path) -> Result<Self> {
        let bytes = fs::read(path)?;
        serde_json::from_slice(&bytes).map_err(|e| Error::invalid_document(path, e.to_string()))
    }

    /// Write the document atomically, creating its directory if needed.
    pub fn write(&self, path: &Path) -> Result<()> {
        let dir = path
            .parent()
            .ok_or_else(|| Error::invalid_document(path, "document path has no parent"))?;
        fs::create_dir_all(dir)?;

        let mut temp_file = tempfile::NamedTempFile::new_in(dir)?;
        serde_json::to_writer_pretty(&mut temp_file, self)?;
        temp_file.write_all(b"\n")?;
        temp_file.flush()?;
        temp_file.persist(path)?;
        Ok(())
    }
}

impl Tree {
    /// Load the tree persisted in `base_dir`. Linked containers stay as
    /// placeholders until a query needs them.
    #[instrument(skip_all, fields(base_dir = %base_dir.as_ref().display()))]
    pub fn open(base_dir: impl AsRef<Path>, registry: KindRegistry) -> Result<Tree> {
        let base_dir = base_dir.as_ref().to_path_buf();
        let path = base_dir.join(DOCUMENT_FILE);
        if !path.exists() {
            return Err(Error::invalid_document(&path, "root document not found"));
        }
        let doc = DocumentNode::read(&path)?;

        let DocumentNode {
            tag,
            created,
            attributes,
            text,
            children,
        } = doc;
        let root = Node::loaded(
            tag,
            NodeKind::Container { linked: false },
            attributes,
            text,
            created.unwrap_or(DateTime::<Utc>::UNIX_EPOCH),
        );
        let mut tree = Tree::from_root(base_dir, registry, root);
        let root = tree.root();
        for child in children {
            let id = tree.build(child, None);
            tree.adopt_loaded(root, id)?;
        }
        debug!(nodes = tree.count(root), "opened tree");
        Ok(tree)
    }

    /// Path of the document that persists `owner`.
    pub fn document_path(&self, owner: NodeId) -> Result<PathBuf> {
        Ok(self.full_path(owner)?.join(DOCUMENT_FILE))
    }

    /// Serialize `id` and its inline descendants, replacing linked
    /// containers with placeholders.
    pub fn snapshot(&self, id: NodeId) -> Result<DocumentNode> {
        let node = self.node(id)?;
        validate(node)?;

        let mut children = Vec::with_capacity(node.children().len());
        for child in node.children() {
            let child_node = self.node(*child)?;
            if child_node.kind().is_linked_container() {
                children.push(placeholder(child_node)?);
            } else {
                children.push(self.snapshot(*child)?);
            }
        }

        Ok(DocumentNode {
            tag: node.tag().to_string(),
            created: Some(node.creation_time()),
            attributes: node.attributes().clone(),
            text: node.text().map(str::to_string),
            children,
        })
    }

    /// Persist the document holding `id`.
    ///
    /// With `recursive`, linked containers below it that have unsaved
    /// changes or were never written are saved first, depth first.
    #[instrument(skip(self), fields(node = %self.describe(id)))]
    pub fn save(&mut self, id: NodeId, recursive: bool) -> Result<()> {
        let owner = self.document_owner(id)?;
        if recursive {
            self.save_linked_descendants(owner)?;
        }
        self.write_document(owner)
    }

    fn save_linked_descendants(&mut self, id: NodeId) -> Result<()> {
        let children = self.children(id)?.to_vec();
        for child in children {
            self.save_linked_descendants(child)?;
            if self.node(child)?.kind().is_linked_container()
                && (self.has_unsaved_changes(child)? || !self.document_path(child)?.exists())
            {
                self.write_document(child)?;
            }
        }
        Ok(())
    }

    fn write_document(&mut self, owner: NodeId) -> Result<()> {
        if owner != self.root()
            && matches!(self.node(owner)?.path(), None | Some("") | Some("."))
        {
            return Err(Error::invariant(format!(
                "linked container {} needs its own Path",
                self.node(owner)?.tag()
            )));
        }
        let path = self.document_path(owner)?;
        let snapshot = self.snapshot(owner)?;
        snapshot.write(&path)?;
        self.reset_change_flags(owner)?;
        debug!(path = %path.display(), "saved document");
        Ok(())
    }

    /// Replace a link placeholder with the subtree loaded from its document.
    ///
    /// Returns the materialized container, or `None` when the linked
    /// document no longer exists and the placeholder was dropped.
    #[instrument(skip(self), fields(node = %self.describe(placeholder)))]
    pub fn materialize_link(&mut self, placeholder: NodeId) -> Result<Option<NodeId>> {
        let node = self.node(placeholder)?;
        if node.kind() != NodeKind::Link {
            return Ok(Some(placeholder));
        }
        let parent = node
            .parent()
            .ok_or_else(|| Error::invariant("link placeholder is detached"))?;
        let base_tag = node.base_tag().to_string();
        let path = self.document_path(placeholder)?;

        if !path.exists() {
            warn!(path = %path.display(), "linked document is missing; dropping placeholder");
            self.remove_child(parent, placeholder)?;
            self.free_subtree(placeholder);
            return Ok(None);
        }

        let doc = DocumentNode::read(&path)?;
        if doc.tag != base_tag {
            return Err(Error::invalid_document(
                &path,
                format!("expected root tag {base_tag}, found {}", doc.tag),
            ));
        }

        let id = self.build(doc, Some(NodeKind::Container { linked: true }));
        self.replace_child(parent, placeholder, id)?;
        debug!(path = %path.display(), "materialized linked container");
        Ok(Some(id))
    }

    /// Discard in-memory state of `owner`'s document and read it back from disk.
    ///
    /// Nodes that still exist on disk keep their handles: persisted nodes
    /// are matched to loaded ones by tag, `Name` and `Path`, in order.
    /// Materialized linked containers are kept as they are.
    #[instrument(skip(self), fields(node = %self.describe(owner)))]
    pub fn reload_document(&mut self, owner: NodeId) -> Result<()> {
        if !self.is_document_owner(owner) {
            return Err(Error::invariant(format!(
                "{} does not own a document",
                self.describe(owner)
            )));
        }
        let path = self.document_path(owner)?;

        if !path.exists() {
            if owner == self.root() {
                return Err(Error::invalid_document(&path, "root document not found"));
            }
            // Never saved: nothing on disk to roll back to.
            if let Some(parent) = self.parent(owner) {
                self.remove_child(parent, owner)?;
            }
            self.free_subtree(owner);
            debug!(path = %path.display(), "dropped unsaved linked container");
            return Ok(());
        }

        let doc = DocumentNode::read(&path)?;
        let current_tag = self.node(owner)?.tag().to_string();
        if doc.tag != current_tag {
            return Err(Error::invalid_document(
                &path,
                format!("expected root tag {current_tag}, found {}", doc.tag),
            ));
        }

        let children = self.restore(owner, doc)?;
        self.reconcile(owner, children)?;
        self.invalidate_full_paths(owner);
        self.reset_change_flags(owner)?;
        debug!(path = %path.display(), "reloaded document");
        Ok(())
    }

    /// Overwrite `id`'s persisted state with `doc`'s, returning its children.
    fn restore(&mut self, id: NodeId, doc: DocumentNode) -> Result<Vec<DocumentNode>> {
        let DocumentNode {
            tag,
            created,
            attributes,
            text,
            children,
        } = doc;
        let kind = self.node(id)?.kind();
        let fresh = Node::loaded(
            tag,
            kind,
            attributes,
            text,
            created.unwrap_or(DateTime::<Utc>::UNIX_EPOCH),
        );
        self.node_mut(id)?.replace_state(fresh);
        Ok(children)
    }

    fn reconcile(&mut self, id: NodeId, docs: Vec<DocumentNode>) -> Result<()> {
        let mut unused = std::mem::take(&mut self.node_mut(id)?.children);
        let mut children = Vec::with_capacity(docs.len());

        for doc in docs {
            let matched = unused
                .iter()
                .position(|c| self.get(*c).is_some_and(|node| same_identity(node, &doc)));
            let child = match matched {
                Some(index) => {
                    let child = unused.remove(index);
                    // A materialized linked container is its own document.
                    if !self.node(child)?.kind().is_linked_container() {
                        let grandchildren = self.restore(child, doc)?;
                        self.reconcile(child, grandchildren)?;
                    }
                    child
                }
                None => self.build(doc, None),
            };
            self.node_mut(child)?.parent = Some(id);
            children.push(child);
        }

        self.node_mut(id)?.children = children;
        for stale in unused {
            self.free_subtree(stale);
        }
        Ok(())
    }

    /// Reload every document with unsaved changes, outermost first.
    ///
    /// Returns the number of documents reloaded.
    pub fn reload_dirty(&mut self) -> Result<usize> {
        let mut owners = Vec::new();
        self.collect_dirty_owners(self.root(), &mut owners)?;

        let mut reloaded = 0;
        for owner in owners {
            if !self.contains(owner) || !self.has_unsaved_changes(owner)? {
                continue;
            }
            self.reload_document(owner)?;
            reloaded += 1;
        }
        Ok(reloaded)
    }

    fn collect_dirty_owners(&self, id: NodeId, out: &mut Vec<NodeId>) -> Result<()> {
        if self.is_document_owner(id) && self.has_unsaved_changes(id)? {
            out.push(id);
        }
        for child in self.children(id)? {
            self.collect_dirty_owners(*child, out)?;
        }
        Ok(())
    }

    /// Build a detached, unchanged subtree from a document.
    fn build(&mut self, doc: DocumentNode, kind: Option<NodeKind>) -> NodeId {
        let DocumentNode {
            tag,
            created,
            attributes,
            text,
            children,
        } = doc;
        let kind = kind.unwrap_or_else(|| self.registry().kind_for(&tag, &attributes));
        let id = self.insert(Node::loaded(
            tag,
            kind,
            attributes,
            text,
            created.unwrap_or(DateTime::<Utc>::UNIX_EPOCH),
        ));
        for child in children {
            let child_id = self.build(child, None);
            // Freshly built nodes are always attachable.
            if let Ok(node) = self.node_mut(child_id) {
                node.parent = Some(id);
            }
            if let Ok(node) = self.node_mut(id) {
                node.children.push(child_id);
            }
        }
        id
    }

    /// Attach a loaded subtree without marking anything changed.
    fn adopt_loaded(&mut self, parent: NodeId, child: NodeId) -> Result<()> {
        self.node_mut(parent)?.children.push(child);
        self.node_mut(child)?.parent = Some(parent);
        Ok(())
    }

    /// Number of loaded nodes in the subtree at `id`.
    pub fn count(&self, id: NodeId) -> usize {
        self.get(id).map_or(0, |node| {
            1 + node
                .children()
                .iter()
                .map(|c| self.count(*c))
                .sum::<usize>()
        })
    }
}

fn validate(node: &Node) -> Result<()> {
    if node.tag().is_empty() {
        return Err(Error::invariant("cannot save a node with an empty tag"));
    }
    if node.attributes().iter().any(|(name, _)| name.is_empty()) {
        return Err(Error::invariant(format!(
            "cannot save {} with an unnamed attribute",
            node.tag()
        )));
    }
    Ok(())
}

/// Whether `doc` persists `node`: same tag (or its placeholder), `Name` and `Path`.
fn same_identity(node: &Node, doc: &DocumentNode) -> bool {
    let tag_matches = if node.kind().is_linked_container() {
        doc.tag.strip_suffix(LINK_SUFFIX) == Some(node.tag())
    } else {
        doc.tag == node.tag()
    };
    tag_matches
        && node.attribute(names::NAME) == doc.attributes.get(names::NAME)
        && node.attribute(names::PATH) == doc.attributes.get(names::PATH)
}

fn placeholder(node: &Node) -> Result<DocumentNode> {
    validate(node)?;
    Ok(DocumentNode {
        tag: format!("{}{}", node.tag(), LINK_SUFFIX),
        created: Some(node.creation_time()),
        attributes: node.attributes().clone(),
        text: None,
        children: Vec::new(),
    })
}
