//! Metadata nodes and the typed accessor layer over their attribute bag.

use crate::attribute::{Attributes, FromAttribute};
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use std::cell::RefCell;
use std::collections::HashMap;
use std::path::PathBuf;

/// Well-known attribute names.
pub mod names {
    pub const NAME: &str = "Name";
    pub const TYPE: &str = "Type";
    pub const PATH: &str = "Path";
    pub const LOCKED: &str = "Locked";
    pub const VALIDATION_TIME: &str = "ValidationTime";
    pub const CHECKSUM: &str = "Checksum";
    pub const INPUT_TRANSFORM: &str = "InputTransform";
    pub const INPUT_TRANSFORM_TYPE: &str = "InputTransformType";
    pub const INPUT_TRANSFORM_CHECKSUM: &str = "InputTransformChecksum";
    pub const INPUT_TRANSFORM_CROP_BOX: &str = "InputTransformCropBox";
}

/// Tag suffix marking a link placeholder in a persisted document.
pub const LINK_SUFFIX: &str = "_Link";

/// Tag of the elements a derived artifact names as its input.
pub const TRANSFORM_TAG: &str = "Transform";

/// Handle to a node in a [`crate::Tree`].
///
/// Handles are never reused, so a handle to a removed node stays invalid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub(crate) usize);

/// What a node stands for, beyond its attribute bag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    /// Plain element with no backing file.
    Element,
    /// Backed by a file or directory at its `full_path`.
    Resource,
    /// A resource that owns a nested sub-tree. Linked containers persist as
    /// their own document.
    Container { linked: bool },
    /// Placeholder for a linked container that has not been loaded yet.
    Link,
}

impl NodeKind {
    /// Whether the node maps to a path on disk.
    pub fn is_resource(self) -> bool {
        !matches!(self, NodeKind::Element)
    }

    pub fn is_linked_container(self) -> bool {
        matches!(self, NodeKind::Container { linked: true })
    }
}

/// A tagged, attributed node with ordered children.
#[derive(Debug)]
pub struct Node {
    tag: String,
    kind: NodeKind,
    attributes: Attributes,
    text: Option<String>,
    creation_time: DateTime<Utc>,
    pub(crate) parent: Option<NodeId>,
    pub(crate) children: Vec<NodeId>,
    pub(crate) attributes_changed: bool,
    pub(crate) children_changed: bool,
    pub(crate) full_path: RefCell<Option<PathBuf>>,
}

impl Node {
    /// Create a new, detached node. New nodes start out changed.
    pub(crate) fn new(tag: impl Into<String>, kind: NodeKind) -> Self {
        Self {
            tag: tag.into(),
            kind,
            attributes: Attributes::new(),
            text: None,
            creation_time: Utc::now(),
            parent: None,
            children: Vec::new(),
            attributes_changed: true,
            children_changed: true,
            full_path: RefCell::new(None),
        }
    }

    /// Create a node from persisted state. Loaded nodes start out clean.
    pub(crate) fn loaded(
        tag: String,
        kind: NodeKind,
        attributes: Attributes,
        text: Option<String>,
        creation_time: DateTime<Utc>,
    ) -> Self {
        Self {
            tag,
            kind,
            attributes,
            text,
            creation_time,
            parent: None,
            children: Vec::new(),
            attributes_changed: false,
            children_changed: false,
            full_path: RefCell::new(None),
        }
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    /// The tag with any link suffix removed.
    pub fn base_tag(&self) -> &str {
        match self.kind {
            NodeKind::Link => self.tag.strip_suffix(LINK_SUFFIX).unwrap_or(&self.tag),
            _ => &self.tag,
        }
    }

    pub fn kind(&self) -> NodeKind {
        self.kind
    }

    pub fn text(&self) -> Option<&str> {
        self.text.as_deref()
    }

    pub fn creation_time(&self) -> DateTime<Utc> {
        self.creation_time
    }

    pub fn parent(&self) -> Option<NodeId> {
        self.parent
    }

    pub fn children(&self) -> &[NodeId] {
        &self.children
    }

    pub fn attributes_changed(&self) -> bool {
        self.attributes_changed
    }

    pub fn children_changed(&self) -> bool {
        self.children_changed
    }

    /// Write an attribute, marking the node changed if the value differs.
    pub(crate) fn set_attribute(&mut self, name: &str, value: String) -> bool {
        let changed = self.attributes.set(name, value);
        self.attributes_changed |= changed;
        changed
    }

    pub(crate) fn delete_attribute(&mut self, name: &str) -> Option<String> {
        let removed = self.attributes.remove(name);
        self.attributes_changed |= removed.is_some();
        removed
    }

    pub(crate) fn set_text(&mut self, text: Option<String>) {
        if self.text != text {
            self.text = text;
            self.attributes_changed = true;
        }
    }

    /// Replace all persisted state with `other`'s, leaving links intact.
    pub(crate) fn replace_state(&mut self, other: Node) {
        self.attributes = other.attributes;
        self.text = other.text;
        self.creation_time = other.creation_time;
        self.attributes_changed = false;
        self.children_changed = false;
    }
}

/// Read access to a node's string attributes.
pub trait AttributeBag {
    fn attributes(&self) -> &Attributes;

    fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes().get(name)
    }

    /// Parse an attribute as `T`. Absent and empty values read as `None`.
    fn get<T: FromAttribute>(&self, name: &str) -> Result<Option<T>> {
        match self.attribute(name) {
            None | Some("") => Ok(None),
            Some(value) => T::from_attribute(value)
                .map(Some)
                .ok_or_else(|| Error::invalid_attribute(name, value)),
        }
    }

    fn name(&self) -> Option<&str> {
        self.attribute(names::NAME)
    }
}

impl AttributeBag for Node {
    fn attributes(&self) -> &Attributes {
        &self.attributes
    }
}

/// Accessors for nodes backed by a file or directory.
pub trait ResourceAttributes: AttributeBag {
    /// Path segment relative to the nearest ancestor resource.
    fn path(&self) -> Option<&str> {
        self.attribute(names::PATH)
    }

    /// Locked resources are never removed by automatic cleanup.
    fn is_locked(&self) -> bool {
        matches!(self.get::<bool>(names::LOCKED), Ok(Some(true)))
    }

    fn validation_time(&self) -> Option<DateTime<Utc>> {
        self.get(names::VALIDATION_TIME).ok().flatten()
    }
}

impl ResourceAttributes for Node {}

/// Accessors for derived artifacts and the inputs they record.
pub trait DerivedAttributes: AttributeBag {
    fn checksum(&self) -> Option<&str> {
        self.attribute(names::CHECKSUM).filter(|c| !c.is_empty())
    }

    fn input_transform(&self) -> Option<&str> {
        self.attribute(names::INPUT_TRANSFORM).filter(|c| !c.is_empty())
    }

    fn input_transform_type(&self) -> Option<&str> {
        self.attribute(names::INPUT_TRANSFORM_TYPE)
            .filter(|c| !c.is_empty())
    }

    fn input_transform_checksum(&self) -> Option<&str> {
        self.attribute(names::INPUT_TRANSFORM_CHECKSUM)
            .filter(|c| !c.is_empty())
    }

    fn input_transform_crop_box(&self) -> Option<&str> {
        self.attribute(names::INPUT_TRANSFORM_CROP_BOX)
            .filter(|c| !c.is_empty())
    }
}

impl DerivedAttributes for Node {}

/// Decides the kind of a node read from a document by its tag.
#[derive(Debug, Clone)]
pub struct KindRegistry {
    containers: HashMap<String, bool>,
}

impl KindRegistry {
    /// A registry with no container tags.
    pub fn empty() -> Self {
        Self {
            containers: HashMap::new(),
        }
    }

    /// Register `tag` as a container, persisted as its own document if `linked`.
    pub fn register_container(&mut self, tag: impl Into<String>, linked: bool) -> &mut Self {
        self.containers.insert(tag.into(), linked);
        self
    }

    /// Kind for a node with `tag` carrying `attributes`.
    pub fn kind_for(&self, tag: &str, attributes: &Attributes) -> NodeKind {
        if tag.ends_with(LINK_SUFFIX) {
            return NodeKind::Link;
        }
        if let Some(linked) = self.containers.get(tag) {
            return NodeKind::Container { linked: *linked };
        }
        if attributes.contains(names::PATH) {
            NodeKind::Resource
        } else {
            NodeKind::Element
        }
    }
}

impl Default for KindRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        registry
            .register_container("Volume", false)
            .register_container("Block", true)
            .register_container("Section", true)
            .register_container("Channel", true)
            .register_container("Filter", true)
            .register_container("TilePyramid", false)
            .register_container("ImageSet", false)
            .register_container("TileSet", false);
        registry
    }
}
