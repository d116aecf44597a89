//! Path queries: `/`-separated steps of `Tag`, `*` or `Tag[@Attr='Value']`.
//!
//! Each step matches one level of children. Link placeholders whose tag
//! could satisfy a step are materialized before matching, so a query sees
//! the same nodes whether a container is linked or stored inline.

use crate::error::{Error, Result};
use crate::node::{AttributeBag, Node, NodeId, NodeKind};
use crate::tree::Tree;
use std::fmt;
use std::str::FromStr;
use tracing::debug;

/// Attribute equality test of a step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Predicate {
    pub attribute: String,
    pub value: String,
}

/// One level of a query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Step {
    /// Required tag, or `None` for `*`.
    pub tag: Option<String>,
    pub predicate: Option<Predicate>,
}

impl Step {
    fn parse(query: &str, segment: &str) -> Result<Self> {
        let (tag, rest) = match segment.find('[') {
            Some(index) => (&segment[..index], Some(&segment[index..])),
            None => (segment, None),
        };

        let tag = match tag {
            "*" => None,
            "" => return Err(Error::invalid_query(query, "empty tag in step")),
            t if t.chars().all(|c| c.is_alphanumeric() || c == '_' || c == '-') => {
                Some(t.to_string())
            }
            t => return Err(Error::invalid_query(query, format!("invalid tag {t:?}"))),
        };

        let predicate = match rest {
            None => None,
            Some(rest) => Some(parse_predicate(query, rest)?),
        };

        Ok(Self { tag, predicate })
    }

    /// Whether a loaded node satisfies this step.
    pub fn matches(&self, node: &Node) -> bool {
        self.tag.as_deref().is_none_or(|tag| node.tag() == tag) && self.predicate_holds(node)
    }

    /// Whether the subtree behind a link placeholder could satisfy this step.
    fn could_match_link(&self, link: &Node) -> bool {
        self.tag.as_deref().is_none_or(|tag| link.base_tag() == tag) && self.predicate_holds(link)
    }

    fn predicate_holds(&self, node: &Node) -> bool {
        match &self.predicate {
            None => true,
            Some(p) => node.attribute(&p.attribute).unwrap_or("") == p.value,
        }
    }
}

fn parse_predicate(query: &str, text: &str) -> Result<Predicate> {
    let inner = text
        .strip_prefix("[@")
        .and_then(|t| t.strip_suffix(']'))
        .ok_or_else(|| Error::invalid_query(query, format!("malformed predicate {text:?}")))?;
    let (attribute, value) = inner
        .split_once('=')
        .ok_or_else(|| Error::invalid_query(query, "predicate needs '='"))?;

    let attribute = attribute.trim();
    if attribute.is_empty() {
        return Err(Error::invalid_query(query, "predicate names no attribute"));
    }

    let value = value.trim();
    let unquoted = ['\'', '"'].iter().find_map(|quote| {
        value
            .strip_prefix(*quote)
            .and_then(|v| v.strip_suffix(*quote))
    });
    let value = unquoted.ok_or_else(|| {
        Error::invalid_query(query, format!("predicate value {value:?} must be quoted"))
    })?;

    Ok(Predicate {
        attribute: attribute.to_string(),
        value: value.to_string(),
    })
}

/// A parsed path query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Query {
    text: String,
    steps: Vec<Step>,
}

impl Query {
    pub fn parse(text: &str) -> Result<Self> {
        let mut steps = Vec::new();
        for segment in split_segments(text) {
            let segment = segment.trim();
            if segment == "." {
                continue;
            }
            if segment.is_empty() {
                return Err(Error::invalid_query(text, "empty step"));
            }
            steps.push(Step::parse(text, segment)?);
        }
        Ok(Self {
            text: text.to_string(),
            steps,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }
}

impl FromStr for Query {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Query::parse(s)
    }
}

impl fmt::Display for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

/// Split on `/` outside predicates and quotes.
fn split_segments(text: &str) -> Vec<&str> {
    let mut segments = Vec::new();
    let mut start = 0;
    let mut depth = 0usize;
    let mut quote: Option<char> = None;

    for (index, c) in text.char_indices() {
        match (quote, c) {
            (Some(q), c) if c == q => quote = None,
            (Some(_), _) => {}
            (None, '\'' | '"') => quote = Some(c),
            (None, '[') => depth += 1,
            (None, ']') => depth = depth.saturating_sub(1),
            (None, '/') if depth == 0 => {
                segments.push(&text[start..index]);
                start = index + 1;
            }
            _ => {}
        }
    }
    segments.push(&text[start..]);
    segments
}

#[derive(Debug)]
struct Frame {
    depth: usize,
    parent: NodeId,
    candidates: Vec<NodeId>,
    next: usize,
}

/// Lazy, restartable sequence of query results in document order.
///
/// Candidates of each level are captured when the level is first entered;
/// candidates removed or moved in the meantime are skipped.
#[derive(Debug)]
pub struct FindAll {
    from: NodeId,
    query: Query,
    stack: Vec<Frame>,
    started: bool,
}

impl FindAll {
    pub fn new(from: NodeId, query: Query) -> Self {
        Self {
            from,
            query,
            stack: Vec::new(),
            started: false,
        }
    }

    pub fn query(&self) -> &Query {
        &self.query
    }

    /// Start over from the first result.
    pub fn restart(&mut self) {
        self.stack.clear();
        self.started = false;
    }

    /// Next matching node, materializing links as needed.
    pub fn next(&mut self, tree: &mut Tree) -> Result<Option<NodeId>> {
        let steps = self.query.steps();
        if !self.started {
            self.started = true;
            if steps.is_empty() {
                return Ok(tree.contains(self.from).then_some(self.from));
            }
            let candidates = tree.matching_children(self.from, &steps[0])?;
            self.stack.push(Frame {
                depth: 0,
                parent: self.from,
                candidates,
                next: 0,
            });
        }

        loop {
            let Some(frame) = self.stack.last_mut() else {
                return Ok(None);
            };
            let Some(candidate) = frame.candidates.get(frame.next).copied() else {
                self.stack.pop();
                continue;
            };
            frame.next += 1;
            let (depth, parent) = (frame.depth, frame.parent);

            if tree.parent(candidate) != Some(parent) {
                continue;
            }
            if depth + 1 == steps.len() {
                return Ok(Some(candidate));
            }

            let candidates = tree.matching_children(candidate, &steps[depth + 1])?;
            self.stack.push(Frame {
                depth: depth + 1,
                parent: candidate,
                candidates,
                next: 0,
            });
        }
    }

    /// Drain the remaining results.
    pub fn collect(&mut self, tree: &mut Tree) -> Result<Vec<NodeId>> {
        let mut results = Vec::new();
        while let Some(id) = self.next(tree)? {
            results.push(id);
        }
        Ok(results)
    }
}

impl Tree {
    /// First node matching `query` below `from`.
    pub fn find(&mut self, from: NodeId, query: &str) -> Result<Option<NodeId>> {
        self.find_all(from, query)?.next(self)
    }

    /// All nodes matching `query` below `from`, as a lazy sequence.
    pub fn find_all(&mut self, from: NodeId, query: &str) -> Result<FindAll> {
        self.node(from)?;
        Ok(FindAll::new(from, Query::parse(query)?))
    }

    /// Children of `parent` satisfying `step`, loading placeholders that
    /// could match. If loading was the only change to a clean document, the
    /// document is saved so the links are not resolved again.
    pub(crate) fn matching_children(&mut self, parent: NodeId, step: &Step) -> Result<Vec<NodeId>> {
        let owner = self.document_owner(parent).ok();
        let was_clean = match owner {
            Some(owner) => !self.has_unsaved_changes(owner)?,
            None => false,
        };

        let mut materialized = false;
        let mut matches = Vec::new();
        for child in self.children(parent)?.to_vec() {
            let node = self.node(child)?;
            let child = if node.kind() == NodeKind::Link {
                if !step.could_match_link(node) {
                    continue;
                }
                materialized = true;
                match self.materialize_link(child)? {
                    Some(id) => id,
                    None => continue,
                }
            } else {
                child
            };
            if step.matches(self.node(child)?) {
                matches.push(child);
            }
        }

        if let Some(owner) = owner {
            if materialized && was_clean && self.has_unsaved_changes(owner)? {
                debug!(node = %self.describe(owner), "saving document after link resolution");
                self.save(owner, false)?;
            }
        }
        Ok(matches)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::DOCUMENT_FILE;
    use crate::node::{KindRegistry, names};
    use tempfile::TempDir;

    #[test]
    fn test_parse_steps() {
        let query = Query::parse("Section/*/Transform[@Name='Grid']").unwrap();
        assert_eq!(query.steps().len(), 3);
        assert_eq!(query.steps()[0].tag.as_deref(), Some("Section"));
        assert_eq!(query.steps()[1].tag, None);
        assert_eq!(
            query.steps()[2].predicate,
            Some(Predicate {
                attribute: "Name".to_string(),
                value: "Grid".to_string(),
            })
        );
    }

    #[test]
    fn test_parse_quotes_and_slashes_in_values() {
        let query = Query::parse(r#"Image[@Path="a/b.png"]"#).unwrap();
        assert_eq!(query.steps().len(), 1);
        assert_eq!(
            query.steps()[0].predicate.as_ref().unwrap().value,
            "a/b.png"
        );
        assert!(Query::parse("./Section").unwrap().steps().len() == 1);
    }

    #[test]
    fn test_parse_rejects_malformed_queries() {
        for bad in [
            "",
            "Section//Transform",
            "Section/",
            "Transform[@Name=Grid]",
            "Transform[Name='Grid']",
            "Transform[@='x']",
            "Trans form",
        ] {
            assert!(
                matches!(Query::parse(bad), Err(Error::InvalidQuery { .. })),
                "{bad:?} should be rejected"
            );
        }
    }

    fn volume_with_sections(dir: &std::path::Path, linked: bool) -> Tree {
        let mut tree = Tree::new(dir, "Volume");
        let root = tree.root();
        for (index, name) in ["Grid", "Refined", "Grid"].iter().enumerate() {
            let section = tree.create_container("Section", &format!("{:04}", index + 1), linked);
            tree.set_attribute(section, "Number", index as u32 + 1).unwrap();
            tree.append_child(root, section).unwrap();
            let transform = tree.create_element("Transform");
            tree.set_attribute(transform, names::NAME, *name).unwrap();
            tree.append_child(section, transform).unwrap();
        }
        tree.save(root, true).unwrap();
        tree
    }

    fn describe_results(tree: &mut Tree, query: &str) -> Vec<(String, String, std::path::PathBuf)> {
        let root = tree.root();
        let results = tree.find_all(root, query).unwrap().collect(tree).unwrap();
        results
            .into_iter()
            .map(|id| {
                let parent = tree.parent(id).unwrap();
                (
                    tree[id].tag().to_string(),
                    tree[parent].attribute("Number").unwrap_or("").to_string(),
                    tree.full_path(id).unwrap(),
                )
            })
            .collect()
    }

    #[test]
    fn test_link_transparency() {
        let linked_dir = TempDir::new().unwrap();
        let inline_dir = TempDir::new().unwrap();
        volume_with_sections(linked_dir.path(), true);
        volume_with_sections(inline_dir.path(), false);

        let mut inline_registry = KindRegistry::default();
        inline_registry.register_container("Section", false);

        let mut linked = Tree::open(linked_dir.path(), KindRegistry::default()).unwrap();
        let mut inline = Tree::open(inline_dir.path(), inline_registry).unwrap();

        for query in ["Section/Transform[@Name='Grid']", "*/*", "Section[@Number='2']/*"] {
            let a = describe_results(&mut linked, query);
            let b = describe_results(&mut inline, query);
            assert_eq!(a.len(), b.len(), "{query}");
            for ((tag_a, number_a, path_a), (tag_b, number_b, path_b)) in a.iter().zip(&b) {
                assert_eq!(tag_a, tag_b);
                assert_eq!(number_a, number_b);
                assert_eq!(
                    path_a.strip_prefix(linked_dir.path()).unwrap(),
                    path_b.strip_prefix(inline_dir.path()).unwrap()
                );
            }
        }
    }

    #[test]
    fn test_wildcard_materializes_links_and_saves() {
        let temp_dir = TempDir::new().unwrap();
        volume_with_sections(temp_dir.path(), true);
        let mut tree = Tree::open(temp_dir.path(), KindRegistry::default()).unwrap();
        let root = tree.root();

        let first = tree.find(root, "*").unwrap().unwrap();
        assert_eq!(tree[first].kind(), NodeKind::Container { linked: true });
        assert!(
            tree.children(root)
                .unwrap()
                .iter()
                .all(|c| tree[*c].kind() != NodeKind::Link)
        );
        // Resolution alone left the root document clean and on disk.
        assert!(!tree.has_unsaved_changes(root).unwrap());
        assert!(temp_dir.path().join(DOCUMENT_FILE).exists());
    }

    #[test]
    fn test_predicate_only_loads_matching_links() {
        let temp_dir = TempDir::new().unwrap();
        volume_with_sections(temp_dir.path(), true);
        let mut tree = Tree::open(temp_dir.path(), KindRegistry::default()).unwrap();
        let root = tree.root();

        let found = tree.find(root, "Section[@Number='2']").unwrap().unwrap();
        assert_eq!(tree[found].attribute("Number"), Some("2"));
        let links = tree
            .children(root)
            .unwrap()
            .iter()
            .filter(|c| tree[**c].kind() == NodeKind::Link)
            .count();
        assert_eq!(links, 2);
    }

    #[test]
    fn test_find_returns_none_without_match() {
        let temp_dir = TempDir::new().unwrap();
        let mut tree = volume_with_sections(temp_dir.path(), false);
        let root = tree.root();
        assert_eq!(tree.find(root, "Section/Histogram").unwrap(), None);
        assert_eq!(tree.find(root, "Channel").unwrap(), None);
        assert_eq!(tree.find(root, ".").unwrap(), Some(root));
    }

    #[test]
    fn test_find_all_skips_removed_candidates_and_restarts() {
        let temp_dir = TempDir::new().unwrap();
        let mut tree = volume_with_sections(temp_dir.path(), false);
        let root = tree.root();

        let mut results = tree.find_all(root, "Section").unwrap();
        let first = results.next(&mut tree).unwrap().unwrap();
        let second = tree.children(root).unwrap()[1];
        tree.clean(second, "test").unwrap();

        let rest = results.collect(&mut tree).unwrap();
        assert_eq!(rest.len(), 1);
        assert_ne!(rest[0], second);

        results.restart();
        assert_eq!(results.next(&mut tree).unwrap(), Some(first));
        assert_eq!(results.collect(&mut tree).unwrap().len(), 1);
    }
}
