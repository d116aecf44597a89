//! Checksum and staleness protocol.
//!
//! Derived artifacts record the identity and checksum of their input at
//! the time they were produced. An artifact whose recorded input no longer
//! matches, or whose backing path is gone, is cleaned so that the next
//! pipeline run produces it again.

use crate::attribute::round_str;
use crate::error::Result;
use crate::hash::Checksum;
use crate::node::{
    AttributeBag, DerivedAttributes, Node, NodeId, NodeKind, ResourceAttributes, TRANSFORM_TAG,
    names,
};
use crate::tree::{CleanOutcome, Tree};
use chrono::{DateTime, Utc};
use std::fmt;
use std::fs;
use tracing::{debug, instrument};

/// Value an attribute is compared against.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Target<'a> {
    /// No value; matches an absent or empty attribute.
    None,
    Text(&'a str),
    Float(f64),
}

impl<'a> From<&'a str> for Target<'a> {
    fn from(value: &'a str) -> Self {
        Target::Text(value)
    }
}

impl<'a> From<Option<&'a str>> for Target<'a> {
    fn from(value: Option<&'a str>) -> Self {
        value.map_or(Target::None, Target::Text)
    }
}

impl From<f64> for Target<'_> {
    fn from(value: f64) -> Self {
        Target::Float(value)
    }
}

impl fmt::Display for Target<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::None => f.write_str("<none>"),
            Target::Text(text) => write!(f, "{text:?}"),
            Target::Float(value) => write!(f, "{value}"),
        }
    }
}

/// Canonical comparison form: `None` for absent or empty, rounded when a
/// precision is given and the value is numeric.
fn canonical(value: Option<String>, precision: Option<usize>) -> Option<String> {
    let value = value.filter(|v| !v.is_empty())?;
    match precision {
        Some(digits) => Some(round_str(&value, digits).unwrap_or(value)),
        None => Some(value),
    }
}

/// Shortest round-trip form of a numeric string, so "0.50" and 0.5 agree.
fn shortest_float(value: Option<String>) -> Option<String> {
    value.map(|v| match v.trim().parse::<f64>() {
        Ok(parsed) => parsed.to_string(),
        Err(_) => v,
    })
}

fn target_string(target: Target<'_>) -> Option<String> {
    match target {
        Target::None => None,
        Target::Text(text) => Some(text.to_string()),
        Target::Float(value) => Some(value.to_string()),
    }
}

/// Whether `node`'s `attribute` equals `target`.
///
/// Empty and absent values are equivalent. With a precision both sides
/// are rounded to that many decimal digits before comparing. Without one,
/// a float target is compared against the stored value read as a float.
pub fn is_value_matched(
    node: &Node,
    attribute: &str,
    target: Target<'_>,
    precision: Option<usize>,
) -> bool {
    let mut current = canonical(node.attribute(attribute).map(str::to_string), precision);
    if precision.is_none() && matches!(target, Target::Float(_)) {
        current = shortest_float(current);
    }
    let expected = canonical(target_string(target), precision);
    current == expected
}

/// Result of a validity check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Validity {
    /// The node is still valid.
    Valid(NodeId),
    /// The node was stale and has been cleaned.
    Removed,
    /// The node was stale but is protected by a lock.
    Refused(NodeId),
}

impl Validity {
    /// The surviving node, if any.
    pub fn node(self) -> Option<NodeId> {
        match self {
            Validity::Valid(id) | Validity::Refused(id) => Some(id),
            Validity::Removed => None,
        }
    }
}

/// Clean `to_remove` (default: `node`) unless `node`'s `attribute` matches `target`.
#[instrument(skip(tree, target), fields(target = %target))]
pub fn remove_on_mismatch(
    tree: &mut Tree,
    node: NodeId,
    attribute: &str,
    target: Target<'_>,
    precision: Option<usize>,
    to_remove: Option<NodeId>,
) -> Result<Validity> {
    let current = tree.node(node)?;
    if is_value_matched(current, attribute, target, precision) {
        return Ok(Validity::Valid(node));
    }

    let reason = format!(
        "{attribute} is {:?}, expected {target}",
        current.attribute(attribute).unwrap_or("")
    );
    match tree.clean(to_remove.unwrap_or(node), &reason)? {
        CleanOutcome::Removed => Ok(Validity::Removed),
        CleanOutcome::Refused { .. } => Ok(Validity::Refused(node)),
    }
}

/// Why `id` is stale, or `None` if it is valid.
pub fn invalid_reason(tree: &Tree, id: NodeId) -> Result<Option<String>> {
    if id == tree.root() {
        return Ok(None);
    }
    let node = tree.node(id)?;

    if matches!(node.kind(), NodeKind::Resource | NodeKind::Container { .. })
        && !node.is_locked()
        && !matches!(node.path(), None | Some("") | Some("."))
    {
        let path = tree.full_path(id)?;
        if !path.exists() {
            return Ok(Some(format!("{} is missing", path.display())));
        }
    }

    let Some(recorded) = node.input_transform_checksum() else {
        return Ok(None);
    };
    let name = node.input_transform().unwrap_or("");
    match find_input_transform(tree, id, name, node.input_transform_type())? {
        None => Ok(Some(format!("input transform {name:?} no longer exists"))),
        Some(input) => {
            let current = tree.node(input)?.checksum().unwrap_or("");
            if current == recorded {
                Ok(None)
            } else {
                Ok(Some(format!(
                    "input transform {name:?} changed from {recorded} to {current:?}"
                )))
            }
        }
    }
}

/// The `Transform` named `name` (and of `kind`, if given) among the children
/// of `id`'s nearest ancestors.
pub fn find_input_transform(
    tree: &Tree,
    id: NodeId,
    name: &str,
    kind: Option<&str>,
) -> Result<Option<NodeId>> {
    for ancestor in tree.ancestors(id) {
        for child in tree.children(ancestor)? {
            let candidate = tree.node(*child)?;
            if candidate.tag() == TRANSFORM_TAG
                && candidate.name().unwrap_or("") == name
                && kind.is_none_or(|k| candidate.attribute(names::TYPE) == Some(k))
            {
                return Ok(Some(*child));
            }
        }
    }
    Ok(None)
}

/// Clean `id` if its backing path is gone or its recorded input changed.
#[instrument(skip(tree), fields(node = %tree.describe(id)))]
pub fn clean_if_invalid(tree: &mut Tree, id: NodeId) -> Result<Validity> {
    match invalid_reason(tree, id)? {
        None => Ok(Validity::Valid(id)),
        Some(reason) => {
            debug!(%reason, "node is stale");
            match tree.clean(id, &reason)? {
                CleanOutcome::Removed => Ok(Validity::Removed),
                CleanOutcome::Refused { .. } => Ok(Validity::Refused(id)),
            }
        }
    }
}

/// Hash the resource at `id` and record `Checksum` and `ValidationTime`.
pub fn update_checksum(tree: &mut Tree, id: NodeId) -> Result<Checksum> {
    let checksum = Checksum::of_path(&tree.full_path(id)?)?;
    tree.set_attribute(id, names::CHECKSUM, checksum)?;
    tree.set_attribute(id, names::VALIDATION_TIME, Utc::now())?;
    Ok(checksum)
}

/// Record that `artifact` was produced from `input`.
///
/// Writes the artifact's own checksum and copies the input's identity into
/// the `InputTransform*` attributes.
pub fn record_derivation(
    tree: &mut Tree,
    artifact: NodeId,
    input: Option<NodeId>,
    crop_box: Option<&str>,
) -> Result<Checksum> {
    let checksum = update_checksum(tree, artifact)?;

    if let Some(input) = input {
        let node = tree.node(input)?;
        let name = node.name().unwrap_or("").to_string();
        let kind = node.attribute(names::TYPE).map(str::to_string);
        let input_checksum = node.checksum().unwrap_or("").to_string();

        tree.set_attribute(artifact, names::INPUT_TRANSFORM, name)?;
        if let Some(kind) = kind {
            tree.set_attribute(artifact, names::INPUT_TRANSFORM_TYPE, kind)?;
        } else {
            tree.delete_attribute(artifact, names::INPUT_TRANSFORM_TYPE)?;
        }
        tree.set_attribute(artifact, names::INPUT_TRANSFORM_CHECKSUM, input_checksum)?;
    }
    if let Some(crop_box) = crop_box {
        tree.set_attribute(artifact, names::INPUT_TRANSFORM_CROP_BOX, crop_box)?;
    }
    Ok(checksum)
}

/// Check the resource at `id` against its recorded checksum.
///
/// Re-hashing is skipped when the file has not been modified since the
/// last validation. A resource with no recorded checksum gets one.
/// Returns false on mismatch.
pub fn verify_checksum(tree: &mut Tree, id: NodeId) -> Result<bool> {
    let path = tree.full_path(id)?;
    let node = tree.node(id)?;
    let recorded = node.checksum().map(str::to_string);

    if let (Some(_), Some(validated)) = (&recorded, node.validation_time()) {
        let modified: DateTime<Utc> = fs::metadata(&path)?.modified()?.into();
        if modified <= validated {
            return Ok(true);
        }
    }

    let actual = Checksum::of_path(&path)?;
    match recorded {
        Some(recorded) if recorded != actual.to_hex() => {
            debug!(path = %path.display(), %recorded, %actual, "checksum mismatch");
            Ok(false)
        }
        _ => {
            tree.set_attribute(id, names::CHECKSUM, actual)?;
            tree.set_attribute(id, names::VALIDATION_TIME, Utc::now())?;
            Ok(true)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attribute::{FloatFamily, THRESHOLD_PRECISION};
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        tree: Tree,
        section: NodeId,
        transform: NodeId,
        image: NodeId,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let mut tree = Tree::new(dir.path(), "Volume");
        let root = tree.root();
        let section = tree.create_container("Section", "0001", true);
        tree.append_child(root, section).unwrap();
        let transform = tree.create_element("Transform");
        tree.set_attribute(transform, names::NAME, "Grid").unwrap();
        tree.set_attribute(transform, names::TYPE, "Rigid").unwrap();
        tree.set_attribute(transform, names::CHECKSUM, "c1").unwrap();
        tree.append_child(section, transform).unwrap();
        let image = tree.create_resource("Image", "001.png");
        tree.append_child(section, image).unwrap();

        fs::create_dir_all(dir.path().join("0001")).unwrap();
        fs::write(dir.path().join("0001/001.png"), b"pixels").unwrap();
        record_derivation(&mut tree, image, Some(transform), Some("0,0,10,10")).unwrap();

        Fixture {
            _dir: dir,
            tree,
            section,
            transform,
            image,
        }
    }

    #[test]
    fn test_empty_and_absent_are_equivalent() {
        let mut tree = Tree::new("/tmp/unused", "Volume");
        let node = tree.create_element("Histogram");
        tree.set_attribute(node, "Cutoff", "").unwrap();
        assert!(is_value_matched(&tree[node], "Cutoff", Target::None, None));
        assert!(is_value_matched(&tree[node], "Missing", Target::Text(""), None));
        assert!(!is_value_matched(&tree[node], "Cutoff", "0".into(), None));
    }

    #[test]
    fn test_float_comparison_is_symmetric() {
        let mut tree = Tree::new("/tmp/unused", "Volume");
        let node = tree.create_element("Histogram");
        tree.set_float(node, "Cutoff", 0.1234, FloatFamily::Threshold)
            .unwrap();
        let precision = Some(THRESHOLD_PRECISION);

        assert!(is_value_matched(&tree[node], "Cutoff", 0.12.into(), precision));
        assert!(is_value_matched(&tree[node], "Cutoff", "0.1249".into(), precision));
        assert!(!is_value_matched(&tree[node], "Cutoff", 0.13.into(), precision));

        tree.set_attribute(node, "Cutoff", "0.12").unwrap();
        assert!(is_value_matched(&tree[node], "Cutoff", 0.1234.into(), precision));
    }

    #[test]
    fn test_float_target_without_precision_matches_text() {
        let mut tree = Tree::new("/tmp/unused", "Volume");
        let node = tree.create_element("Histogram");
        tree.set_attribute(node, "Gamma", "0.5").unwrap();
        tree.set_attribute(node, "Cutoff", "0.120").unwrap();

        let as_text = is_value_matched(&tree[node], "Gamma", "0.5".into(), None);
        let as_float = is_value_matched(&tree[node], "Gamma", 0.5.into(), None);
        assert!(as_text);
        assert_eq!(as_text, as_float);

        assert!(is_value_matched(&tree[node], "Cutoff", 0.12.into(), None));
        assert!(!is_value_matched(&tree[node], "Cutoff", 0.125.into(), None));
        assert!(!is_value_matched(&tree[node], "Missing", 0.5.into(), None));
    }

    #[test]
    fn test_record_derivation_writes_contract_attributes() {
        let f = fixture();
        let image = &f.tree[f.image];
        assert_eq!(
            image.checksum(),
            Some(Checksum::of_bytes(b"pixels").to_hex().as_str())
        );
        assert_eq!(image.input_transform(), Some("Grid"));
        assert_eq!(image.input_transform_type(), Some("Rigid"));
        assert_eq!(image.input_transform_checksum(), Some("c1"));
        assert_eq!(image.input_transform_crop_box(), Some("0,0,10,10"));
        assert!(image.validation_time().is_some());
    }

    #[test]
    fn test_staleness_round_trip() {
        let mut f = fixture();
        let input_checksum = f.tree[f.transform].checksum().unwrap().to_string();
        assert!(is_value_matched(
            &f.tree[f.image],
            names::INPUT_TRANSFORM_CHECKSUM,
            input_checksum.as_str().into(),
            None
        ));

        f.tree
            .set_attribute(f.transform, names::CHECKSUM, "c2")
            .unwrap();
        let path = f.tree.full_path(f.image).unwrap();
        let outcome = remove_on_mismatch(
            &mut f.tree,
            f.image,
            names::INPUT_TRANSFORM_CHECKSUM,
            "c2".into(),
            None,
            None,
        )
        .unwrap();

        assert_eq!(outcome, Validity::Removed);
        assert!(!f.tree.contains(f.image));
        assert!(!path.exists());
    }

    #[test]
    fn test_clean_if_invalid_detects_changed_input() {
        let mut f = fixture();
        assert_eq!(
            clean_if_invalid(&mut f.tree, f.image).unwrap(),
            Validity::Valid(f.image)
        );

        f.tree
            .set_attribute(f.transform, names::CHECKSUM, "c2")
            .unwrap();
        assert!(
            invalid_reason(&f.tree, f.image)
                .unwrap()
                .unwrap()
                .contains("changed")
        );
        assert_eq!(
            clean_if_invalid(&mut f.tree, f.image).unwrap(),
            Validity::Removed
        );
        assert_eq!(f.tree.children(f.section).unwrap(), &[f.transform]);
    }

    #[test]
    fn test_clean_if_invalid_detects_missing_input_and_type() {
        let mut f = fixture();
        f.tree
            .set_attribute(f.transform, names::TYPE, "Affine")
            .unwrap();
        assert!(
            invalid_reason(&f.tree, f.image)
                .unwrap()
                .unwrap()
                .contains("no longer exists")
        );
    }

    #[test]
    fn test_missing_backing_file_is_invalid_unless_locked() {
        let mut f = fixture();
        fs::remove_file(f.tree.full_path(f.image).unwrap()).unwrap();

        f.tree.set_locked(f.image, true).unwrap();
        assert_eq!(
            clean_if_invalid(&mut f.tree, f.image).unwrap(),
            Validity::Valid(f.image)
        );

        f.tree.set_locked(f.image, false).unwrap();
        assert_eq!(
            clean_if_invalid(&mut f.tree, f.image).unwrap(),
            Validity::Removed
        );
    }

    #[test]
    fn test_locked_mismatch_is_refused() {
        let mut f = fixture();
        f.tree.set_locked(f.image, true).unwrap();
        let outcome = remove_on_mismatch(
            &mut f.tree,
            f.image,
            names::INPUT_TRANSFORM_CHECKSUM,
            "other".into(),
            None,
            None,
        )
        .unwrap();
        assert_eq!(outcome, Validity::Refused(f.image));
        assert!(f.tree.full_path(f.image).unwrap().exists());
    }

    #[test]
    fn test_verify_checksum_detects_modification() {
        let mut f = fixture();
        assert!(verify_checksum(&mut f.tree, f.image).unwrap());

        let path = f.tree.full_path(f.image).unwrap();
        fs::write(&path, b"different pixels").unwrap();
        // Force a re-hash regardless of filesystem timestamp granularity.
        f.tree
            .delete_attribute(f.image, names::VALIDATION_TIME)
            .unwrap();
        assert!(!verify_checksum(&mut f.tree, f.image).unwrap());
    }

    #[test]
    fn test_verify_checksum_records_missing_checksum() {
        let mut f = fixture();
        f.tree.delete_attribute(f.image, names::CHECKSUM).unwrap();
        assert!(verify_checksum(&mut f.tree, f.image).unwrap());
        assert!(f.tree[f.image].attribute(names::CHECKSUM).is_some());
    }
}
