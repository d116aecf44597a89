//! Removal of stale artifacts across the whole tree.

use crate::error::Result;
use crate::node::NodeId;
use crate::staleness::invalid_reason;
use crate::tree::{CleanOutcome, Tree};
use crate::walk::disk_usage;
use serde::Serialize;
use tracing::{info, instrument};

/// Statistics from a prune run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PruneStats {
    /// Number of stale subtrees removed.
    pub nodes_removed: usize,
    /// Number of stale subtrees kept because they hold a locked resource.
    pub nodes_refused: usize,
    /// Bytes freed.
    pub bytes_freed: u64,
}

impl Tree {
    /// Clean every stale node, loading linked containers on the way.
    ///
    /// If `dry_run` is true, reports what would be removed without removing
    /// anything. Removed nodes are not saved; callers persist the tree.
    #[instrument(skip(self))]
    pub fn prune(&mut self, dry_run: bool) -> Result<PruneStats> {
        let mut stats = PruneStats::default();
        let root = self.root();
        self.sweep(root, dry_run, &mut stats)?;
        info!(
            removed = stats.nodes_removed,
            refused = stats.nodes_refused,
            bytes = stats.bytes_freed,
            "prune finished"
        );
        Ok(stats)
    }

    fn sweep(&mut self, id: NodeId, dry_run: bool, stats: &mut PruneStats) -> Result<()> {
        if let Some(reason) = invalid_reason(self, id)? {
            if self.find_locked(id).is_some() {
                stats.nodes_refused += 1;
            } else {
                let bytes = match self.full_path(id) {
                    Ok(path) => disk_usage(&path)?,
                    Err(_) => 0,
                };
                if dry_run {
                    stats.nodes_removed += 1;
                    stats.bytes_freed += bytes;
                    return Ok(());
                }
                if self.clean(id, &reason)? == CleanOutcome::Removed {
                    stats.nodes_removed += 1;
                    stats.bytes_freed += bytes;
                }
                return Ok(());
            }
        }

        for child in self.children(id)?.to_vec() {
            let Some(child) = self.materialize_link(child)? else {
                continue;
            };
            self.sweep(child, dry_run, stats)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::{KindRegistry, names};
    use crate::staleness::record_derivation;
    use std::fs;
    use tempfile::TempDir;

    /// Volume with one section holding a transform and two derived images.
    fn build(dir: &std::path::Path) -> Tree {
        let mut tree = Tree::new(dir, "Volume");
        let root = tree.root();
        let section = tree.create_container("Section", "0001", true);
        tree.append_child(root, section).unwrap();
        let transform = tree.create_element("Transform");
        tree.set_attribute(transform, names::NAME, "Grid").unwrap();
        tree.set_attribute(transform, names::CHECKSUM, "c1").unwrap();
        tree.append_child(section, transform).unwrap();

        fs::create_dir_all(dir.join("0001")).unwrap();
        for name in ["a.png", "b.png"] {
            let image = tree.create_resource("Image", name);
            tree.append_child(section, image).unwrap();
            fs::write(dir.join("0001").join(name), b"0123456789").unwrap();
            record_derivation(&mut tree, image, Some(transform), None).unwrap();
        }
        tree.save(root, true).unwrap();
        tree
    }

    fn change_transform(dir: &std::path::Path) -> Tree {
        let mut tree = Tree::open(dir, KindRegistry::default()).unwrap();
        let root = tree.root();
        let transform = tree.find(root, "Section/Transform").unwrap().unwrap();
        tree.set_attribute(transform, names::CHECKSUM, "c2").unwrap();
        tree
    }

    #[test]
    fn test_prune_clean_tree_removes_nothing() {
        let temp_dir = TempDir::new().unwrap();
        let mut tree = build(temp_dir.path());
        assert_eq!(tree.prune(false).unwrap(), PruneStats::default());
    }

    #[test]
    fn test_prune_removes_stale_artifacts() {
        let temp_dir = TempDir::new().unwrap();
        build(temp_dir.path());
        let mut tree = change_transform(temp_dir.path());

        let stats = tree.prune(false).unwrap();
        assert_eq!(stats.nodes_removed, 2);
        assert_eq!(stats.bytes_freed, 20);
        assert!(!temp_dir.path().join("0001/a.png").exists());

        let root = tree.root();
        assert_eq!(tree.find(root, "Section/Image").unwrap(), None);
    }

    #[test]
    fn test_prune_dry_run_keeps_everything() {
        let temp_dir = TempDir::new().unwrap();
        build(temp_dir.path());
        let mut tree = change_transform(temp_dir.path());

        let stats = tree.prune(true).unwrap();
        assert_eq!(stats.nodes_removed, 2);
        assert_eq!(stats.bytes_freed, 20);
        assert!(temp_dir.path().join("0001/a.png").exists());
        let root = tree.root();
        let images = tree
            .find_all(root, "Section/Image")
            .unwrap()
            .collect(&mut tree)
            .unwrap();
        assert_eq!(images.len(), 2);
    }

    #[test]
    fn test_prune_respects_locks() {
        let temp_dir = TempDir::new().unwrap();
        build(temp_dir.path());
        let mut tree = change_transform(temp_dir.path());
        let root = tree.root();
        let image = tree.find(root, "Section/Image").unwrap().unwrap();
        tree.set_locked(image, true).unwrap();

        let stats = tree.prune(false).unwrap();
        assert_eq!(stats.nodes_removed, 1);
        assert_eq!(stats.nodes_refused, 1);
        assert!(temp_dir.path().join("0001/a.png").exists());
        assert!(!temp_dir.path().join("0001/b.png").exists());
    }
}
