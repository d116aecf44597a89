//! Volume directory management.

use crate::error::{Error, Result};
use crate::hash::Algorithm;
use crate::journal::Journal;
use crate::node::KindRegistry;
use crate::tree::Tree;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

/// Name of the volume configuration file.
pub const CONFIG_FILE: &str = "config";

/// Name of the operation journal.
pub const JOURNAL_FILE: &str = "journal";

/// A volume directory: configuration, journal and the persisted tree.
#[derive(Debug)]
pub struct Volume {
    root: PathBuf,
    algorithm: Algorithm,
    journal: Journal,
    registry: KindRegistry,
}

impl Volume {
    /// Initialize a new volume at the given path.
    ///
    /// Creates:
    /// - `config` file with version and checksum algorithm
    /// - `journal` file for operation tracking
    /// - `Metadata.json` holding an empty root node tagged `root_tag`
    pub fn init<P: AsRef<Path>>(root: P, root_tag: &str) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;

        let config_path = root.join(CONFIG_FILE);
        if config_path.exists() {
            return Err(Error::invalid_volume(&root, "volume already initialized"));
        }

        let algorithm = Algorithm::Blake3;
        let config_content = format!("version=1\nalgo={}\n", algorithm.as_str());
        fs::write(&config_path, config_content)?;

        let journal = Journal::open(root.join(JOURNAL_FILE))?;

        let mut tree = Tree::new(&root, root_tag);
        let tree_root = tree.root();
        tree.save(tree_root, true)?;

        info!(root = %root.display(), root_tag, "initialized volume");
        Ok(Self {
            root,
            algorithm,
            journal,
            registry: KindRegistry::default(),
        })
    }

    /// Open an existing volume at the given path.
    ///
    /// Validates the layout and reads the configuration.
    pub fn open<P: AsRef<Path>>(root: P) -> Result<Self> {
        let root = root.as_ref().to_path_buf();

        if !root.is_dir() {
            return Err(Error::invalid_volume(&root, "directory does not exist"));
        }

        let config_path = root.join(CONFIG_FILE);
        if !config_path.exists() {
            return Err(Error::invalid_volume(&root, "config file not found"));
        }

        let config_content = fs::read_to_string(&config_path)?;
        let algorithm = Self::parse_config(&root, &config_content)?;

        // Open journal (creates if doesn't exist)
        let journal = Journal::open(root.join(JOURNAL_FILE))?;

        Ok(Self {
            root,
            algorithm,
            journal,
            registry: KindRegistry::default(),
        })
    }

    /// Parse the config file to extract the algorithm.
    fn parse_config(root: &Path, content: &str) -> Result<Algorithm> {
        let mut version = None;
        let mut algo = None;

        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            if let Some((key, value)) = line.split_once('=') {
                match key.trim() {
                    "version" => version = Some(value.trim()),
                    "algo" => algo = Some(value.trim()),
                    _ => {}
                }
            }
        }

        if version != Some("1") {
            return Err(Error::invalid_volume(
                root,
                format!("unsupported config version: {:?}", version),
            ));
        }

        let algo = algo.ok_or_else(|| Error::invalid_volume(root, "missing algo in config"))?;
        Algorithm::parse(algo)
    }

    /// Use `registry` to decide node kinds when loading the tree.
    pub fn with_registry(mut self, registry: KindRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Load the persisted tree, recording cleanups in the volume journal.
    pub fn load_tree(&self) -> Result<Tree> {
        let mut tree = Tree::open(&self.root, self.registry.clone())?;
        tree.set_journal(self.journal.clone());
        Ok(tree)
    }

    /// Get the volume directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Get the checksum algorithm used by this volume.
    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    pub fn journal(&self) -> &Journal {
        &self.journal
    }
}
