//! # Vellum Core
//!
//! An incremental pipeline runner over a disk-persisted metadata tree.
//!
//! A volume describes a large dataset as a tree of nodes: plain elements,
//! resources backed by files or directories, and containers that own a
//! sub-tree. Linked containers persist as their own document and are only
//! loaded when a query needs to look inside them. Pipelines select and
//! iterate over nodes with path queries and call operations that produce
//! new artifacts; artifacts record the checksum of their input so stale
//! ones are removed and rebuilt on the next run.
//!
//! ## Features
//!
//! - Arena-backed tree with parent links, change tracking and locks
//! - Lazily loaded linked documents, written atomically
//! - Path queries (`Section/Channel[@Name='Raw8']`, `*`)
//! - Checksum-based staleness detection and cleanup
//! - A small pipeline interpreter with scoped `#Name` variables
//!
//! ## Example
//!
//! ```no_run
//! use vellum_core::{Executor, Interpreter, OperationRegistry, PipelineSet, Volume};
//! use std::collections::BTreeMap;
//! use std::path::Path;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let volume = Volume::open("./my-volume")?;
//! let mut tree = volume.load_tree()?;
//!
//! let pipelines = PipelineSet::load(Path::new("./Pipelines.json"))?;
//! let interpreter = Interpreter::new(OperationRegistry::with_builtins(), Executor::default());
//! let report = interpreter.run(&mut tree, pipelines.select(None)?, &BTreeMap::new())?;
//! println!("{} calls, {} failures", report.calls_succeeded, report.failures.len());
//!
//! // Remove artifacts whose inputs changed
//! let stats = tree.prune(false)?;
//! tree.save(tree.root(), true)?;
//! println!("Removed {} nodes", stats.nodes_removed);
//! # Ok(())
//! # }
//! ```

mod attribute;
mod builtin;
mod document;
mod error;
mod hash;
mod journal;
mod node;
pub mod pipeline;
mod prune;
mod query;
pub mod staleness;
mod tree;
mod volume;
mod walk;

pub use attribute::{
    Attributes, CONTRAST_PRECISION, FloatFamily, FromAttribute, THRESHOLD_PRECISION, ToAttribute,
    format_float, round_str,
};
pub use builtin::{MODULE as BUILTIN_MODULE, OUTPUT_ENV};
pub use document::{DOCUMENT_FILE, DocumentNode};
pub use error::{Error, Result};
pub use hash::{Algorithm, CHECKSUM_SIZE, Checksum};
pub use journal::{Journal, JournalEntry};
pub use node::{
    AttributeBag, DerivedAttributes, KindRegistry, LINK_SUFFIX, Node, NodeId, NodeKind,
    ResourceAttributes, TRANSFORM_TAG, names,
};
pub use pipeline::{
    Changes, Executor, Interpreter, Invocation, OperationRegistry, Pipeline, PipelineSet, RunReport,
};
pub use prune::PruneStats;
pub use query::{FindAll, Predicate, Query, Step};
pub use staleness::{Target, Validity};
pub use tree::{CleanOutcome, Tree};
pub use volume::{CONFIG_FILE, JOURNAL_FILE, Volume};
