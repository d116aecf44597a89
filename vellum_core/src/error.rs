//! Error types for vellum_core.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias using vellum_core's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while working with a volume or running a pipeline.
#[derive(Error, Debug)]
pub enum Error {
    /// I/O error occurred during file operations.
    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    /// A persisted document could not be parsed.
    #[error("Invalid document at {path}: {reason}")]
    InvalidDocument { path: PathBuf, reason: String },

    /// Volume directory is invalid or not initialized.
    #[error("Invalid volume at {path}: {reason}")]
    InvalidVolume { path: PathBuf, reason: String },

    /// Invalid checksum format or encoding.
    #[error("Invalid checksum: {reason}")]
    InvalidChecksum { reason: String },

    /// Unsupported checksum algorithm.
    #[error("Unsupported algorithm: {algorithm}")]
    UnsupportedAlgorithm { algorithm: String },

    /// A tree invariant was broken by the caller.
    #[error("Invariant violation: {reason}")]
    InvariantViolation { reason: String },

    /// A node handle refers to a node that no longer exists.
    #[error("Stale node handle: {reason}")]
    StaleNode { reason: String },

    /// An attribute value could not be parsed as the requested type.
    #[error("Invalid value for attribute {name}: {value:?}")]
    InvalidAttribute { name: String, value: String },

    /// A path query could not be parsed.
    #[error("Invalid query {query:?}: {reason}")]
    InvalidQuery { query: String, reason: String },

    /// Select found no valid node.
    #[error("Select failed: no valid match for {query:?}")]
    SelectFailed { query: String },

    /// RequireMatch could not read the attribute it tests.
    #[error("RequireMatch failed: attribute {attribute} missing on {tag}")]
    RequireMatchFailed { attribute: String, tag: String },

    /// RequireMatch pattern did not match the attribute value.
    #[error("RequireMatch failed: {value:?} does not match {pattern:?}")]
    RegexSearchFailed { pattern: String, value: String },

    /// Iterate completed zero iterations successfully.
    #[error("Iterate failed: no successful iteration over {query:?}")]
    SearchFailed { query: String },

    /// A `#Name` reference could not be resolved in the current scope.
    #[error("Unresolved variable #{name} in {text:?}")]
    UnresolvedVariable { name: String, text: String },

    /// A call instruction names an operation that is not registered.
    #[error("Unknown operation: {module}.{function}")]
    UnknownOperation { module: String, function: String },

    /// The requested pipeline does not exist in the description.
    #[error("Pipeline not found: {name}")]
    PipelineNotFound { name: String },

    /// The pipeline description is malformed.
    #[error("Invalid pipeline: {reason}")]
    InvalidPipeline { reason: String },

    /// A RequireMatch pattern is not a valid regular expression.
    #[error("Invalid pattern: {source}")]
    InvalidPattern {
        #[from]
        source: regex::Error,
    },

    /// An operation reported a failure of its own.
    #[error("Operation {module}.{function} failed: {source}")]
    Operation {
        module: String,
        function: String,
        #[source]
        source: Box<Error>,
    },

    /// An operation-specific failure with a free-form message.
    #[error("{message}")]
    Failed { message: String },

    /// JSON encoding or decoding error.
    #[error("JSON error: {source}")]
    Json {
        #[from]
        source: serde_json::Error,
    },
}

impl Error {
    /// Create an InvalidDocument error.
    pub fn invalid_document(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Error::InvalidDocument {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Create an InvalidVolume error.
    pub fn invalid_volume(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Error::InvalidVolume {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Create an InvalidChecksum error.
    pub fn invalid_checksum(reason: impl Into<String>) -> Self {
        Error::InvalidChecksum {
            reason: reason.into(),
        }
    }

    /// Create an UnsupportedAlgorithm error.
    pub fn unsupported_algorithm(algorithm: impl Into<String>) -> Self {
        Error::UnsupportedAlgorithm {
            algorithm: algorithm.into(),
        }
    }

    /// Create an InvariantViolation error.
    pub fn invariant(reason: impl Into<String>) -> Self {
        Error::InvariantViolation {
            reason: reason.into(),
        }
    }

    /// Create a StaleNode error.
    pub fn stale_node(reason: impl Into<String>) -> Self {
        Error::StaleNode {
            reason: reason.into(),
        }
    }

    /// Create an InvalidAttribute error.
    pub fn invalid_attribute(name: impl Into<String>, value: impl Into<String>) -> Self {
        Error::InvalidAttribute {
            name: name.into(),
            value: value.into(),
        }
    }

    /// Create an InvalidQuery error.
    pub fn invalid_query(query: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::InvalidQuery {
            query: query.into(),
            reason: reason.into(),
        }
    }

    /// Create an InvalidPipeline error.
    pub fn invalid_pipeline(reason: impl Into<String>) -> Self {
        Error::InvalidPipeline {
            reason: reason.into(),
        }
    }

    /// Create a free-form operation failure.
    pub fn failed(message: impl Into<String>) -> Self {
        Error::Failed {
            message: message.into(),
        }
    }

    /// Wrap an error raised by the named operation.
    pub fn operation(module: impl Into<String>, function: impl Into<String>, source: Error) -> Self {
        Error::Operation {
            module: module.into(),
            function: function.into(),
            source: Box::new(source),
        }
    }

    /// Local failures end the enclosing Iterate or pipeline body, never the run.
    pub fn is_local(&self) -> bool {
        matches!(
            self,
            Error::SelectFailed { .. }
                | Error::RequireMatchFailed { .. }
                | Error::RegexSearchFailed { .. }
                | Error::SearchFailed { .. }
                | Error::StaleNode { .. }
        )
    }

    /// Configuration errors abort the whole run immediately.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Error::UnresolvedVariable { .. }
                | Error::UnknownOperation { .. }
                | Error::PipelineNotFound { .. }
                | Error::InvalidPipeline { .. }
                | Error::InvalidPattern { .. }
                | Error::InvalidQuery { .. }
        )
    }
}

// Additional From implementations for external error types

impl From<tempfile::PersistError> for Error {
    fn from(err: tempfile::PersistError) -> Self {
        Error::Io { source: err.error }
    }
}

impl From<ignore::Error> for Error {
    fn from(err: ignore::Error) -> Self {
        // ignore::Error can wrap an io::Error or be a path error
        match err.io_error() {
            Some(io_err) => Error::Io {
                source: std::io::Error::new(io_err.kind(), io_err.to_string()),
            },
            None => Error::Io {
                source: std::io::Error::other(err.to_string()),
            },
        }
    }
}
