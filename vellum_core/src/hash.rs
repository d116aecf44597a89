//! Artifact checksums using BLAKE3.

use crate::error::{Error, Result};
use std::fmt;
use std::io::Read;
use std::path::Path;

/// Digest size in bytes (BLAKE3 produces 256-bit hashes).
pub const CHECKSUM_SIZE: usize = 32;

/// Supported checksum algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Algorithm {
    /// BLAKE3 with 256-bit output.
    Blake3,
}

impl Algorithm {
    /// Returns the string representation of the algorithm (for config files).
    pub fn as_str(&self) -> &'static str {
        match self {
            Algorithm::Blake3 => "blake3-256",
        }
    }

    /// Parse algorithm from string.
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "blake3-256" => Ok(Algorithm::Blake3),
            _ => Err(Error::unsupported_algorithm(s)),
        }
    }
}

/// A 32-byte BLAKE3 digest of an artifact's persisted bytes.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Checksum([u8; CHECKSUM_SIZE]);

impl Checksum {
    /// Convert to hex string (64 characters). This is the attribute form.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Get the raw bytes.
    pub fn as_bytes(&self) -> &[u8; CHECKSUM_SIZE] {
        &self.0
    }

    /// Checksum raw bytes.
    pub fn of_bytes(data: &[u8]) -> Self {
        Checksum(*blake3::hash(data).as_bytes())
    }

    /// Checksum data from a reader.
    pub fn of_reader<R: Read>(mut reader: R) -> Result<Self> {
        let mut hasher = blake3::Hasher::new();
        std::io::copy(&mut reader, &mut hasher)?;
        Ok(Checksum(*hasher.finalize().as_bytes()))
    }

    /// Checksum a file's contents.
    pub fn of_file(path: &Path) -> Result<Self> {
        let file = std::fs::File::open(path)?;
        Self::of_reader(file)
    }

    /// Checksum a file or, for a directory, its canonical listing.
    pub fn of_path(path: &Path) -> Result<Self> {
        let metadata = std::fs::metadata(path)?;
        if metadata.is_dir() {
            crate::walk::checksum_directory(path)
        } else {
            Self::of_file(path)
        }
    }
}

impl fmt::Display for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Checksum({})", self.to_hex())
    }
}
