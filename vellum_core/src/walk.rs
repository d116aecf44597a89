//! Directory walking for directory-backed resource checksums.

use crate::error::{Error, Result};
use crate::hash::Checksum;
use std::path::Path;

/// Entry type in a directory listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EntryType {
    File = 1,
    Directory = 2,
}

/// One entry of a canonical directory listing.
#[derive(Debug, Clone, PartialEq, Eq)]
struct ListingEntry {
    entry_type: EntryType,
    checksum: Checksum,
    name: String,
}

impl ListingEntry {
    /// Encode the entry to bytes.
    ///
    /// Format:
    /// - 1 byte: type (1=file, 2=directory)
    /// - 32 bytes: checksum
    /// - 1 byte: name_len
    /// - N bytes: name (UTF-8)
    fn encode(&self, buf: &mut Vec<u8>) -> Result<()> {
        if self.name.len() > 255 {
            return Err(Error::invalid_checksum(format!(
                "Name too long: {} bytes (max 255)",
                self.name.len()
            )));
        }
        buf.push(self.entry_type as u8);
        buf.extend_from_slice(self.checksum.as_bytes());
        buf.push(self.name.len() as u8);
        buf.extend_from_slice(self.name.as_bytes());
        Ok(())
    }
}

/// Checksum a directory as the digest of its canonical listing.
///
/// Entries are sorted bytewise by name so the result does not depend on
/// the order the filesystem returns them in. Hidden files are included.
pub(crate) fn checksum_directory(path: &Path) -> Result<Checksum> {
    let mut entries = Vec::new();

    let walker = ignore::WalkBuilder::new(path)
        .max_depth(Some(1)) // Only immediate children
        .hidden(false)
        .git_ignore(false)
        .ignore(false)
        .parents(false)
        .build();

    for entry in walker {
        let entry = entry?;
        let entry_path = entry.path();

        // Skip the directory itself
        if entry_path == path {
            continue;
        }

        let name = entry_path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| {
                Error::invalid_checksum(format!("Invalid filename: {}", entry_path.display()))
            })?
            .to_string();

        let metadata = entry_path.metadata()?;
        if metadata.is_dir() {
            entries.push(ListingEntry {
                entry_type: EntryType::Directory,
                checksum: checksum_directory(entry_path)?,
                name,
            });
        } else if metadata.is_file() {
            entries.push(ListingEntry {
                entry_type: EntryType::File,
                checksum: Checksum::of_file(entry_path)?,
                name,
            });
        }
    }

    entries.sort_by(|a, b| a.name.as_bytes().cmp(b.name.as_bytes()));

    let mut buf = Vec::new();
    for entry in &entries {
        entry.encode(&mut buf)?;
    }
    Ok(Checksum::of_bytes(&buf))
}

/// Total size in bytes of the file or directory at `path`; zero if absent.
pub(crate) fn disk_usage(path: &Path) -> Result<u64> {
    let metadata = match std::fs::symlink_metadata(path) {
        Ok(metadata) => metadata,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e.into()),
    };
    if !metadata.is_dir() {
        return Ok(metadata.len());
    }

    let walker = ignore::WalkBuilder::new(path)
        .hidden(false)
        .git_ignore(false)
        .ignore(false)
        .parents(false)
        .build();

    let mut total = 0;
    for entry in walker {
        let entry = entry?;
        if entry.file_type().is_some_and(|t| t.is_file()) {
            total += entry.metadata()?.len();
        }
    }
    Ok(total)
}
