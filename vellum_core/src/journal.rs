//! Operation journal for pipeline calls and cleanups.

use crate::error::{Error, Result};
use serde::Serialize;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

/// A journal entry recording one event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JournalEntry {
    /// Unix timestamp when the event occurred.
    pub timestamp: i64,
    /// Event type (`call` or `clean`).
    pub operation: String,
    /// Outcome (`ok`, `failed` or `refused`).
    pub status: String,
    /// Full path of the node the event concerned.
    pub path: String,
    /// Free-form detail (operation name, cleanup reason, error).
    pub detail: String,
}

impl JournalEntry {
    /// Create a new journal entry stamped with the current time.
    pub fn now(
        operation: impl Into<String>,
        status: impl Into<String>,
        path: impl Into<String>,
        detail: impl Into<String>,
    ) -> Self {
        Self {
            timestamp: chrono::Utc::now().timestamp(),
            operation: operation.into(),
            status: status.into(),
            path: path.into(),
            detail: detail.into(),
        }
    }

    /// Serialize the entry to a pipe-delimited line.
    pub fn to_line(&self) -> String {
        format!(
            "{}|{}|{}|{}|{}",
            self.timestamp,
            field(&self.operation),
            field(&self.status),
            field(&self.path),
            self.detail.replace(['\n', '\r'], " ")
        )
    }

    /// Parse a journal entry from a pipe-delimited line.
    ///
    /// The detail field is last and may itself contain pipes.
    pub fn from_line(line: &str) -> Result<Self> {
        let parts: Vec<&str> = line.splitn(5, '|').collect();
        if parts.len() != 5 {
            return Err(Error::failed(format!(
                "Invalid journal entry format: expected 5 fields, got {}",
                parts.len()
            )));
        }

        let timestamp = parts[0].parse::<i64>().map_err(|_| {
            Error::failed(format!("Invalid timestamp in journal entry: {}", parts[0]))
        })?;

        Ok(Self {
            timestamp,
            operation: parts[1].to_string(),
            status: parts[2].to_string(),
            path: parts[3].to_string(),
            detail: parts[4].to_string(),
        })
    }
}

fn field(value: &str) -> String {
    value.replace(['|', '\n', '\r'], " ")
}

/// Append-only journal file.
#[derive(Debug, Clone)]
pub struct Journal {
    path: PathBuf,
}

impl Journal {
    /// Open or create a journal at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        if !path.exists() {
            File::create(&path)?;
        }

        Ok(Self { path })
    }

    /// Append an entry to the journal.
    pub fn append(&self, entry: &JournalEntry) -> Result<()> {
        let mut file = OpenOptions::new().append(true).open(&self.path)?;
        writeln!(file, "{}", entry.to_line())?;
        file.flush()?;
        Ok(())
    }

    /// Append an entry, logging instead of failing if the write fails.
    pub(crate) fn record(&self, entry: JournalEntry) {
        if let Err(e) = self.append(&entry) {
            tracing::warn!(journal = %self.path.display(), error = %e, "failed to append journal entry");
        }
    }

    /// Read the most recent N entries from the journal.
    pub fn read_recent(&self, count: usize) -> Result<Vec<JournalEntry>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }

        let file = File::open(&self.path)?;
        let reader = BufReader::new(file);

        let mut entries = Vec::new();
        for line in reader.lines() {
            let line = line?;
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            if let Ok(entry) = JournalEntry::from_line(line) {
                entries.push(entry);
            }
        }

        if count >= entries.len() {
            Ok(entries)
        } else {
            Ok(entries[entries.len() - count..].to_vec())
        }
    }
}
