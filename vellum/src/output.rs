//! Output formatting for CLI commands.
//!
//! Every command produces a serializable result; `--json` prints it as
//! JSON, otherwise a human-readable rendering is printed.

use anyhow::Result;
use serde::Serialize;
use std::io::{self, Write};
use vellum_core::{JournalEntry, PruneStats, RunReport};

/// Output format selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Text,
    Json,
}

/// Writer for command output with format abstraction.
pub struct OutputWriter {
    format: OutputFormat,
    stdout: io::Stdout,
}

impl OutputWriter {
    pub fn new(json: bool) -> Self {
        Self {
            format: if json {
                OutputFormat::Json
            } else {
                OutputFormat::Text
            },
            stdout: io::stdout(),
        }
    }

    /// Write `data` as JSON, or the text produced by `text_fn`.
    pub fn write<T: Serialize>(&self, data: &T, text_fn: impl FnOnce() -> String) -> Result<()> {
        match self.format {
            OutputFormat::Json => {
                let json = serde_json::to_string_pretty(data)?;
                writeln!(&self.stdout, "{}", json)?;
            }
            OutputFormat::Text => {
                let text = text_fn();
                if !text.is_empty() {
                    write!(&self.stdout, "{}", text)?;
                }
            }
        }
        Ok(())
    }

    /// Write an error to stderr.
    pub fn write_error(&self, error: &anyhow::Error, result_code: u8) {
        match self.format {
            OutputFormat::Json => {
                let error_output = ErrorOutput {
                    success: false,
                    result_code,
                    error: format!("{:#}", error),
                };
                if let Ok(json) = serde_json::to_string_pretty(&error_output) {
                    let _ = writeln!(io::stderr(), "{}", json);
                }
            }
            OutputFormat::Text => {
                let _ = writeln!(io::stderr(), "Error: {:#}", error);
            }
        }
    }
}

// ============================================================================
// Data Transfer Objects (DTOs) for JSON output
// ============================================================================

#[derive(Debug, Serialize)]
pub struct ErrorOutput {
    pub success: bool,
    pub result_code: u8,
    pub error: String,
}

/// Output for `init`.
#[derive(Debug, Serialize)]
pub struct InitOutput {
    pub success: bool,
    pub result_code: u8,
    pub root: String,
    pub root_tag: String,
    pub algorithm: String,
}

/// Output for `run`.
#[derive(Debug, Serialize)]
pub struct RunOutput {
    pub success: bool,
    pub result_code: u8,
    pub pipeline: String,
    #[serde(flatten)]
    pub report: RunReport,
}

impl RunOutput {
    pub fn to_text(&self) -> String {
        let report = &self.report;
        let mut text = format!(
            "Pipeline {}: {} calls succeeded, {} failed, {} bodies skipped\n",
            self.pipeline,
            report.calls_succeeded,
            report.failures.len(),
            report.aborted_bodies
        );
        for failure in &report.failures {
            text.push_str(&format!(
                "  failed {} at {}: {}\n",
                failure.instruction, failure.position, failure.error
            ));
        }
        if let Some(reason) = &report.stopped {
            text.push_str(&format!("Stopped early: {}\n", reason));
        }
        text
    }
}

/// A node found by `query`.
#[derive(Debug, Clone, Serialize)]
pub struct QueryMatch {
    pub tag: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub path: String,
}

/// Output for `query`.
#[derive(Debug, Serialize)]
pub struct QueryOutput {
    pub success: bool,
    pub result_code: u8,
    pub query: String,
    pub matches: Vec<QueryMatch>,
}

impl QueryOutput {
    pub fn to_text(&self) -> String {
        if self.matches.is_empty() {
            return format!("No match for {}\n", self.query);
        }
        self.matches
            .iter()
            .map(|m| match &m.name {
                Some(name) => format!("{} {} {}\n", m.tag, name, m.path),
                None => format!("{} {}\n", m.tag, m.path),
            })
            .collect()
    }
}

/// Output for `prune`.
#[derive(Debug, Serialize)]
pub struct PruneOutput {
    pub success: bool,
    pub result_code: u8,
    pub dry_run: bool,
    #[serde(flatten)]
    pub stats: PruneStats,
}

impl PruneOutput {
    pub fn to_text(&self) -> String {
        let stats = &self.stats;
        if self.dry_run {
            format!(
                "Dry run - nothing removed\nWould remove {} nodes\nWould free {} bytes\nLocked: {}\n",
                stats.nodes_removed, stats.bytes_freed, stats.nodes_refused
            )
        } else {
            format!(
                "Removed {} nodes\nFreed {} bytes\nLocked: {}\n",
                stats.nodes_removed, stats.bytes_freed, stats.nodes_refused
            )
        }
    }
}

/// Output for `journal`.
#[derive(Debug, Serialize)]
pub struct JournalOutput {
    pub success: bool,
    pub result_code: u8,
    pub entries: Vec<JournalEntry>,
}

impl JournalOutput {
    pub fn to_text(&self) -> String {
        if self.entries.is_empty() {
            return "Journal is empty\n".to_string();
        }
        self.entries
            .iter()
            .map(|entry| {
                let when = chrono::DateTime::from_timestamp(entry.timestamp, 0)
                    .map(|t| t.to_rfc3339())
                    .unwrap_or_else(|| entry.timestamp.to_string());
                format!(
                    "{} {} {} {} {}\n",
                    when, entry.operation, entry.status, entry.path, entry.detail
                )
            })
            .collect()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ArgumentInfo {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub help: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PipelineInfo {
    pub name: String,
    pub instructions: usize,
    pub arguments: Vec<ArgumentInfo>,
}

/// Output for `pipelines`.
#[derive(Debug, Serialize)]
pub struct PipelinesOutput {
    pub success: bool,
    pub result_code: u8,
    pub pipelines: Vec<PipelineInfo>,
    pub operations: Vec<String>,
}

impl PipelinesOutput {
    pub fn to_text(&self) -> String {
        let mut text = String::new();
        for pipeline in &self.pipelines {
            text.push_str(&format!(
                "{} ({} instructions)\n",
                pipeline.name, pipeline.instructions
            ));
            for argument in &pipeline.arguments {
                text.push_str(&format!("  --arg {}=", argument.name));
                text.push_str(argument.default.as_deref().unwrap_or("<required>"));
                if let Some(help) = &argument.help {
                    text.push_str(&format!("  {}", help));
                }
                text.push('\n');
            }
        }
        text.push_str(&format!("Operations: {}\n", self.operations.join(", ")));
        text
    }
}
