//! Append-only progress notes shared with the agent.
//!
//! The engine appends one entry per iteration; the agent may append its own
//! notes to the same file. The tail of the file is fed back into each story
//! prompt as cumulative progress.

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::Path;

use anyhow::{Context, Result};

use crate::events::StoryOutcome;

/// At most this many trailing bytes are handed to the agent.
pub const PROGRESS_TAIL_BYTES: usize = 16 * 1024;

/// One engine-written entry.
#[derive(Debug, Clone)]
pub struct ProgressEntry<'a> {
    pub iteration: u32,
    pub story_id: &'a str,
    pub title: &'a str,
    pub outcome: &'a StoryOutcome,
    pub retry_count: u32,
    pub retry_limit: u32,
}

impl ProgressEntry<'_> {
    /// Markdown block for this entry, ending in a blank line.
    pub fn render(&self) -> String {
        let outcome = match self.outcome {
            StoryOutcome::Passed => "passed".to_string(),
            StoryOutcome::NotPassing => format!(
                "not passing (attempt {} of {})",
                self.retry_count, self.retry_limit
            ),
            StoryOutcome::InvocationFailed { reason } => format!(
                "agent failed: {reason} (attempt {} of {})",
                self.retry_count, self.retry_limit
            ),
            StoryOutcome::Cancelled => "cancelled".to_string(),
        };
        format!(
            "## Iteration {}: {} ({})\n\n- Outcome: {}\n\n",
            self.iteration, self.story_id, self.title, outcome
        )
    }
}

/// Append pre-rendered text, creating the file (and its directory) if needed.
pub fn append_text(path: &Path, text: &str) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("create directory {}", parent.display()))?;
    }
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("open progress log {}", path.display()))?;
    file.write_all(text.as_bytes())
        .with_context(|| format!("append progress log {}", path.display()))?;
    Ok(())
}

/// Read the last [`PROGRESS_TAIL_BYTES`] of the log, starting at a line boundary.
///
/// Returns `None` when the file does not exist or is blank.
pub fn read_tail(path: &Path) -> Result<Option<String>> {
    let contents = match fs::read(path) {
        Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
        Err(err) => {
            return Err(err).with_context(|| format!("read progress log {}", path.display()));
        }
    };
    if contents.trim().is_empty() {
        return Ok(None);
    }
    Ok(Some(tail(&contents, PROGRESS_TAIL_BYTES).to_string()))
}

fn tail(contents: &str, max_bytes: usize) -> &str {
    if contents.len() <= max_bytes {
        return contents;
    }
    let mut start = contents.len() - max_bytes;
    while !contents.is_char_boundary(start) {
        start += 1;
    }
    let cut = &contents[start..];
    match cut.find('\n') {
        Some(newline) => &cut[newline + 1..],
        None => cut,
    }
}
