use std::io::Write;
use std::sync::Mutex;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::domain::format::COMMENT_MARKER;

/// Where a finished review comment goes.
pub trait CommentSink: Send + Sync {
    fn post(&self, body: &str) -> Result<()>;
}

/// Prints the comment instead of posting it (`--dry-run`, `render`)
pub struct StdoutSink;

impl CommentSink for StdoutSink {
    fn post(&self, body: &str) -> Result<()> {
        let mut stdout = std::io::stdout().lock();
        stdout
            .write_all(body.as_bytes())
            .and_then(|_| stdout.flush())
            .context("Failed to write comment to stdout")
    }
}

/// Keeps posted comments in memory.
#[derive(Default)]
pub struct RecordingSink {
    posted: Mutex<Vec<String>>,
}

impl RecordingSink {
    pub fn posted(&self) -> Vec<String> {
        self.posted.lock().map(|p| p.clone()).unwrap_or_default()
    }
}

impl CommentSink for RecordingSink {
    fn post(&self, body: &str) -> Result<()> {
        self.posted
            .lock()
            .map_err(|_| anyhow::anyhow!("comment recorder poisoned"))?
            .push(body.to_string());
        Ok(())
    }
}

/// A comment already present on the pull or merge request
#[derive(Debug, Clone, Deserialize)]
pub struct ExistingComment {
    pub id: u64,
    #[serde(default)]
    pub body: Option<String>,
}

/// Flatten paginated API output. `--paginate` prints one JSON array per
/// page, back to back.
pub fn parse_comment_pages(raw: &[u8]) -> Result<Vec<ExistingComment>> {
    let mut comments = Vec::new();
    for page in serde_json::Deserializer::from_slice(raw).into_iter::<Vec<ExistingComment>>() {
        comments.extend(page.context("Failed to parse comment list")?);
    }
    Ok(comments)
}

/// Id of the newest comment that begins with our marker line.
///
/// Comments are expected oldest first. A marker quoted inside someone
/// else's comment does not count.
pub fn latest_marked_comment(comments: &[ExistingComment]) -> Option<u64> {
    comments
        .iter()
        .rev()
        .find(|c| {
            c.body
                .as_deref()
                .is_some_and(|body| body.trim_start().starts_with(COMMENT_MARKER))
        })
        .map(|c| c.id)
}
