use std::fmt;

use serde::{Deserialize, Serialize};

/// How a file changed in the diff
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Added,
    Modified,
    Deleted,
    Renamed,
}

impl ChangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeKind::Added => "added",
            ChangeKind::Modified => "modified",
            ChangeKind::Deleted => "deleted",
            ChangeKind::Renamed => "renamed",
        }
    }
}

/// A contiguous block of changed lines
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hunk {
    pub old_start: u32,
    pub old_lines: u32,
    pub new_start: u32,
    pub new_lines: u32,
    /// Trailing text after the second `@@`, usually the enclosing function
    pub section: String,
    /// Body lines with their ` `, `+`, `-` prefixes
    pub lines: Vec<String>,
}

impl Hunk {
    pub fn header(&self) -> String {
        let mut header = format!(
            "@@ -{},{} +{},{} @@",
            self.old_start, self.old_lines, self.new_start, self.new_lines
        );
        if !self.section.is_empty() {
            header.push(' ');
            header.push_str(&self.section);
        }
        header
    }

    pub fn additions(&self) -> usize {
        self.lines.iter().filter(|l| l.starts_with('+')).count()
    }

    pub fn deletions(&self) -> usize {
        self.lines.iter().filter(|l| l.starts_with('-')).count()
    }
}

/// One file's worth of changes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeRecord {
    pub path: String,
    /// Previous path for renames
    pub old_path: Option<String>,
    pub kind: ChangeKind,
    pub hunks: Vec<Hunk>,
    pub binary: bool,
}

impl ChangeRecord {
    pub fn additions(&self) -> usize {
        self.hunks.iter().map(Hunk::additions).sum()
    }

    pub fn deletions(&self) -> usize {
        self.hunks.iter().map(Hunk::deletions).sum()
    }

    /// Changed lines in both directions; the truncation impact measure.
    pub fn line_delta(&self) -> usize {
        self.additions() + self.deletions()
    }
}

/// Output of the diff normalizer: records ordered by path
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct NormalizedDiff {
    pub records: Vec<ChangeRecord>,
    pub truncated: bool,
    /// Paths dropped by truncation, ordered by path
    pub omitted: Vec<String>,
}

impl NormalizedDiff {
    pub fn changed_lines(&self) -> usize {
        self.records.iter().map(ChangeRecord::line_delta).sum()
    }
}

/// Where a piece of business context came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Origin {
    InlineConfig,
    Description,
    Environment,
    Ticket,
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Origin::InlineConfig => "inline config",
            Origin::Description => "description",
            Origin::Environment => "environment",
            Origin::Ticket => "ticket",
        };
        f.write_str(label)
    }
}

/// What a present context source carries
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceContent {
    Text(String),
    /// The source exists but could not be read; the reason is reported
    Unavailable(String),
}

/// One context source handed to the resolver. Sources that do not exist
/// for a run are simply not in the list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextSource {
    pub origin: Origin,
    pub content: SourceContent,
}

impl ContextSource {
    pub fn new(origin: Origin, text: impl Into<String>) -> Self {
        Self {
            origin,
            content: SourceContent::Text(text.into()),
        }
    }

    pub fn unavailable(origin: Origin, reason: impl Into<String>) -> Self {
        Self {
            origin,
            content: SourceContent::Unavailable(reason.into()),
        }
    }
}

/// Context that at least one source contributed
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProvidedContext {
    pub business_summary: String,
    pub technical_constraints: String,
    pub references: Vec<String>,
    /// Contributing sources, in priority order
    pub trail: Vec<Origin>,
}

/// The single context value of a run. Never absent: no input is `NoContext`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum ResolvedContext {
    Provided(ProvidedContext),
    NoContext,
}

impl ResolvedContext {
    pub const NO_CONTEXT_TEXT: &'static str = "No context provided.";

    pub fn business_summary(&self) -> &str {
        match self {
            ResolvedContext::Provided(c) => &c.business_summary,
            ResolvedContext::NoContext => Self::NO_CONTEXT_TEXT,
        }
    }

    pub fn technical_constraints(&self) -> &str {
        match self {
            ResolvedContext::Provided(c) => &c.technical_constraints,
            ResolvedContext::NoContext => Self::NO_CONTEXT_TEXT,
        }
    }

    pub fn trail(&self) -> &[Origin] {
        match self {
            ResolvedContext::Provided(c) => &c.trail,
            ResolvedContext::NoContext => &[],
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, ResolvedContext::NoContext)
    }
}

/// The exact text sent to the backend for one attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnalysisRequest {
    pub template_id: &'static str,
    pub template_version: u32,
    pub system: String,
    pub serialized_diff: String,
    pub serialized_context: String,
    /// Previous response and correction note when re-asking
    pub prior_turn: Option<String>,
    pub diff_truncated: bool,
    pub context_truncated: bool,
}

impl AnalysisRequest {
    /// The user-turn payload: context, then diff, then any prior turn.
    pub fn body(&self) -> String {
        let mut body = String::with_capacity(
            self.serialized_context.len() + self.serialized_diff.len() + 64,
        );
        body.push_str(&self.serialized_context);
        body.push_str("\n\n");
        body.push_str(&self.serialized_diff);
        if let Some(prior) = &self.prior_turn {
            body.push_str("\n\n");
            body.push_str(prior);
        }
        body
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    #[default]
    Info,
    Warning,
    Risk,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Risk => "risk",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Finding {
    pub severity: Severity,
    pub files: Vec<String>,
    pub message: String,
    pub suggested_fix: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RelationKind {
    BeforeOnly,
    AfterOnly,
    Both,
    Removed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationshipEdge {
    pub source: String,
    pub target: String,
    pub kind: RelationKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AnalysisReport {
    pub summary: String,
    pub findings: Vec<Finding>,
    pub relationships: Vec<RelationshipEdge>,
}

/// A pull or merge request as fetched from the hosting service
#[derive(Debug, Clone, Default)]
pub struct PullRequest {
    pub title: String,
    pub body: String,
    pub head_branch: String,
    pub diff: String,
}
