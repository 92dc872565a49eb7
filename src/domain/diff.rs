use std::sync::LazyLock;

use regex::Regex;
use tracing::{debug, warn};

use super::types::{ChangeKind, ChangeRecord, Hunk, NormalizedDiff};
use crate::error::DriftError;

static HUNK_HEADER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^@@ -(\d+)(?:,(\d+))? \+(\d+)(?:,(\d+))? @@ ?(.*)$")
        .expect("hunk header pattern is valid")
});

/// Upper bounds on how much of a diff is passed downstream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiffLimits {
    pub max_files: usize,
    pub max_changed_lines: usize,
}

impl Default for DiffLimits {
    fn default() -> Self {
        Self {
            max_files: 50,
            max_changed_lines: 4000,
        }
    }
}

/// Split a unified diff into per-file records, ordered by path, then
/// bound it with `limits`.
pub fn normalize(raw: &str, limits: &DiffLimits) -> Result<NormalizedDiff, DriftError> {
    let mut records = parse_records(raw)?;
    records.sort_by(|a, b| a.path.cmp(&b.path));

    debug!(files = records.len(), "diff parsed");

    let diff = truncate(
        NormalizedDiff {
            records,
            truncated: false,
            omitted: Vec::new(),
        },
        limits,
    );

    if diff.truncated {
        warn!(
            kept = diff.records.len(),
            omitted = diff.omitted.len(),
            "diff truncated to fit limits"
        );
    }

    Ok(diff)
}

/// Keep the highest-impact files (by changed lines, ties by path) that fit
/// `limits`. The top file is always kept so the result is never empty.
/// Applying this to its own output changes nothing.
pub fn truncate(diff: NormalizedDiff, limits: &DiffLimits) -> NormalizedDiff {
    let over = diff.records.len() > limits.max_files
        || diff.changed_lines() > limits.max_changed_lines;
    if !over {
        return diff;
    }

    let mut ranked = diff.records;
    ranked.sort_by(|a, b| {
        b.line_delta()
            .cmp(&a.line_delta())
            .then_with(|| a.path.cmp(&b.path))
    });

    let mut kept: Vec<ChangeRecord> = Vec::new();
    let mut omitted = diff.omitted;
    let mut used = 0usize;

    for record in ranked {
        let delta = record.line_delta();
        let fits = kept.len() < limits.max_files
            && (kept.is_empty() || used + delta <= limits.max_changed_lines);
        if fits {
            used += delta;
            kept.push(record);
        } else {
            omitted.push(record.path);
        }
    }

    kept.sort_by(|a, b| a.path.cmp(&b.path));
    omitted.sort();
    omitted.dedup();

    NormalizedDiff {
        records: kept,
        truncated: true,
        omitted,
    }
}

fn parse_records(raw: &str) -> Result<Vec<ChangeRecord>, DriftError> {
    if raw.trim().is_empty() {
        return Err(DriftError::MalformedDiff("diff is empty".to_string()));
    }

    let lines: Vec<&str> = raw.lines().collect();
    let mut records = Vec::new();
    let mut pos = 0;

    while pos < lines.len() {
        let starts_section = lines[pos].starts_with("diff --git ")
            || (lines[pos].starts_with("--- ")
                && lines.get(pos + 1).is_some_and(|next| next.starts_with("+++ ")));

        if starts_section {
            let (record, next) = parse_section(&lines, pos)?;
            records.push(record);
            pos = next;
        } else {
            // Commit headers, index lines without a section, trailing noise
            pos += 1;
        }
    }

    if records.is_empty() {
        return Err(DriftError::MalformedDiff(
            "no file sections found".to_string(),
        ));
    }
    Ok(records)
}

#[derive(Default)]
struct Section {
    git_old: Option<String>,
    git_new: Option<String>,
    minus_path: Option<Option<String>>,
    plus_path: Option<Option<String>>,
    rename_from: Option<String>,
    rename_to: Option<String>,
    new_file: bool,
    deleted_file: bool,
    binary: bool,
}

fn parse_section(lines: &[&str], start: usize) -> Result<(ChangeRecord, usize), DriftError> {
    let mut section = Section::default();
    let mut pos = start;

    if let Some(paths) = lines[pos].strip_prefix("diff --git ") {
        if let Some((old, new)) = split_git_paths(paths) {
            section.git_old = Some(old);
            section.git_new = Some(new);
        }
        pos += 1;

        while pos < lines.len() {
            let line = lines[pos];
            if line.starts_with("diff --git ") || line.starts_with("--- ") || line.starts_with("@@") {
                break;
            }
            if line.starts_with("new file mode") {
                section.new_file = true;
            } else if line.starts_with("deleted file mode") {
                section.deleted_file = true;
            } else if let Some(from) = line.strip_prefix("rename from ") {
                section.rename_from = Some(from.to_string());
            } else if let Some(to) = line.strip_prefix("rename to ") {
                section.rename_to = Some(to.to_string());
            } else if line.starts_with("Binary files ") || line.starts_with("GIT binary patch") {
                section.binary = true;
            }
            pos += 1;
        }
    }

    if pos < lines.len() && lines[pos].starts_with("--- ") {
        section.minus_path = Some(side_path(&lines[pos][4..]));
        pos += 1;
        match lines.get(pos).and_then(|l| l.strip_prefix("+++ ")) {
            Some(rest) => section.plus_path = Some(side_path(rest)),
            None => {
                return Err(DriftError::MalformedDiff(format!(
                    "expected '+++' after line {}",
                    pos
                )));
            }
        }
        pos += 1;
    }

    let path = section
        .rename_to
        .clone()
        .or_else(|| section.plus_path.clone().flatten())
        .or_else(|| section.git_new.clone())
        .or_else(|| section.minus_path.clone().flatten())
        .ok_or_else(|| {
            DriftError::MalformedDiff(format!("section at line {} has no file path", start + 1))
        })?;

    let mut hunks = Vec::new();
    while pos < lines.len() && lines[pos].starts_with("@@") {
        let (hunk, next) = parse_hunk(lines, pos, &path)?;
        hunks.push(hunk);
        pos = next;
    }

    let kind = if section.deleted_file || section.plus_path == Some(None) {
        ChangeKind::Deleted
    } else if section.new_file || section.minus_path == Some(None) {
        ChangeKind::Added
    } else if section.rename_from.is_some()
        || matches!((&section.git_old, &section.git_new), (Some(o), Some(n)) if o != n)
    {
        ChangeKind::Renamed
    } else {
        ChangeKind::Modified
    };

    let old_path = match kind {
        ChangeKind::Renamed => section.rename_from.or(section.git_old),
        _ => None,
    };

    Ok((
        ChangeRecord {
            path,
            old_path,
            kind,
            hunks,
            binary: section.binary,
        },
        pos,
    ))
}

fn parse_hunk(lines: &[&str], start: usize, path: &str) -> Result<(Hunk, usize), DriftError> {
    let caps = HUNK_HEADER.captures(lines[start]).ok_or_else(|| {
        DriftError::MalformedDiff(format!("bad hunk header in {}: {}", path, lines[start]))
    })?;
    let number = |i: usize, default: u32| -> u32 {
        caps.get(i)
            .and_then(|m| m.as_str().parse().ok())
            .unwrap_or(default)
    };
    let old_start = number(1, 0);
    let old_lines = number(2, 1);
    let new_start = number(3, 0);
    let new_lines = number(4, 1);
    let section = caps.get(5).map(|m| m.as_str().to_string()).unwrap_or_default();

    let mut old_left = old_lines;
    let mut new_left = new_lines;
    let mut body = Vec::new();
    let mut pos = start + 1;

    while pos < lines.len() && (old_left > 0 || new_left > 0) {
        let line = lines[pos];
        match line.chars().next() {
            Some('+') => new_left = new_left.saturating_sub(1),
            Some('-') => old_left = old_left.saturating_sub(1),
            Some(' ') | None => {
                old_left = old_left.saturating_sub(1);
                new_left = new_left.saturating_sub(1);
            }
            Some('\\') => {}
            _ => break,
        }
        body.push(line.to_string());
        pos += 1;
    }

    while pos < lines.len() && lines[pos].starts_with('\\') {
        body.push(lines[pos].to_string());
        pos += 1;
    }

    Ok((
        Hunk {
            old_start,
            old_lines,
            new_start,
            new_lines,
            section,
            lines: body,
        },
        pos,
    ))
}

/// `a/foo b/bar` -> (`foo`, `bar`)
fn split_git_paths(paths: &str) -> Option<(String, String)> {
    let rest = paths.strip_prefix("a/")?;
    let (old, new) = rest.rsplit_once(" b/")?;
    Some((old.to_string(), new.to_string()))
}

/// Path from a `---`/`+++` line; `None` for `/dev/null`.
fn side_path(raw: &str) -> Option<String> {
    let raw = raw.split('\t').next().unwrap_or(raw).trim();
    if raw == "/dev/null" {
        return None;
    }
    let stripped = raw
        .strip_prefix("a/")
        .or_else(|| raw.strip_prefix("b/"))
        .unwrap_or(raw);
    Some(stripped.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Render records back into unified diff text.
    fn to_patch(diff: &NormalizedDiff) -> String {
        let mut out = String::new();
        for record in &diff.records {
            let old = record.old_path.as_deref().unwrap_or(&record.path);
            out.push_str(&format!("diff --git a/{} b/{}\n", old, record.path));
            match record.kind {
                ChangeKind::Added => out.push_str("new file mode 100644\n"),
                ChangeKind::Deleted => out.push_str("deleted file mode 100644\n"),
                ChangeKind::Renamed => {
                    out.push_str(&format!("rename from {}\nrename to {}\n", old, record.path));
                }
                ChangeKind::Modified => {}
            }

            let old_side = match record.kind {
                ChangeKind::Added => "/dev/null".to_string(),
                _ => format!("a/{}", old),
            };
            let new_side = match record.kind {
                ChangeKind::Deleted => "/dev/null".to_string(),
                _ => format!("b/{}", record.path),
            };

            if record.binary {
                out.push_str(&format!("Binary files {} and {} differ\n", old_side, new_side));
                continue;
            }
            if record.hunks.is_empty() {
                continue;
            }

            out.push_str(&format!("--- {}\n+++ {}\n", old_side, new_side));
            for hunk in &record.hunks {
                out.push_str(&hunk.header());
                out.push('\n');
                for line in &hunk.lines {
                    out.push_str(line);
                    out.push('\n');
                }
            }
        }
        out
    }

    const SAMPLE: &str = "\
diff --git a/payments/service.py b/payments/service.py
index 1111111..2222222 100644
--- a/payments/service.py
+++ b/payments/service.py
@@ -10,2 +10,4 @@ class PaymentService:
     def charge(self):
-        return gateway.charge()
+        return self.gateway.charge()
+
+    def refund(self): ...
diff --git a/payments/refund.py b/payments/refund.py
new file mode 100644
--- /dev/null
+++ b/payments/refund.py
@@ -0,0 +1,2 @@
+class RefundGateway:
+    pass
diff --git a/legacy/old.py b/legacy/old.py
deleted file mode 100644
--- a/legacy/old.py
+++ /dev/null
@@ -1 +0,0 @@
-print('bye')
diff --git a/docs/a.md b/docs/b.md
similarity index 100%
rename from docs/a.md
rename to docs/b.md
diff --git a/assets/logo.png b/assets/logo.png
Binary files a/assets/logo.png and b/assets/logo.png differ
";

    fn limits(max_files: usize, max_changed_lines: usize) -> DiffLimits {
        DiffLimits {
            max_files,
            max_changed_lines,
        }
    }

    #[test]
    fn parses_every_change_kind_ordered_by_path() {
        let diff = normalize(SAMPLE, &DiffLimits::default()).unwrap();
        let paths: Vec<_> = diff.records.iter().map(|r| r.path.as_str()).collect();
        assert_eq!(
            paths,
            [
                "assets/logo.png",
                "docs/b.md",
                "legacy/old.py",
                "payments/refund.py",
                "payments/service.py"
            ]
        );

        let kinds: Vec<_> = diff.records.iter().map(|r| r.kind).collect();
        assert_eq!(
            kinds,
            [
                ChangeKind::Modified,
                ChangeKind::Renamed,
                ChangeKind::Deleted,
                ChangeKind::Added,
                ChangeKind::Modified
            ]
        );
        assert_eq!(diff.records[1].old_path.as_deref(), Some("docs/a.md"));
        assert!(!diff.truncated);
    }

    #[test]
    fn binary_files_are_kept_with_no_hunks() {
        let diff = normalize(SAMPLE, &DiffLimits::default()).unwrap();
        let logo = &diff.records[0];
        assert!(logo.binary);
        assert!(logo.hunks.is_empty());
    }

    #[test]
    fn hunk_ranges_and_counts() {
        let diff = normalize(SAMPLE, &DiffLimits::default()).unwrap();
        let service = diff.records.iter().find(|r| r.path == "payments/service.py").unwrap();
        assert_eq!(service.hunks.len(), 1);
        let hunk = &service.hunks[0];
        assert_eq!((hunk.old_start, hunk.old_lines, hunk.new_start, hunk.new_lines), (10, 2, 10, 4));
        assert_eq!(hunk.section, "class PaymentService:");
        assert_eq!(service.additions(), 3);
        assert_eq!(service.deletions(), 1);
    }

    #[test]
    fn content_lines_that_look_like_headers_stay_in_the_hunk() {
        let raw = "\
--- a/notes.txt
+++ b/notes.txt
@@ -1,2 +1,2 @@
--- old separator
+++ new separator
 trailing
";
        let diff = normalize(raw, &DiffLimits::default()).unwrap();
        assert_eq!(diff.records.len(), 1);
        assert_eq!(diff.records[0].path, "notes.txt");
        assert_eq!(diff.records[0].hunks[0].lines.len(), 3);
    }

    #[test]
    fn rejects_text_without_file_sections() {
        let err = normalize("just some prose\nwith no diff", &DiffLimits::default()).unwrap_err();
        assert!(matches!(err, DriftError::MalformedDiff(_)));
        assert!(matches!(
            normalize("   \n", &DiffLimits::default()),
            Err(DriftError::MalformedDiff(_))
        ));
    }

    #[test]
    fn rejects_garbled_hunk_header() {
        let raw = "--- a/x.py\n+++ b/x.py\n@@ nonsense @@\n+x\n";
        assert!(matches!(
            normalize(raw, &DiffLimits::default()),
            Err(DriftError::MalformedDiff(_))
        ));
    }

    #[test]
    fn truncation_keeps_largest_files() {
        let diff = normalize(SAMPLE, &limits(2, 1000)).unwrap();
        assert!(diff.truncated);
        let paths: Vec<_> = diff.records.iter().map(|r| r.path.as_str()).collect();
        assert_eq!(paths, ["payments/refund.py", "payments/service.py"]);
        assert_eq!(
            diff.omitted,
            ["assets/logo.png", "docs/b.md", "legacy/old.py"]
        );
    }

    #[test]
    fn truncation_is_a_fixed_point() {
        let tight = limits(2, 3);
        let once = normalize(SAMPLE, &tight).unwrap();
        let twice = truncate(once.clone(), &tight);
        assert_eq!(once, twice);

        let reparsed = normalize(&to_patch(&once), &tight).unwrap();
        assert_eq!(reparsed.records, once.records);
    }

    #[test]
    fn patch_rendering_round_trips_records() {
        let diff = normalize(SAMPLE, &DiffLimits::default()).unwrap();
        let reparsed = normalize(&to_patch(&diff), &DiffLimits::default()).unwrap();
        assert_eq!(reparsed.records, diff.records);
    }
}
