use std::collections::BTreeMap;
use std::fmt::Write;

use super::diagram::{AGGREGATE_NODE, DiagramSpec};
use super::types::{AnalysisReport, Finding, Origin, Severity};
use crate::error::{Degradation, DriftError};
use crate::logging::redact_secrets;

/// First line of every comment we post; used to find our own comments.
pub const COMMENT_MARKER: &str = "<!-- drift:report -->";

const SEVERITY_TABLE: [(Severity, &str, &str); 3] = [
    (Severity::Risk, "🔴", "Risk"),
    (Severity::Warning, "⚠️", "Warning"),
    (Severity::Info, "ℹ️", "Info"),
];

/// Run facts the comment has to be honest about
#[derive(Debug, Clone, Default)]
pub struct ReportMeta {
    pub context_sources: Vec<Origin>,
    pub diff_truncated: bool,
    pub omitted_files: Vec<String>,
    pub context_truncated: bool,
    pub degradations: Vec<Degradation>,
}

fn severity_label(severity: Severity) -> (&'static str, &'static str) {
    SEVERITY_TABLE
        .iter()
        .find(|(s, _, _)| *s == severity)
        .map(|(_, icon, label)| (*icon, *label))
        .unwrap_or(("", "Info"))
}

/// Top-level directory of the first affected file.
pub fn finding_scope(finding: &Finding) -> String {
    match finding.files.first() {
        None => "general".to_string(),
        Some(path) => match path.split_once('/') {
            Some((dir, _)) => dir.to_string(),
            None => "(root)".to_string(),
        },
    }
}

pub fn render(report: &AnalysisReport, diagram: &DiagramSpec, meta: &ReportMeta) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "{}", COMMENT_MARKER);
    out.push_str("## Architectural Impact Review\n");

    let mut notes: Vec<String> = meta
        .degradations
        .iter()
        .map(|d| format!("{}: {}", d.stage, redact_secrets(&d.message)))
        .collect();
    if meta.diff_truncated {
        notes.push(format!(
            "diff: {} lower-impact file(s) were left out of the analysis",
            meta.omitted_files.len()
        ));
    }
    if meta.context_truncated {
        notes.push("context: the business summary was shortened to fit the request".to_string());
    }
    if !notes.is_empty() {
        out.push_str("\n> [!WARNING]\n> This review ran on reduced input:\n");
        for note in &notes {
            let _ = writeln!(out, "> - {}", note);
        }
    }

    let _ = write!(out, "\n### Summary\n\n{}\n", report.summary);

    out.push_str("\n### Findings\n");
    if report.findings.is_empty() {
        out.push_str("\n_No findings._\n");
    } else {
        let mut by_scope: BTreeMap<String, Vec<&Finding>> = BTreeMap::new();
        for finding in &report.findings {
            by_scope.entry(finding_scope(finding)).or_default().push(finding);
        }
        for (scope, mut findings) in by_scope {
            findings.sort_by(|a, b| b.severity.cmp(&a.severity));
            let _ = writeln!(out, "\n#### `{}`\n", scope);
            for finding in findings {
                render_finding(&mut out, finding);
            }
        }
    }

    if !diagram.is_empty() {
        let _ = write!(
            out,
            r#"
### Architecture

<details open>
<summary>Component dependencies before and after this change</summary>

**Before**

```mermaid
{before}```

**After**

```mermaid
{after}```

</details>
"#,
            before = diagram.render_before(),
            after = diagram.render_after(),
        );
        if !diagram.collapsed.is_empty() {
            let _ = writeln!(
                out,
                "\n_{} low-fan-out component(s) grouped as \"{}\": {}_",
                diagram.collapsed.len(),
                AGGREGATE_NODE,
                diagram.collapsed.join(", ")
            );
        }
    }

    let sources = if meta.context_sources.is_empty() {
        "none".to_string()
    } else {
        meta.context_sources
            .iter()
            .map(|o| o.to_string())
            .collect::<Vec<_>>()
            .join(", ")
    };
    let _ = writeln!(
        out,
        "\n---\n<sub>Context sources: {} · Diff truncated: {} · Context truncated: {}</sub>",
        sources,
        yes_no(meta.diff_truncated),
        yes_no(meta.context_truncated)
    );

    out
}

fn render_finding(out: &mut String, finding: &Finding) {
    let (icon, label) = severity_label(finding.severity);
    let _ = writeln!(out, "- {} **{}**: {}", icon, label, finding.message);
    if !finding.files.is_empty() {
        let files: Vec<String> = finding.files.iter().map(|f| format!("`{}`", f)).collect();
        let _ = writeln!(out, "  - Files: {}", files.join(", "));
    }
    if let Some(fix) = &finding.suggested_fix {
        let _ = writeln!(out, "  - Suggested fix: {}", fix);
    }
}

/// Minimal comment for a run that could not produce a report.
pub fn render_failure(error: &DriftError) -> String {
    format!(
        r#"{marker}
## Architectural Impact Review: failed

Drift could not produce a review for this change (`{code}`).

> {message}

No partial analysis was posted. Re-run the job once the cause is fixed.
"#,
        marker = COMMENT_MARKER,
        code = error.code(),
        message = redact_secrets(&error.to_string()),
    )
}

fn yes_no(flag: bool) -> &'static str {
    if flag { "yes" } else { "no" }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::diagram::synthesize;
    use crate::domain::types::{RelationKind, RelationshipEdge};

    fn finding(severity: Severity, files: &[&str], message: &str) -> Finding {
        Finding {
            severity,
            files: files.iter().map(|f| f.to_string()).collect(),
            message: message.to_string(),
            suggested_fix: None,
        }
    }

    #[test]
    fn findings_are_grouped_by_scope_with_fixed_icons() {
        let report = AnalysisReport {
            summary: "Adds refunds.".to_string(),
            findings: vec![
                finding(Severity::Info, &["payments/repository.py"], "New query"),
                finding(Severity::Risk, &["payments/service.py"], "Refund bypasses ledger"),
                finding(Severity::Warning, &["setup.py"], "New dependency"),
                finding(Severity::Info, &[], "Consider an ADR"),
            ],
            relationships: Vec::new(),
        };
        let body = render(&report, &DiagramSpec::default(), &ReportMeta::default());

        assert!(body.starts_with(COMMENT_MARKER));
        let payments = body.find("#### `payments`").unwrap();
        let risk = body.find("🔴 **Risk**: Refund bypasses ledger").unwrap();
        let info = body.find("ℹ️ **Info**: New query").unwrap();
        assert!(payments < risk && risk < info);
        assert!(body.contains("#### `(root)`"));
        assert!(body.contains("#### `general`"));
        assert!(!body.contains("### Architecture"));
        assert!(!body.contains("[!WARNING]"));
    }

    #[test]
    fn degradations_are_disclosed() {
        let meta = ReportMeta {
            context_sources: vec![Origin::Environment],
            diff_truncated: true,
            omitted_files: vec!["a.py".into(), "b.py".into()],
            context_truncated: false,
            degradations: vec![Degradation::new(
                "context",
                "ticket lookup unavailable: token=abc123 rejected",
            )],
        };
        let report = AnalysisReport {
            summary: "s".to_string(),
            ..Default::default()
        };
        let body = render(&report, &DiagramSpec::default(), &meta);
        assert!(body.contains("> [!WARNING]"));
        assert!(body.contains("context: ticket lookup unavailable"));
        assert!(!body.contains("abc123"));
        assert!(body.contains("2 lower-impact file(s)"));
        assert!(body.contains("Context sources: environment"));
    }

    #[test]
    fn diagrams_are_embedded_as_mermaid() {
        let edges = [RelationshipEdge {
            source: "PaymentService".into(),
            target: "RefundGateway".into(),
            kind: RelationKind::AfterOnly,
        }];
        let report = AnalysisReport {
            summary: "s".to_string(),
            findings: Vec::new(),
            relationships: edges.to_vec(),
        };
        let body = render(&report, &synthesize(&edges, 12), &ReportMeta::default());
        assert_eq!(body.matches("```mermaid").count(), 2);
        assert!(body.contains("RefundGateway"));
    }

    #[test]
    fn failure_comment_is_labelled_and_redacted() {
        let body = render_failure(&DriftError::Auth("Authorization: Bearer sk-live".into()));
        assert!(body.contains("failed"));
        assert!(body.contains("`backend-auth`"));
        assert!(!body.contains("sk-live"));
    }
}
