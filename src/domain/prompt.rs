use std::fmt::Write;

use super::types::{AnalysisRequest, ChangeKind, NormalizedDiff, ResolvedContext};

pub const TEMPLATE_ID: &str = "drift-architecture-review";
pub const TEMPLATE_VERSION: u32 = 1;

const TRUNCATION_MARKER: &str = "\n[... business summary truncated ...]";
const PRIOR_RESPONSE_EXCERPT: usize = 2000;

pub fn build_system_prompt() -> String {
    r#"You are a staff software architect reviewing a pull request for its architectural impact. You receive the business context the author supplied and the structured diff. Your task is to explain how the change moves the system's architecture, and what could go wrong.

## Your Goals

1. **Judge the change against its stated intent** - Use the business summary to understand why the change exists, and hold it to the technical constraints. A constraint violation is always a finding.

2. **Think in components, not files** - Name the services, modules, gateways and stores the diff touches, and how their dependencies change.

3. **Surface risks** - Coupling, layering violations, missing error handling at new boundaries, data ownership changes, migrations.

4. **Stay grounded** - Only reference files that appear in the diff. Do not invent components you cannot see evidence for.

## Finding Severity

- **info**: Worth knowing, no action needed.
- **warning**: Should be addressed or explicitly accepted.
- **risk**: Likely to cause incidents, data loss or a constraint violation.

## Relationships

Describe component dependencies as directed edges `source -> target` with a kind:
- **both**: The dependency exists before and after this change.
- **before-only**: The dependency existed before and no longer exists, replaced by something else.
- **after-only**: The dependency is introduced by this change.
- **removed**: The dependency is deleted outright with nothing replacing it.

## Output Format

Return ONLY valid JSON matching this schema exactly:
{
  "summary": "2-3 sentences on the architectural impact of this change",
  "findings": [
    {
      "severity": "info|warning|risk",
      "files": ["paths exactly as they appear in the diff"],
      "message": "What the issue is and why it matters",
      "suggested_fix": "Concrete change to make, or null"
    }
  ],
  "relationships": [
    {
      "source": "ComponentName",
      "target": "ComponentName",
      "kind": "both|before-only|after-only|removed"
    }
  ]
}"#
    .to_string()
}

/// Markdown rendering of the normalized diff, in record order.
pub fn serialize_diff(diff: &NormalizedDiff) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "## Changed files ({})", diff.records.len());

    if diff.truncated {
        let _ = writeln!(
            out,
            "\n_Diff truncated: {} lower-impact file(s) omitted: {}_",
            diff.omitted.len(),
            diff.omitted.join(", ")
        );
    }

    for record in &diff.records {
        let _ = write!(
            out,
            "\n### `{}` ({}, +{} -{})",
            record.path,
            record.kind.as_str(),
            record.additions(),
            record.deletions()
        );
        if let (ChangeKind::Renamed, Some(old)) = (record.kind, &record.old_path) {
            let _ = write!(out, " renamed from `{}`", old);
        }
        out.push('\n');

        if record.binary {
            out.push_str("\n_Binary file, contents not shown._\n");
            continue;
        }
        if record.hunks.is_empty() {
            continue;
        }

        out.push_str("\n```diff\n");
        for hunk in &record.hunks {
            out.push_str(&hunk.header());
            out.push('\n');
            for line in &hunk.lines {
                out.push_str(line);
                out.push('\n');
            }
        }
        out.push_str("```\n");
    }
    out
}

pub fn serialize_context(context: &ResolvedContext, business_summary: &str) -> String {
    let ResolvedContext::Provided(provided) = context else {
        return format!("## Business context\n\n{}\n", ResolvedContext::NO_CONTEXT_TEXT);
    };

    let sources: Vec<String> = provided.trail.iter().map(|o| o.to_string()).collect();
    let mut out = format!(
        r#"## Business context

**Sources:** {sources}

**Business summary:**
{summary}

**Technical constraints:**
{constraints}
"#,
        sources = sources.join(", "),
        summary = business_summary,
        constraints = provided.technical_constraints,
    );

    if !provided.references.is_empty() {
        out.push_str("\n**References:**\n");
        for reference in &provided.references {
            let _ = writeln!(out, "- {}", reference);
        }
    }
    out
}

/// Combine diff and context into the request for one analysis attempt.
///
/// When context plus diff exceed `max_payload_bytes`, the tail of the
/// business summary is cut. Technical constraints are never cut.
pub fn assemble(
    diff: &NormalizedDiff,
    context: &ResolvedContext,
    max_payload_bytes: usize,
) -> AnalysisRequest {
    let serialized_diff = serialize_diff(diff);
    let full_summary = context.business_summary();
    let mut serialized_context = serialize_context(context, full_summary);
    let mut context_truncated = false;

    let payload = serialized_context.len() + 2 + serialized_diff.len();
    if payload > max_payload_bytes && !context.is_empty() {
        let overflow = payload - max_payload_bytes;
        let mut keep = full_summary
            .len()
            .saturating_sub(overflow + TRUNCATION_MARKER.len());
        while !full_summary.is_char_boundary(keep) {
            keep -= 1;
        }
        let shortened = format!("{}{}", full_summary[..keep].trim_end(), TRUNCATION_MARKER);
        serialized_context = serialize_context(context, &shortened);
        context_truncated = true;
    }

    AnalysisRequest {
        template_id: TEMPLATE_ID,
        template_version: TEMPLATE_VERSION,
        system: build_system_prompt(),
        serialized_diff,
        serialized_context,
        prior_turn: None,
        diff_truncated: diff.truncated,
        context_truncated,
    }
}

/// Bytes by which the request still exceeds `max_payload_bytes`.
///
/// Only the business summary is ever cut, so a large diff or long
/// constraints can leave the request over the cap.
pub fn overrun(request: &AnalysisRequest, max_payload_bytes: usize) -> Option<usize> {
    let payload = request.serialized_context.len() + 2 + request.serialized_diff.len();
    payload
        .checked_sub(max_payload_bytes)
        .filter(|&over| over > 0)
}

/// The same request with a note explaining why the previous answer was
/// rejected.
pub fn reformulate(request: &AnalysisRequest, previous_response: &str, problem: &str) -> AnalysisRequest {
    let mut end = previous_response.len().min(PRIOR_RESPONSE_EXCERPT);
    while !previous_response.is_char_boundary(end) {
        end -= 1;
    }

    let prior = format!(
        r#"## Previous answer

Your previous answer could not be used:
{problem}

It began with:
```
{excerpt}
```

Answer again with ONLY the JSON object described in the instructions."#,
        problem = problem,
        excerpt = &previous_response[..end],
    );

    AnalysisRequest {
        prior_turn: Some(prior),
        ..request.clone()
    }
}
