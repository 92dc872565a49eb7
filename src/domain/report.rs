//! Decoding model output into an [`AnalysisReport`].
//!
//! Decoders are tried in order; the first one that recognises the text hands
//! a JSON value to a single validation pass. Validation drops findings that
//! point at files outside the diff and rejects reports without a summary or
//! with unnamed relationship endpoints.

use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;
use serde::Deserialize;
use serde_json::{Map, Value, json};
use tracing::{debug, warn};

use super::types::{AnalysisReport, Finding, NormalizedDiff, RelationKind, RelationshipEdge, Severity};
use crate::error::{Degradation, DriftError};

const STAGE: &str = "response";

static SECTION_HEADING: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^\s*(?:#+\s*)?\**(summary|findings|relationships)\**\s*:?\s*\**\s*(.*)$")
        .expect("section heading pattern is valid")
});
static FINDING_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*[-*]\s*\[([A-Za-z]+)\]\s*(.*?):\s+(.+?)(?:\s*\(fix:\s*(.*)\))?\s*$")
        .expect("finding line pattern is valid")
});
static EDGE_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*[-*]\s*(.*?)\s*->\s*(.*?)\s*(?:\(([^)]*)\))?\s*$")
        .expect("edge line pattern is valid")
});

/// A validated report plus what was discarded on the way
#[derive(Debug, Clone)]
pub struct ParsedReport {
    pub report: AnalysisReport,
    pub dropped: Vec<Degradation>,
    pub decoder: &'static str,
}

trait ReportDecoder {
    fn name(&self) -> &'static str;
    fn decode(&self, raw: &str) -> Option<Value>;
}

/// The whole response is the JSON object.
struct StrictJson;

impl ReportDecoder for StrictJson {
    fn name(&self) -> &'static str {
        "strict-json"
    }

    fn decode(&self, raw: &str) -> Option<Value> {
        serde_json::from_str::<Value>(raw.trim())
            .ok()
            .filter(Value::is_object)
    }
}

/// A JSON object somewhere inside prose, fenced or not.
struct EmbeddedJson;

impl ReportDecoder for EmbeddedJson {
    fn name(&self) -> &'static str {
        "embedded-json"
    }

    fn decode(&self, raw: &str) -> Option<Value> {
        let fenced = raw.find("```json").and_then(|start| {
            let body = &raw[start + "```json".len()..];
            body.find("```").map(|end| &body[..end])
        });
        fenced
            .and_then(|body| {
                serde_json::from_str::<Value>(body.trim())
                    .ok()
                    .filter(Value::is_object)
            })
            .or_else(|| first_object(raw))
    }
}

/// The first JSON object that starts at some `{` in `raw`. Objects with a
/// summary key win over ones without, so braces in the surrounding prose
/// are skipped.
fn first_object(raw: &str) -> Option<Value> {
    let mut fallback = None;
    for (start, _) in raw.match_indices('{') {
        let mut stream = serde_json::Deserializer::from_str(&raw[start..]).into_iter::<Value>();
        let Some(Ok(value)) = stream.next() else {
            continue;
        };
        let Some(object) = value.as_object() else {
            continue;
        };
        if object.keys().any(|k| canonical(k) == "summary") {
            return Some(value);
        }
        if fallback.is_none() {
            fallback = Some(value);
        }
    }
    fallback
}

/// Plain-text sections: `Summary:`, `Findings:`, `Relationships:`.
struct SectionMarkers;

impl ReportDecoder for SectionMarkers {
    fn name(&self) -> &'static str {
        "section-markers"
    }

    fn decode(&self, raw: &str) -> Option<Value> {
        let mut current: Option<String> = None;
        let mut summary: Vec<String> = Vec::new();
        let mut findings: Vec<Value> = Vec::new();
        let mut relationships: Vec<Value> = Vec::new();
        let mut saw_summary = false;

        for line in raw.lines() {
            if let Some(caps) = SECTION_HEADING.captures(line) {
                let section = caps[1].to_ascii_lowercase();
                let rest = caps[2].trim();
                if section == "summary" {
                    saw_summary = true;
                    if !rest.is_empty() {
                        summary.push(rest.to_string());
                    }
                }
                current = Some(section);
                continue;
            }

            match current.as_deref() {
                Some("summary") => {
                    if !line.trim().is_empty() {
                        summary.push(line.trim().to_string());
                    }
                }
                Some("findings") => {
                    if let Some(caps) = FINDING_LINE.captures(line) {
                        let files: Vec<&str> = caps[2]
                            .split(',')
                            .map(str::trim)
                            .filter(|f| !f.is_empty())
                            .collect();
                        findings.push(json!({
                            "severity": &caps[1],
                            "files": files,
                            "message": &caps[3],
                            "suggested_fix": caps.get(4).map(|m| m.as_str()),
                        }));
                    }
                }
                Some("relationships") => {
                    if let Some(caps) = EDGE_LINE.captures(line) {
                        relationships.push(json!({
                            "source": &caps[1],
                            "target": &caps[2],
                            "kind": caps.get(3).map(|m| m.as_str()),
                        }));
                    }
                }
                _ => {}
            }
        }

        saw_summary.then(|| {
            json!({
                "summary": summary.join(" "),
                "findings": findings,
                "relationships": relationships,
            })
        })
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum OneOrMany {
    One(String),
    Many(Vec<String>),
}

#[derive(Debug, Deserialize)]
struct RawReport {
    summary: Option<String>,
    #[serde(default)]
    findings: Vec<RawFinding>,
    #[serde(default, alias = "edges")]
    relationships: Vec<RawEdge>,
}

// Keys arrive canonicalised: lowercase, no separators.
#[derive(Debug, Deserialize)]
struct RawFinding {
    #[serde(default)]
    severity: Option<Value>,
    #[serde(alias = "file")]
    files: Option<OneOrMany>,
    #[serde(alias = "description")]
    message: Option<String>,
    #[serde(rename = "suggestedfix", alias = "fix", alias = "suggestion")]
    suggested_fix: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawEdge {
    #[serde(alias = "from")]
    source: Option<String>,
    #[serde(alias = "to")]
    target: Option<String>,
    #[serde(default, alias = "relation", alias = "type")]
    kind: Option<Value>,
}

/// Decode and validate a model response against the diff it describes.
pub fn parse_report(raw: &str, diff: &NormalizedDiff) -> Result<ParsedReport, DriftError> {
    let decoders: [&dyn ReportDecoder; 3] = [&StrictJson, &EmbeddedJson, &SectionMarkers];

    for decoder in decoders {
        if let Some(value) = decoder.decode(raw) {
            debug!(decoder = decoder.name(), "response decoded");
            return validate(canonical_keys(value), diff, decoder.name());
        }
    }

    Err(DriftError::ReportParse(
        "response contains neither a JSON report nor known section markers".to_string(),
    ))
}

fn validate(value: Value, diff: &NormalizedDiff, decoder: &'static str) -> Result<ParsedReport, DriftError> {
    let raw: RawReport = serde_json::from_value(value)
        .map_err(|e| DriftError::ReportParse(format!("unexpected report shape: {}", e)))?;

    let summary = raw
        .summary
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| DriftError::ReportParse("missing required field 'summary'".to_string()))?;

    // Omitted files and rename sources are part of the change even when
    // their hunks were not sent.
    let known: HashSet<&str> = diff
        .records
        .iter()
        .flat_map(|r| std::iter::once(r.path.as_str()).chain(r.old_path.as_deref()))
        .chain(diff.omitted.iter().map(String::as_str))
        .collect();
    let mut dropped = Vec::new();
    let mut findings = Vec::new();

    for raw_finding in raw.findings {
        let message = raw_finding.message.as_deref().map(str::trim).unwrap_or_default();
        if message.is_empty() {
            dropped.push(Degradation::new(STAGE, "finding without a message dropped"));
            continue;
        }

        let files: Vec<String> = match raw_finding.files {
            None => Vec::new(),
            Some(OneOrMany::One(file)) => vec![normalize_path(&file)],
            Some(OneOrMany::Many(files)) => files.iter().map(|f| normalize_path(f)).collect(),
        };
        let files: Vec<String> = files.into_iter().filter(|f| !f.is_empty()).collect();

        if let Some(unknown) = files.iter().find(|f| !known.contains(f.as_str())) {
            warn!(file = %unknown, "finding references a file outside the diff");
            dropped.push(Degradation::new(
                STAGE,
                format!("finding referencing `{}`, which is not in the diff, was dropped", unknown),
            ));
            continue;
        }

        findings.push(Finding {
            severity: parse_severity(text_field(raw_finding.severity.as_ref())),
            files,
            message: message.to_string(),
            suggested_fix: raw_finding
                .suggested_fix
                .map(|f| f.trim().to_string())
                .filter(|f| !f.is_empty()),
        });
    }

    let mut relationships = Vec::new();
    for (index, edge) in raw.relationships.into_iter().enumerate() {
        let source = edge.source.as_deref().map(str::trim).unwrap_or_default();
        let target = edge.target.as_deref().map(str::trim).unwrap_or_default();
        if source.is_empty() || target.is_empty() {
            return Err(DriftError::ReportParse(format!(
                "relationship {} has an empty node name",
                index + 1
            )));
        }
        relationships.push(RelationshipEdge {
            source: source.to_string(),
            target: target.to_string(),
            kind: parse_kind(text_field(edge.kind.as_ref()))?,
        });
    }

    Ok(ParsedReport {
        report: AnalysisReport {
            summary,
            findings,
            relationships,
        },
        dropped,
        decoder,
    })
}

/// Lowercase every object key and strip `_`, `-` and spaces from it.
fn canonical_keys(value: Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(k, v)| (canonical(&k), canonical_keys(v)))
                .collect::<Map<String, Value>>(),
        ),
        Value::Array(items) => Value::Array(items.into_iter().map(canonical_keys).collect()),
        other => other,
    }
}

fn canonical(key: &str) -> String {
    key.chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_lowercase())
        .collect()
}

/// A loosely typed optional field read as text. Anything that is not a
/// string counts as missing.
fn text_field(value: Option<&Value>) -> Option<&str> {
    value.and_then(Value::as_str)
}

fn parse_severity(raw: Option<&str>) -> Severity {
    match raw.map(canonical).as_deref() {
        Some("warning" | "warn" | "medium") => Severity::Warning,
        Some("risk" | "high" | "critical" | "error") => Severity::Risk,
        _ => Severity::Info,
    }
}

fn parse_kind(raw: Option<&str>) -> Result<RelationKind, DriftError> {
    match raw.map(canonical).as_deref() {
        None | Some("" | "both" | "unchanged") => Ok(RelationKind::Both),
        Some("beforeonly" | "before") => Ok(RelationKind::BeforeOnly),
        Some("afteronly" | "after" | "added" | "new") => Ok(RelationKind::AfterOnly),
        Some("removed" | "deleted") => Ok(RelationKind::Removed),
        Some(other) => Err(DriftError::ReportParse(format!(
            "unknown relationship kind '{}'",
            other
        ))),
    }
}

/// `./a/payments/service.py:42` -> `payments/service.py`
fn normalize_path(raw: &str) -> String {
    let mut path = raw.trim().trim_matches('`');
    path = path.strip_prefix("./").unwrap_or(path);
    path = path
        .strip_prefix("a/")
        .or_else(|| path.strip_prefix("b/"))
        .unwrap_or(path);
    if let Some((head, line)) = path.rsplit_once(':')
        && !line.is_empty()
        && line.chars().all(|c| c.is_ascii_digit())
    {
        path = head;
    }
    path.to_string()
}
