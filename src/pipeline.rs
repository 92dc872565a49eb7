//! One review run: diff and context in, rendered comment out.

use tracing::{debug, error, info, warn};

use crate::config::{AppConfig, FailureMode};
use crate::domain::context::{gather_sources, providers_from_sources, resolve};
use crate::domain::diagram::{DiagramSpec, synthesize};
use crate::domain::diff::normalize;
use crate::domain::format::{ReportMeta, render, render_failure};
use crate::domain::prompt::{assemble, overrun, reformulate};
use crate::domain::report::{ParsedReport, parse_report};
use crate::domain::types::AnalysisReport;
use crate::error::{Degradation, DriftError};
use crate::llm::AnalysisClient;
use crate::logging::redact_secrets;
use crate::sink::CommentSink;
use crate::ticket::{self, TicketSource};

/// Raw inputs for one pull request
#[derive(Debug, Clone, Default)]
pub struct PipelineInput {
    pub raw_diff: String,
    pub title: String,
    pub description: String,
    pub head_branch: String,
}

#[derive(Debug, Clone)]
pub struct PipelineOutcome {
    pub comment: String,
    pub report: AnalysisReport,
    pub diagram: DiagramSpec,
    pub degradations: Vec<Degradation>,
}

/// Run every stage and return the rendered comment. Nothing is posted here.
pub async fn run(
    config: &AppConfig,
    input: &PipelineInput,
    tickets: Option<&dyn TicketSource>,
    client: &AnalysisClient,
) -> Result<PipelineOutcome, DriftError> {
    let (diff, ticket) = tokio::join!(
        async { normalize(&input.raw_diff, &config.diff_limits) },
        ticket::lookup(tickets, &input.title, &input.head_branch),
    );
    let diff = diff?;
    info!(
        files = diff.records.len(),
        truncated = diff.truncated,
        "diff normalized"
    );

    let mut degradations = Vec::new();
    let sources = gather_sources(&input.description, config.env_context.as_deref(), ticket);
    let providers = providers_from_sources(&sources);
    let context = resolve(&providers, config.precedence, &mut degradations);
    info!(sources = context.trail().len(), "context resolved");

    let request = assemble(&diff, &context, config.max_payload_bytes);
    if let Some(over) = overrun(&request, config.max_payload_bytes) {
        warn!(over, "payload exceeds cap after context truncation");
        degradations.push(Degradation::new(
            "prompt",
            format!(
                "payload exceeds the {} byte cap by {} bytes even after context truncation",
                config.max_payload_bytes, over
            ),
        ));
    }
    debug!(
        template = request.template_id,
        version = request.template_version,
        bytes = request.body().len(),
        context_truncated = request.context_truncated,
        "analysis request assembled"
    );

    let raw = client.send(&request).await?;
    let parsed = match parse_report(&raw, &diff) {
        Ok(parsed) => parsed,
        Err(DriftError::ReportParse(problem)) if client.policy().max_attempts > 1 => {
            warn!(%problem, "response unusable, asking once more");
            let retry = reformulate(&request, &raw, &problem);
            let raw = client.send(&retry).await?;
            parse_report(&raw, &diff)?
        }
        Err(err) => return Err(err),
    };
    let ParsedReport {
        report,
        dropped,
        decoder,
    } = parsed;
    for item in &dropped {
        warn!(stage = item.stage, message = %item.message, "response degraded");
    }
    degradations.extend(dropped);
    info!(
        decoder,
        findings = report.findings.len(),
        relationships = report.relationships.len(),
        "report parsed"
    );

    let diagram = synthesize(&report.relationships, config.max_diagram_nodes);
    if !diagram.collapsed.is_empty() {
        debug!(collapsed = diagram.collapsed.len(), "diagram nodes collapsed");
    }

    let meta = ReportMeta {
        context_sources: context.trail().to_vec(),
        diff_truncated: diff.truncated,
        omitted_files: diff.omitted.clone(),
        context_truncated: request.context_truncated,
        degradations: degradations.clone(),
    };
    let comment = render(&report, &diagram, &meta);

    Ok(PipelineOutcome {
        comment,
        report,
        diagram,
        degradations,
    })
}

/// The comment to publish for a failed run, if the failure mode asks for one.
pub fn render_failure_comment(config: &AppConfig, err: &DriftError) -> Option<String> {
    match config.failure_mode {
        FailureMode::Comment => Some(render_failure(err)),
        FailureMode::Log => None,
    }
}

/// Run the pipeline and publish the result through `sink`.
///
/// A successful run posts the full report. A failed run posts only the
/// failure comment, and only in comment mode.
pub async fn review(
    config: &AppConfig,
    input: &PipelineInput,
    tickets: Option<&dyn TicketSource>,
    client: &AnalysisClient,
    sink: &dyn CommentSink,
) -> Result<PipelineOutcome, DriftError> {
    match run(config, input, tickets, client).await {
        Ok(outcome) => {
            sink.post(&outcome.comment)
                .map_err(|e| DriftError::Source(format!("{:#}", e)))?;
            Ok(outcome)
        }
        Err(err) => {
            error!(code = err.code(), error = %redact_secrets(&err.to_string()), "review failed");
            if let Some(body) = render_failure_comment(config, &err)
                && let Err(post_err) = sink.post(&body)
            {
                warn!(error = %redact_secrets(&format!("{:#}", post_err)), "failure comment not posted");
            }
            Err(err)
        }
    }
}
