//! Business-context resolution.
//!
//! Each candidate source is a [`ContextProvider`]. Providers are ordered by the
//! configured [`ContextPrecedence`] and folded into one [`ResolvedContext`]:
//! the first usable provider sets the technical constraints, every usable
//! provider contributes to the business summary. A provider that is present
//! but unusable is recorded as a [`Degradation`] and skipped.

use serde::Deserialize;
use tracing::{debug, warn};

use super::types::{ContextSource, Origin, ProvidedContext, ResolvedContext, SourceContent};
use crate::error::Degradation;

/// Opens the structured block embedded in a PR description.
pub const CONTEXT_BLOCK_START: &str = "<!-- drift:context -->";
/// Closes the structured block embedded in a PR description.
pub const CONTEXT_BLOCK_END: &str = "<!-- /drift:context -->";

const STAGE: &str = "context";

/// Which of the two author-written sources wins when both are present.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ContextPrecedence {
    #[default]
    InlineFirst,
    DescriptionFirst,
}

impl ContextPrecedence {
    pub fn order(&self) -> [Origin; 4] {
        match self {
            ContextPrecedence::InlineFirst => [
                Origin::InlineConfig,
                Origin::Description,
                Origin::Environment,
                Origin::Ticket,
            ],
            ContextPrecedence::DescriptionFirst => [
                Origin::Description,
                Origin::InlineConfig,
                Origin::Environment,
                Origin::Ticket,
            ],
        }
    }

    fn rank(&self, origin: Origin) -> usize {
        self.order()
            .iter()
            .position(|o| *o == origin)
            .unwrap_or(usize::MAX)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ContextPrecedence::InlineFirst => "inline-first",
            ContextPrecedence::DescriptionFirst => "description-first",
        }
    }
}

impl std::str::FromStr for ContextPrecedence {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "inline-first" => Ok(ContextPrecedence::InlineFirst),
            "description-first" => Ok(ContextPrecedence::DescriptionFirst),
            other => Err(format!(
                "unknown context precedence '{}' (expected inline-first or description-first)",
                other
            )),
        }
    }
}

/// Outcome of the optional ticket-tracker lookup
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TicketLookup {
    Found(String),
    Unavailable(String),
}

/// The inline block schema
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InlineConfig {
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub constraints: Vec<String>,
    #[serde(default)]
    pub references: Vec<String>,
}

/// What one usable source adds to the resolved context
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Contribution {
    pub origin: Origin,
    pub summary: String,
    pub constraints: String,
    pub references: Vec<String>,
}

impl Contribution {
    fn plain(origin: Origin, text: &str) -> Self {
        Self {
            origin,
            summary: text.to_string(),
            constraints: text.to_string(),
            references: Vec::new(),
        }
    }
}

pub trait ContextProvider: Send + Sync {
    fn origin(&self) -> Origin;

    /// `Ok(None)` when the source has nothing to say, `Err` when it has
    /// something but it cannot be used.
    fn contribute(&self) -> Result<Option<Contribution>, String>;
}

/// Structured block from the PR description (YAML)
pub struct InlineConfigProvider {
    content: SourceContent,
}

impl InlineConfigProvider {
    pub fn new(content: SourceContent) -> Self {
        Self { content }
    }
}

impl ContextProvider for InlineConfigProvider {
    fn origin(&self) -> Origin {
        Origin::InlineConfig
    }

    fn contribute(&self) -> Result<Option<Contribution>, String> {
        let block = match &self.content {
            SourceContent::Unavailable(reason) => return Err(reason.clone()),
            SourceContent::Text(block) => strip_code_fence(block),
        };
        if block.trim().is_empty() {
            return Ok(None);
        }

        let config: InlineConfig =
            serde_yaml_ng::from_str(block).map_err(|e| format!("inline context block ignored: {}", e))?;

        let summary = config.summary.trim().to_string();
        let constraints: Vec<String> = config
            .constraints
            .iter()
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty())
            .collect();
        let constraints = constraints.join("\n");

        if summary.is_empty() && constraints.is_empty() {
            return Ok(None);
        }

        Ok(Some(Contribution {
            origin: Origin::InlineConfig,
            summary: if summary.is_empty() {
                constraints.clone()
            } else {
                summary.clone()
            },
            constraints: if constraints.is_empty() { summary } else { constraints },
            references: config
                .references
                .into_iter()
                .map(|r| r.trim().to_string())
                .filter(|r| !r.is_empty())
                .collect(),
        }))
    }
}

/// Free-text source: description prose, environment override or ticket
pub struct TextProvider {
    origin: Origin,
    content: SourceContent,
}

impl TextProvider {
    pub fn new(origin: Origin, content: SourceContent) -> Self {
        Self { origin, content }
    }
}

impl ContextProvider for TextProvider {
    fn origin(&self) -> Origin {
        self.origin
    }

    fn contribute(&self) -> Result<Option<Contribution>, String> {
        match &self.content {
            SourceContent::Unavailable(reason) => Err(reason.clone()),
            SourceContent::Text(text) => {
                let text = text.trim();
                Ok((!text.is_empty()).then(|| Contribution::plain(self.origin, text)))
            }
        }
    }
}

/// Split a PR description into its prose and its embedded context block.
///
/// The block is `None` when there are no markers, `Some(Err)` when the
/// start marker is never closed.
pub fn split_description(description: &str) -> (String, Option<Result<String, String>>) {
    let Some(start) = description.find(CONTEXT_BLOCK_START) else {
        return (description.trim().to_string(), None);
    };
    let body_start = start + CONTEXT_BLOCK_START.len();
    let Some(len) = description[body_start..].find(CONTEXT_BLOCK_END) else {
        return (
            description.trim().to_string(),
            Some(Err("inline context block is not terminated".to_string())),
        );
    };

    let block = description[body_start..body_start + len].to_string();
    let before = description[..start].trim();
    let after = description[body_start + len + CONTEXT_BLOCK_END.len()..].trim();
    let prose = [before, after]
        .into_iter()
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join("\n\n");

    (prose, Some(Ok(block)))
}

/// Collect the context sources present for a pull request.
///
/// The description yields up to two sources (its inline block and its
/// prose). A missing environment value or ticket lookup adds nothing.
pub fn gather_sources(
    description: &str,
    environment: Option<&str>,
    ticket: Option<TicketLookup>,
) -> Vec<ContextSource> {
    let (prose, block) = split_description(description);
    let mut sources = Vec::new();

    match block {
        Some(Ok(block)) => sources.push(ContextSource::new(Origin::InlineConfig, block)),
        Some(Err(reason)) => sources.push(ContextSource::unavailable(Origin::InlineConfig, reason)),
        None => {}
    }
    if !prose.is_empty() {
        sources.push(ContextSource::new(Origin::Description, prose));
    }
    if let Some(text) = environment {
        sources.push(ContextSource::new(Origin::Environment, text));
    }
    match ticket {
        Some(TicketLookup::Found(text)) => sources.push(ContextSource::new(Origin::Ticket, text)),
        Some(TicketLookup::Unavailable(reason)) => sources.push(ContextSource::unavailable(
            Origin::Ticket,
            format!("ticket lookup unavailable: {}", reason),
        )),
        None => {}
    }
    sources
}

/// One provider per source.
pub fn providers_from_sources(sources: &[ContextSource]) -> Vec<Box<dyn ContextProvider>> {
    sources
        .iter()
        .map(|source| -> Box<dyn ContextProvider> {
            match source.origin {
                Origin::InlineConfig => Box::new(InlineConfigProvider::new(source.content.clone())),
                origin => Box::new(TextProvider::new(origin, source.content.clone())),
            }
        })
        .collect()
}

#[derive(Default)]
struct Accumulator {
    constraints: Option<String>,
    summaries: Vec<String>,
    references: Vec<String>,
    trail: Vec<Origin>,
}

/// Fold providers in precedence order into the run's single context value.
pub fn resolve(
    providers: &[Box<dyn ContextProvider>],
    precedence: ContextPrecedence,
    degradations: &mut Vec<Degradation>,
) -> ResolvedContext {
    let mut ordered: Vec<&dyn ContextProvider> = providers.iter().map(|p| p.as_ref()).collect();
    ordered.sort_by_key(|p| precedence.rank(p.origin()));

    let acc = ordered
        .into_iter()
        .fold(Accumulator::default(), |mut acc, provider| {
            match provider.contribute() {
                Ok(Some(contribution)) => {
                    debug!(origin = %contribution.origin, "context source contributed");
                    if acc.constraints.is_none() {
                        acc.constraints = Some(contribution.constraints);
                    }
                    if !acc.summaries.contains(&contribution.summary) {
                        acc.summaries.push(contribution.summary);
                    }
                    for reference in contribution.references {
                        if !acc.references.contains(&reference) {
                            acc.references.push(reference);
                        }
                    }
                    acc.trail.push(contribution.origin);
                }
                Ok(None) => {}
                Err(reason) => {
                    warn!(origin = %provider.origin(), %reason, "context source degraded");
                    degradations.push(Degradation::new(STAGE, reason));
                }
            }
            acc
        });

    match acc.constraints {
        None => ResolvedContext::NoContext,
        Some(technical_constraints) => ResolvedContext::Provided(ProvidedContext {
            business_summary: acc.summaries.join("\n\n"),
            technical_constraints,
            references: acc.references,
            trail: acc.trail,
        }),
    }
}

fn strip_code_fence(block: &str) -> &str {
    let trimmed = block.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let rest = rest.split_once('\n').map(|(_, body)| body).unwrap_or("");
    rest.trim_end().strip_suffix("```").unwrap_or(rest)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolve_sources(sources: &[ContextSource]) -> (ResolvedContext, Vec<Degradation>) {
        let mut degradations = Vec::new();
        let resolved = resolve(
            &providers_from_sources(sources),
            ContextPrecedence::InlineFirst,
            &mut degradations,
        );
        (resolved, degradations)
    }

    #[test]
    fn precedence_chain_picks_highest_available_source() {
        let inline = ContextSource::new(Origin::InlineConfig, "summary: A");
        let description = ContextSource::new(Origin::Description, "B");
        let environment = ContextSource::new(Origin::Environment, "C");

        let (all, _) = resolve_sources(&[environment.clone(), description.clone(), inline]);
        assert_eq!(all.technical_constraints(), "A");

        let (no_inline, _) = resolve_sources(&[description, environment.clone()]);
        assert_eq!(no_inline.technical_constraints(), "B");

        let (env_only, _) = resolve_sources(&[environment]);
        assert_eq!(env_only.technical_constraints(), "C");

        let (nothing, _) = resolve_sources(&[]);
        assert_eq!(nothing, ResolvedContext::NoContext);
    }

    #[test]
    fn summary_concatenates_all_sources_without_duplicates() {
        let (resolved, _) = resolve_sources(&[
            ContextSource::new(Origin::Description, "Add refund flow"),
            ContextSource::new(Origin::Environment, "Add refund flow"),
            ContextSource::new(Origin::Ticket, "PAY-12: refunds for card payments"),
        ]);
        assert_eq!(
            resolved.business_summary(),
            "Add refund flow\n\nPAY-12: refunds for card payments"
        );
        assert_eq!(
            resolved.trail(),
            [Origin::Description, Origin::Environment, Origin::Ticket]
        );
    }

    #[test]
    fn invalid_inline_block_degrades_to_next_source() {
        let (resolved, degradations) = resolve_sources(&[
            ContextSource::new(Origin::InlineConfig, "summary: [unclosed"),
            ContextSource::new(Origin::Description, "B"),
        ]);
        assert_eq!(resolved.technical_constraints(), "B");
        assert_eq!(degradations.len(), 1);
        assert_eq!(degradations[0].stage, "context");
    }

    #[test]
    fn inline_block_with_unknown_keys_is_rejected() {
        let (resolved, degradations) = resolve_sources(&[ContextSource::new(
            Origin::InlineConfig,
            "summary: A\nowner: someone",
        )]);
        assert!(resolved.is_empty());
        assert_eq!(degradations.len(), 1);
    }

    #[test]
    fn unavailable_ticket_is_recorded_not_fatal() {
        let (resolved, degradations) = resolve_sources(&gather_sources(
            "",
            Some("Add refund flow"),
            Some(TicketLookup::Unavailable("connection refused".into())),
        ));
        assert_eq!(resolved.business_summary(), "Add refund flow");
        assert_eq!(degradations.len(), 1);
        assert!(degradations[0].message.contains("connection refused"));
    }

    #[test]
    fn description_block_is_split_from_prose() {
        let description = "Adds refunds.\n\n<!-- drift:context -->\n```yaml\nsummary: Refunds\nconstraints:\n  - PCI scope must not grow\nreferences:\n  - ADR-7\n```\n<!-- /drift:context -->\nThanks!";
        let (resolved, degradations) = resolve_sources(&gather_sources(description, None, None));

        let ResolvedContext::Provided(context) = resolved else {
            panic!("expected context");
        };
        assert_eq!(context.technical_constraints, "PCI scope must not grow");
        assert_eq!(context.business_summary, "Refunds\n\nAdds refunds.\n\nThanks!");
        assert_eq!(context.references, ["ADR-7"]);
        assert!(degradations.is_empty());
    }

    #[test]
    fn description_first_policy_flips_author_sources() {
        let sources = [
            ContextSource::new(Origin::InlineConfig, "summary: A"),
            ContextSource::new(Origin::Description, "B"),
        ];
        let mut degradations = Vec::new();
        let resolved = resolve(
            &providers_from_sources(&sources),
            ContextPrecedence::DescriptionFirst,
            &mut degradations,
        );
        assert_eq!(resolved.technical_constraints(), "B");
        assert_eq!(resolved.business_summary(), "B\n\nA");
    }

    #[test]
    fn unterminated_block_keeps_description() {
        let (prose, block) = split_description("Intro <!-- drift:context --> summary: x");
        assert!(prose.starts_with("Intro"));
        assert!(matches!(block, Some(Err(_))));
    }

    #[test]
    fn blank_sources_are_absent() {
        let (resolved, degradations) = resolve_sources(&[
            ContextSource::new(Origin::Description, "   "),
            ContextSource::new(Origin::Environment, ""),
        ]);
        assert_eq!(resolved, ResolvedContext::NoContext);
        assert!(degradations.is_empty());
    }

    #[test]
    fn only_present_sources_are_gathered() {
        assert!(gather_sources("", None, None).is_empty());

        let sources = gather_sources(
            "Adds refunds.",
            Some("Add refund flow"),
            Some(TicketLookup::Found("PAY-1: refunds".into())),
        );
        let origins: Vec<Origin> = sources.iter().map(|s| s.origin).collect();
        assert_eq!(origins, [Origin::Description, Origin::Environment, Origin::Ticket]);

        let sources = gather_sources("<!-- drift:context --> summary: x", None, None);
        assert_eq!(sources.len(), 1);
        assert!(matches!(sources[0].content, SourceContent::Unavailable(_)));
    }
}
