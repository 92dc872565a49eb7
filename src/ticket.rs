//! Optional business context from a ticket tracker.

use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use tracing::{debug, warn};

use crate::config::TicketConfig;
use crate::domain::context::TicketLookup;
use crate::logging::redact_secrets;

static TICKET_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b([A-Z][A-Z0-9]+-\d+)\b").expect("ticket id pattern is valid"));

const LOOKUP_TIMEOUT: Duration = Duration::from_secs(10);

/// First ticket id in the PR title, falling back to the head branch.
pub fn extract_ticket_id(title: &str, head_branch: &str) -> Option<String> {
    [title, head_branch]
        .iter()
        .find_map(|text| TICKET_ID.captures(text))
        .map(|caps| caps[1].to_string())
}

#[async_trait]
pub trait TicketSource: Send + Sync {
    async fn fetch(&self, id: &str) -> TicketLookup;
}

/// Plain HTTP GET against a URL template
pub struct HttpTicketSource {
    client: reqwest::Client,
    config: TicketConfig,
}

impl HttpTicketSource {
    pub fn new(config: TicketConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
        }
    }

    async fn fetch_text(&self, id: &str) -> Result<String, String> {
        let url = self.config.url_template.replace("{id}", id);
        let mut request = self.client.get(&url).timeout(LOOKUP_TIMEOUT);
        if let Some(token) = &self.config.token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await.map_err(|e| e.to_string())?;
        let status = response.status();
        if !status.is_success() {
            return Err(format!("tracker answered {}", status));
        }
        let body = response.text().await.map_err(|e| e.to_string())?;

        extract_text(&body, self.config.json_pointer.as_deref())
    }
}

/// Narrow a tracker response to its text. Without a pointer the trimmed
/// body is used as-is.
fn extract_text(body: &str, pointer: Option<&str>) -> Result<String, String> {
    let Some(pointer) = pointer else {
        return Ok(body.trim().to_string());
    };

    let value: serde_json::Value =
        serde_json::from_str(body).map_err(|e| format!("response is not JSON: {}", e))?;
    match value.pointer(pointer) {
        Some(serde_json::Value::String(text)) => Ok(text.trim().to_string()),
        Some(serde_json::Value::Null) | None => Err(format!("no value at {}", pointer)),
        Some(other) => Ok(other.to_string()),
    }
}

#[async_trait]
impl TicketSource for HttpTicketSource {
    async fn fetch(&self, id: &str) -> TicketLookup {
        match self.fetch_text(id).await {
            Ok(text) if text.is_empty() => {
                TicketLookup::Unavailable(format!("ticket {} has no description", id))
            }
            Ok(text) => {
                debug!(ticket = id, bytes = text.len(), "ticket fetched");
                TicketLookup::Found(text)
            }
            Err(reason) => {
                let reason = redact_secrets(&reason);
                warn!(ticket = id, %reason, "ticket lookup failed");
                TicketLookup::Unavailable(format!("{}: {}", id, reason))
            }
        }
    }
}

/// Look up the ticket the pull request refers to. `None` when lookup is not
/// configured or no ticket id is mentioned.
pub async fn lookup(
    source: Option<&dyn TicketSource>,
    title: &str,
    head_branch: &str,
) -> Option<TicketLookup> {
    let source = source?;
    let id = extract_ticket_id(title, head_branch)?;
    Some(source.fetch(&id).await)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed(TicketLookup);

    #[async_trait]
    impl TicketSource for Fixed {
        async fn fetch(&self, _id: &str) -> TicketLookup {
            self.0.clone()
        }
    }

    #[test]
    fn ticket_id_prefers_title_over_branch() {
        assert_eq!(
            extract_ticket_id("PAY-142: add refunds", "feature/PAY-99-refunds"),
            Some("PAY-142".to_string())
        );
        assert_eq!(
            extract_ticket_id("Add refunds", "feature/PAY-99-refunds"),
            Some("PAY-99".to_string())
        );
        assert_eq!(extract_ticket_id("Add refunds", "main"), None);
        assert_eq!(extract_ticket_id("utf-8 fix", "fix-1"), None);
    }

    #[test]
    fn json_pointer_narrows_response() {
        let body = r#"{"fields": {"description": "  Customers can request refunds.  "}}"#;
        assert_eq!(
            extract_text(body, Some("/fields/description")).unwrap(),
            "Customers can request refunds."
        );
        assert!(extract_text(body, Some("/fields/summary")).is_err());
        assert!(extract_text("not json", Some("/a")).is_err());
        assert_eq!(extract_text("  plain text\n", None).unwrap(), "plain text");
    }

    #[tokio::test]
    async fn lookup_is_skipped_without_source_or_id() {
        let source = Fixed(TicketLookup::Found("text".into()));
        assert_eq!(lookup(None, "PAY-1", "").await, None);
        assert_eq!(lookup(Some(&source), "no id here", "main").await, None);
        assert_eq!(
            lookup(Some(&source), "PAY-1 refunds", "main").await,
            Some(TicketLookup::Found("text".into()))
        );
    }
}
