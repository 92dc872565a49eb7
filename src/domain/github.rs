use anyhow::{Context, Result};
use serde::Deserialize;
use std::process::Command;
use tracing::info;

use super::types::PullRequest;
use crate::sink::{CommentSink, ExistingComment, latest_marked_comment, parse_comment_pages};

/// Response from `gh pr view --json`
#[derive(Debug, Deserialize)]
struct GhPrView {
    number: u32,
    title: String,
    body: Option<String>,
    #[serde(rename = "headRefName")]
    head_ref_name: String,
}

/// Fetch PR metadata and diff using gh CLI
pub async fn fetch_pr(owner: &str, repo: &str, number: u32) -> Result<PullRequest> {
    let repo_spec = format!("{}/{}", owner, repo);

    let output = Command::new("gh")
        .args([
            "pr",
            "view",
            &number.to_string(),
            "--repo",
            &repo_spec,
            "--json",
            "number,title,body,headRefName",
        ])
        .output()
        .context("Failed to execute gh pr view")?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        anyhow::bail!("gh pr view failed: {}", stderr);
    }

    let pr_view: GhPrView =
        serde_json::from_slice(&output.stdout).context("Failed to parse gh pr view output")?;

    let diff = fetch_diff(&repo_spec, pr_view.number)?;

    Ok(PullRequest {
        title: pr_view.title,
        body: pr_view.body.unwrap_or_default(),
        head_branch: pr_view.head_ref_name,
        diff,
    })
}

fn fetch_diff(repo_spec: &str, number: u32) -> Result<String> {
    let output = Command::new("gh")
        .args(["pr", "diff", &number.to_string(), "--repo", repo_spec])
        .output()
        .context("Failed to execute gh pr diff")?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        anyhow::bail!("gh pr diff failed: {}", stderr);
    }

    Ok(String::from_utf8_lossy(&output.stdout).to_string())
}

/// Comments on the PR, oldest first
fn list_comments(repo_spec: &str, number: u32) -> Result<Vec<ExistingComment>> {
    let output = Command::new("gh")
        .args([
            "api",
            &format!("repos/{}/issues/{}/comments", repo_spec, number),
            "--paginate",
        ])
        .output()
        .context("Failed to execute gh api")?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        anyhow::bail!("gh api comments failed: {}", stderr);
    }

    parse_comment_pages(&output.stdout)
}

fn create_args(repo_spec: &str, number: u32, body: &str) -> Vec<String> {
    vec![
        "pr".to_string(),
        "comment".to_string(),
        number.to_string(),
        "--repo".to_string(),
        repo_spec.to_string(),
        "--body".to_string(),
        body.to_string(),
    ]
}

fn update_args(repo_spec: &str, comment_id: u64, body: &str) -> Vec<String> {
    vec![
        "api".to_string(),
        "--method".to_string(),
        "PATCH".to_string(),
        format!("repos/{}/issues/comments/{}", repo_spec, comment_id),
        "-f".to_string(),
        format!("body={}", body),
    ]
}

/// Post a comment on the PR.
///
/// With `update_existing`, the newest comment carrying our marker is
/// edited in place. A new comment is created when there is none.
pub fn post_comment(owner: &str, repo: &str, number: u32, body: &str, update_existing: bool) -> Result<()> {
    let repo_spec = format!("{}/{}", owner, repo);

    let existing = if update_existing {
        latest_marked_comment(&list_comments(&repo_spec, number)?)
    } else {
        None
    };
    let args = match existing {
        Some(id) => update_args(&repo_spec, id, body),
        None => create_args(&repo_spec, number, body),
    };

    let output = Command::new("gh")
        .args(&args)
        .output()
        .context("Failed to execute gh")?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        anyhow::bail!("gh {} failed: {}", args[0], stderr);
    }

    info!(repo = %repo_spec, number, updated = existing.is_some(), "review comment posted");
    Ok(())
}

/// Posts review comments to one pull request through `gh`
pub struct GhCommentSink {
    pub owner: String,
    pub repo: String,
    pub number: u32,
    pub update_existing: bool,
}

impl CommentSink for GhCommentSink {
    fn post(&self, body: &str) -> Result<()> {
        post_comment(&self.owner, &self.repo, self.number, body, self.update_existing)
    }
}

/// Parse a PR URL or owner/repo#number format
pub fn parse_pr_reference(input: &str) -> Result<(String, String, u32)> {
    // Try URL format: https://github.com/owner/repo/pull/123
    if input.contains("github.com") {
        let parts: Vec<&str> = input.trim_end_matches('/').split('/').collect();
        if parts.len() >= 2 {
            let number_str = parts.last().context("Missing PR number")?;
            let number: u32 = number_str.parse().context("Invalid PR number")?;

            if let Some(pos) = parts.iter().position(|&p| p == "github.com")
                && parts.len() > pos + 2
            {
                let owner = parts[pos + 1].to_string();
                let repo = parts[pos + 2].to_string();
                return Ok((owner, repo, number));
            }
        }
        anyhow::bail!("Invalid GitHub PR URL format");
    }

    if let Some((repo_part, number_str)) = input.split_once('#')
        && let Some((owner, repo)) = repo_part.split_once('/')
    {
        let number: u32 = number_str.parse().context("Invalid PR number")?;
        return Ok((owner.to_string(), repo.to_string(), number));
    }

    anyhow::bail!(
        "Invalid PR reference. Use: owner/repo#123 or https://github.com/owner/repo/pull/123"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_short_reference() {
        let (owner, repo, number) = parse_pr_reference("acme/payments#42").unwrap();
        assert_eq!((owner.as_str(), repo.as_str(), number), ("acme", "payments", 42));
    }

    #[test]
    fn parses_pull_request_url() {
        let (owner, repo, number) =
            parse_pr_reference("https://github.com/acme/payments/pull/42/").unwrap();
        assert_eq!((owner.as_str(), repo.as_str(), number), ("acme", "payments", 42));
    }

    #[test]
    fn rejects_malformed_references() {
        assert!(parse_pr_reference("acme/payments").is_err());
        assert!(parse_pr_reference("acme/payments#abc").is_err());
        assert!(parse_pr_reference("https://github.com/acme/payments/pull/x").is_err());
    }

    #[test]
    fn marked_comment_is_patched_in_place() {
        let args = update_args("acme/payments", 991, "<!-- drift:report -->\nbody");
        assert_eq!(args[..3], ["api", "--method", "PATCH"]);
        assert_eq!(args[3], "repos/acme/payments/issues/comments/991");
        assert_eq!(args[5], "body=<!-- drift:report -->\nbody");
    }

    #[test]
    fn new_comment_targets_the_pull_request() {
        let args = create_args("acme/payments", 42, "body");
        assert_eq!(args[..3], ["pr", "comment", "42"]);
        assert_eq!(args[4], "acme/payments");
        assert!(!args.iter().any(|a| a.starts_with("--edit")));
    }
}
