use anyhow::{Context, Result};
use serde::Deserialize;
use std::process::Command;
use tracing::info;

use super::types::PullRequest;
use crate::sink::{CommentSink, ExistingComment, latest_marked_comment, parse_comment_pages};

/// Response from `glab mr view --output json`
#[derive(Debug, Deserialize)]
struct GlabMrView {
    iid: u32,
    title: String,
    description: Option<String>,
    source_branch: String,
}

/// A merge request on GitLab.com or a self-managed instance
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeRequestRef {
    /// Set for URL references; `None` uses glab's default host
    pub host: Option<String>,
    /// Full project path, e.g. `group/subgroup/project`
    pub project: String,
    pub number: u32,
}

impl MergeRequestRef {
    /// Value for glab's `--repo` flag
    fn repo_arg(&self) -> String {
        match &self.host {
            Some(host) => format!("https://{}/{}", host, self.project),
            None => self.project.clone(),
        }
    }

    /// API path of the merge request
    fn api_path(&self) -> String {
        format!(
            "projects/{}/merge_requests/{}",
            self.project.replace('/', "%2F"),
            self.number
        )
    }

    /// `glab api` arguments for `endpoint`, pinned to our host
    fn api_args(&self, endpoint: String) -> Vec<String> {
        let mut args = vec!["api".to_string(), endpoint];
        if let Some(host) = &self.host {
            args.push("--hostname".to_string());
            args.push(host.clone());
        }
        args
    }
}

/// Fetch MR metadata and diff using glab CLI
pub async fn fetch_mr(mr: &MergeRequestRef) -> Result<PullRequest> {
    let repo = mr.repo_arg();

    let output = Command::new("glab")
        .args([
            "mr",
            "view",
            &mr.number.to_string(),
            "--repo",
            &repo,
            "--output",
            "json",
        ])
        .output()
        .context("Failed to execute glab mr view")?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        anyhow::bail!("glab mr view failed: {}", stderr);
    }

    let view: GlabMrView =
        serde_json::from_slice(&output.stdout).context("Failed to parse glab mr view output")?;

    let output = Command::new("glab")
        .args(["mr", "diff", &view.iid.to_string(), "--repo", &repo, "--raw"])
        .output()
        .context("Failed to execute glab mr diff")?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        anyhow::bail!("glab mr diff failed: {}", stderr);
    }

    Ok(PullRequest {
        title: view.title,
        body: view.description.unwrap_or_default(),
        head_branch: view.source_branch,
        diff: String::from_utf8_lossy(&output.stdout).to_string(),
    })
}

/// Notes on the MR, oldest first
fn list_notes(mr: &MergeRequestRef) -> Result<Vec<ExistingComment>> {
    let mut args = mr.api_args(format!(
        "{}/notes?sort=asc&order_by=created_at&per_page=100",
        mr.api_path()
    ));
    args.push("--paginate".to_string());

    let output = Command::new("glab")
        .args(&args)
        .output()
        .context("Failed to execute glab api")?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        anyhow::bail!("glab api notes failed: {}", stderr);
    }

    parse_comment_pages(&output.stdout)
}

fn create_args(mr: &MergeRequestRef, body: &str) -> Vec<String> {
    vec![
        "mr".to_string(),
        "note".to_string(),
        mr.number.to_string(),
        "--repo".to_string(),
        mr.repo_arg(),
        "--message".to_string(),
        body.to_string(),
    ]
}

fn update_args(mr: &MergeRequestRef, note_id: u64, body: &str) -> Vec<String> {
    let mut args = mr.api_args(format!("{}/notes/{}", mr.api_path(), note_id));
    args.extend([
        "--method".to_string(),
        "PUT".to_string(),
        "-f".to_string(),
        format!("body={}", body),
    ]);
    args
}

/// Post a note on the MR, editing our previous one when `update_existing`
/// is set and one exists.
pub fn post_note(mr: &MergeRequestRef, body: &str, update_existing: bool) -> Result<()> {
    let existing = if update_existing {
        latest_marked_comment(&list_notes(mr)?)
    } else {
        None
    };
    let args = match existing {
        Some(id) => update_args(mr, id, body),
        None => create_args(mr, body),
    };

    let output = Command::new("glab")
        .args(&args)
        .output()
        .context("Failed to execute glab")?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        anyhow::bail!("glab {} failed: {}", args[0], stderr);
    }

    info!(project = %mr.project, number = mr.number, updated = existing.is_some(), "review note posted");
    Ok(())
}

/// Posts review notes to one merge request through `glab`
pub struct GlabCommentSink {
    pub mr: MergeRequestRef,
    pub update_existing: bool,
}

impl CommentSink for GlabCommentSink {
    fn post(&self, body: &str) -> Result<()> {
        post_note(&self.mr, body, self.update_existing)
    }
}

/// Parse an MR URL or group/project!number format
pub fn parse_mr_reference(input: &str) -> Result<MergeRequestRef> {
    // URL format: https://gitlab.example.com/group/project/-/merge_requests/123
    if let Some(rest) = input
        .strip_prefix("https://")
        .or_else(|| input.strip_prefix("http://"))
    {
        let rest = rest.trim_end_matches('/');
        let (host, path) = rest.split_once('/').context("Missing project path")?;
        let (project, number_str) = path
            .split_once("/-/merge_requests/")
            .context("Invalid GitLab MR URL format")?;
        let number_str = number_str.split('/').next().unwrap_or_default();
        let number: u32 = number_str.parse().context("Invalid MR number")?;
        if project.is_empty() {
            anyhow::bail!("Invalid GitLab MR URL format");
        }
        return Ok(MergeRequestRef {
            host: Some(host.to_string()),
            project: project.to_string(),
            number,
        });
    }

    if let Some((project, number_str)) = input.rsplit_once('!')
        && project.contains('/')
    {
        let number: u32 = number_str.parse().context("Invalid MR number")?;
        return Ok(MergeRequestRef {
            host: None,
            project: project.to_string(),
            number,
        });
    }

    anyhow::bail!(
        "Invalid MR reference. Use: group/project!123 or https://gitlab.com/group/project/-/merge_requests/123"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_short_reference_with_subgroups() {
        let mr = parse_mr_reference("acme/billing/payments!42").unwrap();
        assert_eq!(mr.host, None);
        assert_eq!(mr.project, "acme/billing/payments");
        assert_eq!(mr.number, 42);
        assert_eq!(mr.repo_arg(), "acme/billing/payments");
    }

    #[test]
    fn parses_self_managed_url() {
        let mr =
            parse_mr_reference("https://git.acme.dev/acme/payments/-/merge_requests/42/diffs").unwrap();
        assert_eq!(mr.host.as_deref(), Some("git.acme.dev"));
        assert_eq!(mr.project, "acme/payments");
        assert_eq!(mr.number, 42);
        assert_eq!(mr.repo_arg(), "https://git.acme.dev/acme/payments");
    }

    #[test]
    fn rejects_malformed_references() {
        assert!(parse_mr_reference("payments!42").is_err());
        assert!(parse_mr_reference("acme/payments!x").is_err());
        assert!(parse_mr_reference("https://gitlab.com/acme/payments/pull/42").is_err());
        assert!(parse_mr_reference("acme/payments#42").is_err());
    }

    #[test]
    fn project_path_is_encoded_for_the_api() {
        let mr = parse_mr_reference("acme/billing/payments!7").unwrap();
        assert_eq!(
            mr.api_path(),
            "projects/acme%2Fbilling%2Fpayments/merge_requests/7"
        );
    }

    #[test]
    fn marked_note_is_updated_on_the_right_host() {
        let mr = parse_mr_reference("https://git.acme.dev/acme/payments/-/merge_requests/42").unwrap();
        let args = update_args(&mr, 313, "new body");
        assert_eq!(args[0], "api");
        assert_eq!(args[1], "projects/acme%2Fpayments/merge_requests/42/notes/313");
        assert_eq!(args[2..4], ["--hostname", "git.acme.dev"]);
        assert_eq!(args[4..6], ["--method", "PUT"]);
        assert_eq!(args.last().map(String::as_str), Some("body=new body"));
    }

    #[test]
    fn new_note_uses_glab_mr_note() {
        let mr = parse_mr_reference("acme/payments!42").unwrap();
        let args = create_args(&mr, "body");
        assert_eq!(args[..3], ["mr", "note", "42"]);
        assert_eq!(args[4], "acme/payments");
    }
}
