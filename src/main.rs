use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{error, info};

use drift::config::{AppConfig, BackendKind, ConfigLayer, Provider};
use drift::domain::github::{self, GhCommentSink};
use drift::domain::gitlab::{self, GlabCommentSink, MergeRequestRef};
use drift::domain::types::PullRequest;
use drift::error::DriftError;
use drift::llm::{AnalysisClient, LlmBackend, OpenAiBackend, ReplayBackend};
use drift::logging::{init_tracing, redact_secrets};
use drift::pipeline::{self, PipelineInput};
use drift::sink::{CommentSink, StdoutSink};
use drift::ticket::{HttpTicketSource, TicketSource};

#[derive(Parser)]
#[command(name = "drift")]
#[command(about = "Drift - Architectural impact reviews for pull requests")]
struct Cli {
    #[command(flatten)]
    settings: ConfigLayer,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Review a pull request and post the result as a comment
    Review {
        /// owner/repo#123 or a PR URL; group/project!123 or an MR URL with --provider gitlab
        pr_ref: String,

        /// Print the comment instead of posting it
        #[arg(long)]
        dry_run: bool,

        /// Read the diff from a file instead of fetching it
        #[arg(long)]
        diff_file: Option<PathBuf>,

        /// Read the description from a file instead of fetching it
        #[arg(long)]
        description_file: Option<PathBuf>,
    },

    /// Review local files and print the comment
    Render {
        #[arg(long)]
        diff_file: PathBuf,

        #[arg(long)]
        description_file: Option<PathBuf>,

        /// PR title, used to find a ticket id
        #[arg(long, default_value = "")]
        title: String,
    },

    /// Load and validate configuration, then print it with secrets masked
    CheckConfig,
}

#[tokio::main]
async fn main() {
    // Load .env file if present
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    let config = match AppConfig::load(cli.settings) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("drift: {}", redact_secrets(&err.to_string()));
            std::process::exit(err.exit_code());
        }
    };
    init_tracing(config.log_format, &config.log_level);

    if let Err(err) = run(cli.command, &config).await {
        let code = err.downcast_ref::<DriftError>().map_or(1, DriftError::exit_code);
        error!(code, error = %redact_secrets(&format!("{:#}", err)), "drift failed");
        std::process::exit(code);
    }
}

async fn run(command: Command, config: &AppConfig) -> Result<()> {
    match command {
        Command::CheckConfig => {
            print!("{}", config.describe());
            println!("configuration OK");
            Ok(())
        }
        Command::Render {
            diff_file,
            description_file,
            title,
        } => {
            let input = PipelineInput {
                raw_diff: read_input(&diff_file)?,
                title,
                description: match &description_file {
                    Some(path) => read_input(path)?,
                    None => String::new(),
                },
                head_branch: String::new(),
            };
            execute(config, &input, &StdoutSink).await
        }
        Command::Review {
            pr_ref,
            dry_run,
            diff_file,
            description_file,
        } => {
            let target = ReviewTarget::parse(config.provider, &pr_ref)?;

            let input = match (&diff_file, &description_file) {
                (Some(diff), Some(description)) => PipelineInput {
                    raw_diff: read_input(diff)?,
                    description: read_input(description)?,
                    ..Default::default()
                },
                _ => {
                    let pr = target
                        .fetch()
                        .await
                        .map_err(|e| DriftError::Source(format!("{:#}", e)))?;
                    info!(provider = config.provider.as_str(), reference = %pr_ref, "pull request fetched");
                    PipelineInput {
                        raw_diff: match &diff_file {
                            Some(path) => read_input(path)?,
                            None => pr.diff,
                        },
                        description: match &description_file {
                            Some(path) => read_input(path)?,
                            None => pr.body,
                        },
                        title: pr.title,
                        head_branch: pr.head_branch,
                    }
                }
            };

            if dry_run {
                execute(config, &input, &StdoutSink).await
            } else {
                let sink = target.into_sink(config.update_existing);
                execute(config, &input, sink.as_ref()).await
            }
        }
    }
}

/// The pull or merge request named on the command line
enum ReviewTarget {
    GitHub { owner: String, repo: String, number: u32 },
    GitLab(MergeRequestRef),
}

impl ReviewTarget {
    fn parse(provider: Provider, reference: &str) -> Result<Self> {
        match provider {
            Provider::GitHub => {
                let (owner, repo, number) =
                    github::parse_pr_reference(reference).context("Invalid PR reference")?;
                Ok(ReviewTarget::GitHub {
                    owner,
                    repo,
                    number,
                })
            }
            Provider::GitLab => Ok(ReviewTarget::GitLab(
                gitlab::parse_mr_reference(reference).context("Invalid MR reference")?,
            )),
        }
    }

    async fn fetch(&self) -> Result<PullRequest> {
        match self {
            ReviewTarget::GitHub {
                owner,
                repo,
                number,
            } => github::fetch_pr(owner, repo, *number).await,
            ReviewTarget::GitLab(mr) => gitlab::fetch_mr(mr).await,
        }
    }

    fn into_sink(self, update_existing: bool) -> Box<dyn CommentSink> {
        match self {
            ReviewTarget::GitHub {
                owner,
                repo,
                number,
            } => Box::new(GhCommentSink {
                owner,
                repo,
                number,
                update_existing,
            }),
            ReviewTarget::GitLab(mr) => Box::new(GlabCommentSink {
                mr,
                update_existing,
            }),
        }
    }
}

async fn execute(config: &AppConfig, input: &PipelineInput, sink: &dyn CommentSink) -> Result<()> {
    let client = AnalysisClient::new(build_backend(config), config.retry);
    let tickets = config.ticket.clone().map(HttpTicketSource::new);

    info!(backend = client.backend_name(), "starting review");
    let outcome = pipeline::review(
        config,
        input,
        tickets.as_ref().map(|t| t as &dyn TicketSource),
        &client,
        sink,
    )
    .await?;
    info!(
        findings = outcome.report.findings.len(),
        degradations = outcome.degradations.len(),
        "review complete"
    );
    Ok(())
}

fn build_backend(config: &AppConfig) -> Arc<dyn LlmBackend> {
    match config.backend {
        BackendKind::OpenAi => Arc::new(OpenAiBackend::new(
            &config.openai_base_url,
            config.api_key.as_deref().unwrap_or_default(),
            &config.model,
        )),
        BackendKind::Replay => Arc::new(ReplayBackend::new(
            config.replay_file.clone().unwrap_or_default(),
        )),
    }
}

fn read_input(path: &Path) -> Result<String> {
    std::fs::read_to_string(path)
        .map_err(|e| DriftError::Source(format!("cannot read {}: {}", path.display(), e)))
        .with_context(|| format!("Failed to read {}", path.display()))
}
