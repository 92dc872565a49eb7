//! Run configuration.
//!
//! Settings are layered: built-in defaults, then an optional YAML file, then
//! `DRIFT_*` environment variables and command-line flags. The result is
//! validated once and never changes for the rest of the run.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use clap::Args;
use serde::Deserialize;

use crate::domain::context::ContextPrecedence;
use crate::domain::diff::DiffLimits;
use crate::error::DriftError;
use crate::llm::RetryPolicy;

const MAX_CONFIG_FILE_BYTES: u64 = 1024 * 1024;

pub const DEFAULT_MODEL: &str = "gpt-5.2";
pub const DEFAULT_OPENAI_BASE_URL: &str = "https://api.openai.com/v1";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackendKind {
    #[default]
    OpenAi,
    Replay,
}

impl FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "openai" => Ok(BackendKind::OpenAi),
            "replay" => Ok(BackendKind::Replay),
            other => Err(format!("unknown backend '{}' (expected openai or replay)", other)),
        }
    }
}

/// Where pull requests are fetched from and comments are posted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Provider {
    /// GitHub through the `gh` CLI
    #[default]
    GitHub,
    /// GitLab merge requests through the `glab` CLI
    GitLab,
}

impl Provider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::GitHub => "github",
            Provider::GitLab => "gitlab",
        }
    }
}

impl FromStr for Provider {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "github" => Ok(Provider::GitHub),
            "gitlab" => Ok(Provider::GitLab),
            other => Err(format!("unknown provider '{}' (expected github or gitlab)", other)),
        }
    }
}

/// What to do when a run fails
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailureMode {
    /// Log only; the pull request stays untouched
    #[default]
    Log,
    /// Also post a short failure comment
    Comment,
}

impl FromStr for FailureMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "log" => Ok(FailureMode::Log),
            "comment" => Ok(FailureMode::Comment),
            other => Err(format!("unknown failure mode '{}' (expected log or comment)", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Json,
    Text,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(LogFormat::Json),
            "text" => Ok(LogFormat::Text),
            other => Err(format!("unknown log format '{}' (expected json or text)", other)),
        }
    }
}

/// Ticket tracker lookup settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TicketConfig {
    /// URL with an `{id}` placeholder, e.g. `https://tracker/rest/api/2/issue/{id}`
    pub url_template: String,
    pub token: Option<String>,
    /// JSON pointer into the response, e.g. `/fields/description`
    pub json_pointer: Option<String>,
}

/// One layer of optional settings. Used for the YAML file and for the
/// environment/flag layer, which clap fills in.
#[derive(Debug, Clone, Default, Deserialize, Args)]
#[serde(default, deny_unknown_fields)]
pub struct ConfigLayer {
    /// YAML configuration file (.yaml or .yml)
    #[arg(long = "config", env = "DRIFT_CONFIG", global = true, value_name = "FILE")]
    #[serde(skip)]
    pub config_file: Option<PathBuf>,

    /// Code host: github or gitlab
    #[arg(long, env = "DRIFT_PROVIDER", global = true)]
    pub provider: Option<String>,

    /// Analysis backend: openai or replay
    #[arg(long, env = "DRIFT_BACKEND", global = true)]
    pub backend: Option<String>,

    /// Model name for the OpenAI backend
    #[arg(long, env = "DRIFT_MODEL", global = true)]
    pub model: Option<String>,

    #[arg(long, env = "DRIFT_OPENAI_BASE_URL", global = true)]
    pub openai_base_url: Option<String>,

    #[arg(long, env = "OPENAI_API_KEY", global = true, hide_env_values = true)]
    #[serde(skip)]
    pub api_key: Option<String>,

    /// Recorded response served by the replay backend
    #[arg(long, env = "DRIFT_REPLAY_FILE", global = true, value_name = "FILE")]
    pub replay_file: Option<PathBuf>,

    #[arg(long, env = "DRIFT_TIMEOUT_SECS", global = true)]
    pub timeout_secs: Option<u64>,

    #[arg(long, env = "DRIFT_MAX_ATTEMPTS", global = true)]
    pub max_attempts: Option<u32>,

    #[arg(long, env = "DRIFT_BACKOFF_BASE_SECS", global = true)]
    pub backoff_base_secs: Option<u64>,

    #[arg(long, env = "DRIFT_BACKOFF_MAX_SECS", global = true)]
    pub backoff_max_secs: Option<u64>,

    #[arg(long, env = "DRIFT_MAX_FILES", global = true)]
    pub max_files: Option<usize>,

    #[arg(long, env = "DRIFT_MAX_CHANGED_LINES", global = true)]
    pub max_changed_lines: Option<usize>,

    #[arg(long, env = "DRIFT_MAX_PAYLOAD_BYTES", global = true)]
    pub max_payload_bytes: Option<usize>,

    #[arg(long, env = "DRIFT_MAX_DIAGRAM_NODES", global = true)]
    pub max_diagram_nodes: Option<usize>,

    /// inline-first or description-first
    #[arg(long, env = "DRIFT_CONTEXT_PRECEDENCE", global = true)]
    pub context_precedence: Option<String>,

    /// Business context supplied by the pipeline environment
    #[arg(long = "context", env = "DRIFT_CONTEXT", global = true)]
    #[serde(skip)]
    pub env_context: Option<String>,

    #[arg(long, env = "DRIFT_TICKET_URL", global = true)]
    pub ticket_url: Option<String>,

    #[arg(long, env = "DRIFT_TICKET_TOKEN", global = true, hide_env_values = true)]
    #[serde(skip)]
    pub ticket_token: Option<String>,

    #[arg(long, env = "DRIFT_TICKET_JSON_POINTER", global = true)]
    pub ticket_json_pointer: Option<String>,

    /// log or comment
    #[arg(long, env = "DRIFT_FAILURE_MODE", global = true)]
    pub failure_mode: Option<String>,

    #[arg(long, env = "DRIFT_LOG_LEVEL", global = true)]
    pub log_level: Option<String>,

    /// json or text
    #[arg(long, env = "DRIFT_LOG_FORMAT", global = true)]
    pub log_format: Option<String>,

    /// Edit the previous review comment instead of adding a new one
    #[arg(long, env = "DRIFT_UPDATE_EXISTING", global = true, value_name = "BOOL")]
    pub update_existing: Option<bool>,
}

impl ConfigLayer {
    /// Fields set in `over` win over fields set here.
    pub fn merge(self, over: ConfigLayer) -> ConfigLayer {
        ConfigLayer {
            config_file: over.config_file.or(self.config_file),
            provider: over.provider.or(self.provider),
            backend: over.backend.or(self.backend),
            model: over.model.or(self.model),
            openai_base_url: over.openai_base_url.or(self.openai_base_url),
            api_key: over.api_key.or(self.api_key),
            replay_file: over.replay_file.or(self.replay_file),
            timeout_secs: over.timeout_secs.or(self.timeout_secs),
            max_attempts: over.max_attempts.or(self.max_attempts),
            backoff_base_secs: over.backoff_base_secs.or(self.backoff_base_secs),
            backoff_max_secs: over.backoff_max_secs.or(self.backoff_max_secs),
            max_files: over.max_files.or(self.max_files),
            max_changed_lines: over.max_changed_lines.or(self.max_changed_lines),
            max_payload_bytes: over.max_payload_bytes.or(self.max_payload_bytes),
            max_diagram_nodes: over.max_diagram_nodes.or(self.max_diagram_nodes),
            context_precedence: over.context_precedence.or(self.context_precedence),
            env_context: over.env_context.or(self.env_context),
            ticket_url: over.ticket_url.or(self.ticket_url),
            ticket_token: over.ticket_token.or(self.ticket_token),
            ticket_json_pointer: over.ticket_json_pointer.or(self.ticket_json_pointer),
            failure_mode: over.failure_mode.or(self.failure_mode),
            log_level: over.log_level.or(self.log_level),
            log_format: over.log_format.or(self.log_format),
            update_existing: over.update_existing.or(self.update_existing),
        }
    }
}

/// Read a YAML configuration file.
pub fn load_file(path: &Path) -> Result<ConfigLayer, DriftError> {
    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase);
    if !matches!(extension.as_deref(), Some("yaml" | "yml")) {
        return Err(DriftError::Config(format!(
            "config file {} must have a .yaml or .yml extension",
            path.display()
        )));
    }

    let metadata = std::fs::metadata(path).map_err(|e| {
        DriftError::Config(format!("cannot read config file {}: {}", path.display(), e))
    })?;
    if metadata.len() > MAX_CONFIG_FILE_BYTES {
        return Err(DriftError::Config(format!(
            "config file {} is larger than 1 MiB",
            path.display()
        )));
    }

    let text = std::fs::read_to_string(path).map_err(|e| {
        DriftError::Config(format!("cannot read config file {}: {}", path.display(), e))
    })?;
    if text.trim().is_empty() {
        return Ok(ConfigLayer::default());
    }
    serde_yaml_ng::from_str(&text)
        .map_err(|e| DriftError::Config(format!("invalid config file {}: {}", path.display(), e)))
}

/// Validated settings for one run
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub provider: Provider,
    pub backend: BackendKind,
    pub model: String,
    pub openai_base_url: String,
    pub api_key: Option<String>,
    pub replay_file: Option<PathBuf>,
    pub retry: RetryPolicy,
    pub diff_limits: DiffLimits,
    pub max_payload_bytes: usize,
    pub max_diagram_nodes: usize,
    pub precedence: ContextPrecedence,
    pub env_context: Option<String>,
    pub ticket: Option<TicketConfig>,
    pub failure_mode: FailureMode,
    pub log_level: String,
    pub log_format: LogFormat,
    pub update_existing: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            provider: Provider::default(),
            backend: BackendKind::OpenAi,
            model: DEFAULT_MODEL.to_string(),
            openai_base_url: DEFAULT_OPENAI_BASE_URL.to_string(),
            api_key: None,
            replay_file: None,
            retry: RetryPolicy::default(),
            diff_limits: DiffLimits::default(),
            max_payload_bytes: 120_000,
            max_diagram_nodes: 12,
            precedence: ContextPrecedence::default(),
            env_context: None,
            ticket: None,
            failure_mode: FailureMode::default(),
            log_level: "info".to_string(),
            log_format: LogFormat::default(),
            update_existing: false,
        }
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

fn parse<T: FromStr<Err = String>>(value: Option<String>, default: T) -> Result<T, DriftError> {
    match non_empty(value) {
        None => Ok(default),
        Some(v) => v.parse().map_err(DriftError::Config),
    }
}

impl AppConfig {
    /// Load the file named by `overrides` (if any) and apply `overrides` on top.
    pub fn load(overrides: ConfigLayer) -> Result<Self, DriftError> {
        let file = match &overrides.config_file {
            Some(path) => load_file(path)?,
            None => ConfigLayer::default(),
        };
        Self::from_layer(file.merge(overrides))
    }

    /// Apply a merged layer over the defaults and validate the result.
    pub fn from_layer(layer: ConfigLayer) -> Result<Self, DriftError> {
        let defaults = AppConfig::default();

        let ticket = match non_empty(layer.ticket_url) {
            None => None,
            Some(url_template) => Some(TicketConfig {
                url_template,
                token: non_empty(layer.ticket_token),
                json_pointer: non_empty(layer.ticket_json_pointer),
            }),
        };

        let config = AppConfig {
            provider: parse(layer.provider, defaults.provider)?,
            backend: parse(layer.backend, defaults.backend)?,
            model: non_empty(layer.model).unwrap_or(defaults.model),
            openai_base_url: non_empty(layer.openai_base_url).unwrap_or(defaults.openai_base_url),
            api_key: non_empty(layer.api_key),
            replay_file: layer.replay_file,
            retry: RetryPolicy {
                max_attempts: layer.max_attempts.unwrap_or(defaults.retry.max_attempts),
                backoff_base: layer
                    .backoff_base_secs
                    .map(Duration::from_secs)
                    .unwrap_or(defaults.retry.backoff_base),
                backoff_max: layer
                    .backoff_max_secs
                    .map(Duration::from_secs)
                    .unwrap_or(defaults.retry.backoff_max),
                timeout: layer
                    .timeout_secs
                    .map(Duration::from_secs)
                    .unwrap_or(defaults.retry.timeout),
            },
            diff_limits: DiffLimits {
                max_files: layer.max_files.unwrap_or(defaults.diff_limits.max_files),
                max_changed_lines: layer
                    .max_changed_lines
                    .unwrap_or(defaults.diff_limits.max_changed_lines),
            },
            max_payload_bytes: layer.max_payload_bytes.unwrap_or(defaults.max_payload_bytes),
            max_diagram_nodes: layer.max_diagram_nodes.unwrap_or(defaults.max_diagram_nodes),
            precedence: parse(layer.context_precedence, defaults.precedence)?,
            env_context: non_empty(layer.env_context),
            ticket,
            failure_mode: parse(layer.failure_mode, defaults.failure_mode)?,
            log_level: non_empty(layer.log_level).unwrap_or(defaults.log_level),
            log_format: parse(layer.log_format, defaults.log_format)?,
            update_existing: layer.update_existing.unwrap_or(defaults.update_existing),
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), DriftError> {
        let fail = |msg: &str| -> Result<(), DriftError> { Err(DriftError::Config(msg.to_string())) };

        if self.retry.timeout.is_zero() {
            return fail("timeout_secs must be greater than 0");
        }
        if self.retry.max_attempts < 1 {
            return fail("max_attempts must be at least 1");
        }
        if self.retry.backoff_max < self.retry.backoff_base {
            return fail("backoff_max_secs must not be smaller than backoff_base_secs");
        }
        if self.diff_limits.max_files == 0 || self.diff_limits.max_changed_lines == 0 {
            return fail("max_files and max_changed_lines must be greater than 0");
        }
        if self.max_payload_bytes == 0 {
            return fail("max_payload_bytes must be greater than 0");
        }
        if self.max_diagram_nodes < 2 {
            return fail("max_diagram_nodes must be at least 2");
        }
        match self.backend {
            BackendKind::OpenAi if self.api_key.is_none() => {
                return fail("the openai backend requires OPENAI_API_KEY");
            }
            BackendKind::Replay if self.replay_file.is_none() => {
                return fail("the replay backend requires DRIFT_REPLAY_FILE");
            }
            _ => {}
        }
        if let Some(ticket) = &self.ticket
            && !ticket.url_template.contains("{id}")
        {
            return fail("ticket_url must contain an {id} placeholder");
        }
        Ok(())
    }

    /// Human-readable settings with secrets masked.
    pub fn describe(&self) -> String {
        let set = |value: bool| if value { "set" } else { "not set" };
        let mut out = String::new();
        let _ = writeln!(out, "provider:            {}", self.provider.as_str());
        let _ = writeln!(
            out,
            "backend:             {}",
            match self.backend {
                BackendKind::OpenAi => "openai",
                BackendKind::Replay => "replay",
            }
        );
        let _ = writeln!(out, "model:               {}", self.model);
        let _ = writeln!(out, "openai base url:     {}", self.openai_base_url);
        let _ = writeln!(out, "api key:             {}", set(self.api_key.is_some()));
        if let Some(path) = &self.replay_file {
            let _ = writeln!(out, "replay file:         {}", path.display());
        }
        let _ = writeln!(out, "timeout:             {:?}", self.retry.timeout);
        let _ = writeln!(
            out,
            "attempts:            {} (backoff {:?} to {:?})",
            self.retry.max_attempts, self.retry.backoff_base, self.retry.backoff_max
        );
        let _ = writeln!(
            out,
            "diff limits:         {} files, {} changed lines",
            self.diff_limits.max_files, self.diff_limits.max_changed_lines
        );
        let _ = writeln!(out, "max payload bytes:   {}", self.max_payload_bytes);
        let _ = writeln!(out, "max diagram nodes:   {}", self.max_diagram_nodes);
        let _ = writeln!(out, "context precedence:  {}", self.precedence.as_str());
        let _ = writeln!(out, "env context:         {}", set(self.env_context.is_some()));
        match &self.ticket {
            None => {
                let _ = writeln!(out, "ticket lookup:       disabled");
            }
            Some(ticket) => {
                let _ = writeln!(out, "ticket lookup:       {}", ticket.url_template);
                let _ = writeln!(out, "ticket token:        {}", set(ticket.token.is_some()));
            }
        }
        let _ = writeln!(out, "failure mode:        {:?}", self.failure_mode);
        let _ = writeln!(out, "log:                 {} ({:?})", self.log_level, self.log_format);
        let _ = writeln!(out, "update existing:     {}", self.update_existing);
        out
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    fn with_key() -> ConfigLayer {
        ConfigLayer {
            api_key: Some("sk-test".to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn defaults_apply_when_nothing_is_set() {
        let config = AppConfig::from_layer(with_key()).unwrap();
        assert_eq!(config.model, "gpt-5.2");
        assert_eq!(config.retry, RetryPolicy::default());
        assert_eq!(config.diff_limits, DiffLimits::default());
        assert_eq!(config.max_payload_bytes, 120_000);
        assert_eq!(config.max_diagram_nodes, 12);
        assert_eq!(config.precedence, ContextPrecedence::InlineFirst);
        assert_eq!(config.failure_mode, FailureMode::Log);
        assert_eq!(config.log_format, LogFormat::Json);
        assert_eq!(config.provider, Provider::GitHub);
        assert!(config.ticket.is_none());
    }

    #[test]
    fn file_values_are_overridden_by_flags() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(
            file,
            "model: gpt-4.1\nmax_attempts: 5\ncontext_precedence: description-first\nfailure_mode: comment"
        )
        .unwrap();

        let overrides = ConfigLayer {
            config_file: Some(file.path().to_path_buf()),
            model: Some("gpt-5.2-mini".to_string()),
            ..with_key()
        };
        let config = AppConfig::load(overrides).unwrap();

        assert_eq!(config.model, "gpt-5.2-mini");
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.precedence, ContextPrecedence::DescriptionFirst);
        assert_eq!(config.failure_mode, FailureMode::Comment);
    }

    #[test]
    fn config_file_must_be_yaml() {
        let file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        let err = load_file(file.path()).unwrap_err();
        assert!(matches!(err, DriftError::Config(_)));
    }

    #[test]
    fn unknown_file_keys_are_rejected() {
        let mut file = tempfile::Builder::new().suffix(".yml").tempfile().unwrap();
        writeln!(file, "modle: typo").unwrap();
        assert!(matches!(load_file(file.path()), Err(DriftError::Config(_))));
    }

    #[test]
    fn invalid_values_fail_validation() {
        let cases = [
            ConfigLayer {
                timeout_secs: Some(0),
                ..with_key()
            },
            ConfigLayer {
                max_attempts: Some(0),
                ..with_key()
            },
            ConfigLayer {
                max_diagram_nodes: Some(1),
                ..with_key()
            },
            ConfigLayer {
                max_files: Some(0),
                ..with_key()
            },
            ConfigLayer {
                backend: Some("claude".to_string()),
                ..with_key()
            },
            ConfigLayer {
                provider: Some("bitbucket".to_string()),
                ..with_key()
            },
            ConfigLayer {
                log_format: Some("xml".to_string()),
                ..with_key()
            },
            ConfigLayer {
                ticket_url: Some("https://tracker.example/issue".to_string()),
                ..with_key()
            },
            ConfigLayer::default(),
            ConfigLayer {
                backend: Some("replay".to_string()),
                ..Default::default()
            },
        ];
        for layer in cases {
            let result = AppConfig::from_layer(layer.clone());
            assert!(
                matches!(result, Err(DriftError::Config(_))),
                "expected config error for {:?}",
                layer
            );
        }
    }

    #[test]
    fn ticket_settings_are_collected() {
        let layer = ConfigLayer {
            ticket_url: Some("https://tracker.example/issue/{id}".to_string()),
            ticket_token: Some("secret".to_string()),
            ticket_json_pointer: Some("/fields/description".to_string()),
            ..with_key()
        };
        let config = AppConfig::from_layer(layer).unwrap();
        let ticket = config.ticket.as_ref().unwrap();
        assert_eq!(ticket.json_pointer.as_deref(), Some("/fields/description"));

        let described = config.describe();
        assert!(described.contains("ticket token:        set"));
        assert!(!described.contains("secret"));
        assert!(!described.contains("sk-test"));
    }

    #[test]
    fn gitlab_provider_from_file() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(file, "provider: GitLab").unwrap();

        let config = AppConfig::load(ConfigLayer {
            config_file: Some(file.path().to_path_buf()),
            ..with_key()
        })
        .unwrap();
        assert_eq!(config.provider, Provider::GitLab);
        assert!(config.describe().starts_with("provider:            gitlab\n"));
    }

    #[test]
    fn blank_env_context_counts_as_absent() {
        let layer = ConfigLayer {
            env_context: Some("   ".to_string()),
            ..with_key()
        };
        assert!(AppConfig::from_layer(layer).unwrap().env_context.is_none());
    }
}
