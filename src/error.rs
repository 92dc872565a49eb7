//! Error taxonomy for a review run.

use std::time::Duration;

use thiserror::Error;

/// Errors that can end (or, for backend errors, interrupt) a review run.
#[derive(Error, Debug)]
pub enum DriftError {
    /// Configuration could not be loaded or failed validation
    #[error("configuration error: {0}")]
    Config(String),

    /// The diff blob could not be split into file sections
    #[error("malformed diff: {0}")]
    MalformedDiff(String),

    /// Backend failed in a way that may succeed on a later attempt
    #[error("transient backend error: {0}")]
    TransientBackend(String),

    /// Backend asked us to slow down
    #[error("backend rate limit hit")]
    RateLimit { retry_after: Option<Duration> },

    /// Backend rejected our credentials
    #[error("backend authentication failed: {0}")]
    Auth(String),

    /// Backend answered, but not with anything we can use
    #[error("malformed backend response: {0}")]
    MalformedBackendResponse(String),

    /// Model output could not be decoded into a report
    #[error("could not parse analysis report: {0}")]
    ReportParse(String),

    /// A diff source or comment sink adapter failed
    #[error("{0}")]
    Source(String),
}

impl DriftError {
    /// Whether the analysis client should try the same request again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            DriftError::TransientBackend(_) | DriftError::RateLimit { .. }
        )
    }

    /// Process exit code for a run that ended with this error.
    pub fn exit_code(&self) -> i32 {
        match self {
            DriftError::Config(_) => 2,
            DriftError::MalformedDiff(_) => 3,
            DriftError::Auth(_) => 4,
            DriftError::TransientBackend(_)
            | DriftError::RateLimit { .. }
            | DriftError::MalformedBackendResponse(_) => 5,
            DriftError::ReportParse(_) => 6,
            DriftError::Source(_) => 7,
        }
    }

    /// Short machine-readable label used in logs and failure comments.
    pub fn code(&self) -> &'static str {
        match self {
            DriftError::Config(_) => "config",
            DriftError::MalformedDiff(_) => "malformed-diff",
            DriftError::TransientBackend(_) => "backend-unavailable",
            DriftError::RateLimit { .. } => "backend-rate-limited",
            DriftError::Auth(_) => "backend-auth",
            DriftError::MalformedBackendResponse(_) => "backend-malformed-response",
            DriftError::ReportParse(_) => "report-parse",
            DriftError::Source(_) => "source",
        }
    }
}

impl From<reqwest::Error> for DriftError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() || err.is_request() {
            DriftError::TransientBackend(err.to_string())
        } else {
            DriftError::MalformedBackendResponse(err.to_string())
        }
    }
}

/// A non-fatal loss of input quality, reported alongside the analysis.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Degradation {
    pub stage: &'static str,
    pub message: String,
}

impl Degradation {
    pub fn new(stage: &'static str, message: impl Into<String>) -> Self {
        Self {
            stage,
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_transient_and_rate_limit_are_retryable() {
        assert!(DriftError::TransientBackend("503".into()).is_retryable());
        assert!(DriftError::RateLimit { retry_after: None }.is_retryable());
        assert!(!DriftError::Auth("401".into()).is_retryable());
        assert!(!DriftError::MalformedBackendResponse("x".into()).is_retryable());
        assert!(!DriftError::ReportParse("x".into()).is_retryable());
    }

    #[test]
    fn report_parse_has_its_own_exit_code() {
        let parse = DriftError::ReportParse("garbage".into()).exit_code();
        let others = [
            DriftError::Config(String::new()).exit_code(),
            DriftError::MalformedDiff(String::new()).exit_code(),
            DriftError::Auth(String::new()).exit_code(),
            DriftError::TransientBackend(String::new()).exit_code(),
            DriftError::Source(String::new()).exit_code(),
        ];
        assert!(!others.contains(&parse));
    }
}
