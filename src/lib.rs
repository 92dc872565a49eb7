//! Drift: architectural impact reviews for pull requests.
//!
//! A run normalizes the diff, resolves business context, asks a language
//! model for an analysis, and renders the answer as a review comment with
//! before/after component diagrams.

pub mod config;
pub mod domain;
pub mod error;
pub mod llm;
pub mod logging;
pub mod pipeline;
pub mod sink;
pub mod ticket;

pub use config::AppConfig;
pub use error::DriftError;
pub use pipeline::{PipelineInput, PipelineOutcome};
