pub mod context;
pub mod diagram;
pub mod diff;
pub mod format;
pub mod github;
pub mod gitlab;
pub mod prompt;
pub mod report;
pub mod types;
