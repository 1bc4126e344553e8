//! Error types shared by the store, the query engine and the rule overlay.

use std::time::Duration;

use thiserror::Error;

use crate::rules::EvalReport;

/// Result alias used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Top-level error for every workbench operation.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error while reading or writing a file.
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    /// Malformed exposition text.
    #[error("line {line}: {message}")]
    InputFormat { line: usize, message: String },
    /// Malformed rule file.
    #[error("yaml: {0}")]
    Yaml(#[from] serde_yaml::Error),
    /// Malformed query-result document.
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
    /// Invalid rule file glob.
    #[error("invalid pattern: {0}")]
    Pattern(#[from] glob::PatternError),
    /// Failure fetching a scrape target.
    #[error("http: {0}")]
    Http(#[from] reqwest::Error),
    /// Query construction or evaluation failure.
    #[error(transparent)]
    Query(#[from] QueryError),
    /// A rule failed during an evaluation pass.
    #[error(transparent)]
    RuleEvaluation(#[from] RuleEvaluationError),
    /// Bad arguments to a mutation command; the store was not touched.
    #[error("{0}")]
    Usage(String),
}

impl Error {
    pub(crate) fn input(line: usize, message: impl Into<String>) -> Self {
        Self::InputFormat { line, message: message.into() }
    }

    pub(crate) fn usage(message: impl Into<String>) -> Self {
        Self::Usage(message.into())
    }
}

/// Errors reported for a single query.
#[derive(Debug, Clone, Error)]
pub enum QueryError {
    /// Bad expression syntax or matcher regex.
    #[error("parse error: {0}")]
    Construction(String),
    /// Runtime failure while evaluating a well-formed expression.
    #[error("evaluation error: {0}")]
    Evaluation(String),
    /// The per-query deadline elapsed.
    #[error("query timed out after {0:?}")]
    Timeout(Duration),
}

/// A rule that aborted an evaluation pass.
///
/// Samples written by rules evaluated earlier in the same pass are kept in the
/// store; `partial` counts them.
#[derive(Debug, Error)]
#[error("rule {rule:?}: {reason}")]
pub struct RuleEvaluationError {
    pub rule: String,
    pub reason: String,
    pub partial: EvalReport,
}
