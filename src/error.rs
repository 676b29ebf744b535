//! Error types for the rubric engine
//!
//! Authoring-time problems (bad condition text, unknown rule ids) surface here.
//! Scoring itself never fails: evaluation errors collapse to `false`.

use thiserror::Error;

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Rubric engine error types
#[derive(Error, Debug)]
pub enum Error {
    /// A rule clause could not be split into predicate and score
    #[error("Invalid condition clause `{clause}`: {reason}")]
    ConditionSyntax {
        /// Offending clause text
        clause: String,
        /// What is wrong with it
        reason: String,
    },

    /// Predicate parsing error
    #[error("Predicate parse error: {0}")]
    ParseError(String),

    /// Caller supplied an unusable argument
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Storage error (Parquet/Arrow)
    #[error("Storage error: {0}")]
    StorageError(String),

    /// No analysis with this id is known
    #[error("Analysis not found: {0}")]
    AnalysisNotFound(String),

    /// Analysis state machine violation
    #[error("Invalid status transition for analysis {analysis_id}: {from} -> {to}")]
    InvalidTransition {
        /// Analysis identifier
        analysis_id: String,
        /// Current status
        from: String,
        /// Requested status
        to: String,
    },

    /// Result cache error
    #[error("Cache error: {0}")]
    CacheError(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Arrow/Parquet error
    #[error("Arrow error: {0}")]
    Arrow(#[from] arrow::error::ArrowError),

    /// JSON (de)serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl Error {
    pub(crate) fn condition(clause: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ConditionSyntax {
            clause: clause.into(),
            reason: reason.into(),
        }
    }
}
