use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type used across the prodstat library crates.
pub type ProdstatResult<T> = Result<T, ProdstatError>;

/// Errors returned by prodstat operations.
#[derive(Debug, Error)]
pub enum ProdstatError {
    #[error(
        "run timestamp '{requested}' does not match any run for {production_issue} under {search_root} (candidates: {candidates})"
    )]
    AmbiguousRun {
        search_root: String,
        production_issue: String,
        requested: String,
        candidates: String,
    },
    #[error("no run directory under {search_root} references {production_issue}")]
    NoRunFound {
        search_root: String,
        production_issue: String,
    },
    #[error("cannot register workflow under production issue '{production_issue}': {reason}")]
    Registration {
        production_issue: String,
        reason: String,
    },
    #[error("malformed record {record}: {reason}")]
    MalformedRecord { record: String, reason: String },
    #[error("mapping key '{key}' is not present in {target}")]
    UnknownMappingKey { key: String, target: String },
    #[error(
        "issue tracker unavailable: {reason} (check the tracker url and re-authenticate with a fresh token or ~/.netrc entry)"
    )]
    TrackerUnavailable { reason: String },
    #[error("issue tracker rejected {operation} with status {status}: {body}")]
    TrackerRejected {
        operation: String,
        status: u16,
        body: String,
    },
    #[error("issue '{0}' not found")]
    IssueNotFound(String),
    #[error("{source_name} source unavailable: {reason}")]
    SourceUnavailable { source_name: String, reason: String },
    #[error("invalid {kind} record in {location}: {reason}")]
    InvalidRecord {
        kind: String,
        location: String,
        reason: String,
    },
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("failed to access {path}: {source}")]
    File {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),
}

impl ProdstatError {
    pub fn file(path: impl fmt::Display, source: std::io::Error) -> Self {
        Self::File {
            path: path.to_string(),
            source,
        }
    }

    pub fn tracker_unavailable(reason: impl Into<String>) -> Self {
        Self::TrackerUnavailable {
            reason: reason.into(),
        }
    }

    pub fn source_unavailable(source_name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::SourceUnavailable {
            source_name: source_name.into(),
            reason: reason.into(),
        }
    }

    /// Process exit code reported by the `prodstat` binary for this error.
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::AmbiguousRun { .. } => 3,
            Self::NoRunFound { .. } => 4,
            Self::Registration { .. } => 5,
            Self::TrackerUnavailable { .. } => 6,
            Self::SourceUnavailable { .. } => 7,
            _ => 1,
        }
    }
}

/// Category of a non-fatal condition collected during a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiagnosticKind {
    MalformedRecord,
    UnknownMappingKey,
    Registration,
    Skipped,
}

impl DiagnosticKind {
    pub fn label(self) -> &'static str {
        match self {
            Self::MalformedRecord => "malformed_record",
            Self::UnknownMappingKey => "unknown_mapping_key",
            Self::Registration => "registration",
            Self::Skipped => "skipped",
        }
    }
}

/// Non-fatal condition reported in the end-of-run summary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub kind: DiagnosticKind,
    pub subject: String,
    pub message: String,
}

impl Diagnostic {
    pub fn new(kind: DiagnosticKind, subject: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            subject: subject.into(),
            message: message.into(),
        }
    }

    /// Wraps an error that the caller decided not to abort on.
    pub fn from_error(subject: impl Into<String>, error: &ProdstatError) -> Self {
        let kind = match error {
            ProdstatError::MalformedRecord { .. } => DiagnosticKind::MalformedRecord,
            ProdstatError::UnknownMappingKey { .. } => DiagnosticKind::UnknownMappingKey,
            ProdstatError::Registration { .. }
            | ProdstatError::NoRunFound { .. }
            | ProdstatError::AmbiguousRun { .. } => DiagnosticKind::Registration,
            _ => DiagnosticKind::Skipped,
        };
        Self::new(kind, subject, error.to_string())
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}: {}", self.kind.label(), self.subject, self.message)
    }
}
