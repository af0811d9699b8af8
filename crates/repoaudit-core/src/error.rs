use std::path::PathBuf;

use thiserror::Error;

/// Which half of the skip/check protocol a backend call belonged to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckPhase {
    Skip,
    Check,
}

impl std::fmt::Display for CheckPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Skip => f.write_str("skip"),
            Self::Check => f.write_str("check"),
        }
    }
}

/// Errors surfaced by the audit pipeline.
#[derive(Debug, Error)]
pub enum AuditError {
    /// The input record's shape does not match any configured namespace.
    #[error("failed to detect namespace from data")]
    UnknownNamespace,
    /// The namespace has no report property template.
    #[error("no report properties are defined for namespace `{namespace}`")]
    UnknownReportProperties { namespace: String },
    #[error("failed to load policies from {}: {source}", path.display())]
    PolicyLoad {
        path: PathBuf,
        #[source]
        source: anyhow::Error,
    },
    #[error("no policy .rego files found in {paths:?}")]
    NoPoliciesFound { paths: Vec<PathBuf> },
    #[error("{phase} query `{query}` failed: {source:#}")]
    BackendEvaluation {
        query: String,
        phase: CheckPhase,
        #[source]
        source: anyhow::Error,
    },
    #[error("result for `{uid}` has no matching rule in the report")]
    OrphanResult { uid: String },
    #[error("failed to render report: {0}")]
    Render(String),
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("audit task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl AuditError {
    /// Whether the pipeline may continue past this error for the current input.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::UnknownNamespace | Self::UnknownReportProperties { .. }
        )
    }
}

pub type AuditResult<T> = Result<T, AuditError>;
