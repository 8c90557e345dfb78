//! Error taxonomy shared by the registry, the queue, the workers, and the
//! HTTP layer.
//!
//! Library code returns [`KbError`]; the binary entrypoints wrap it in
//! `anyhow`. Every variant has a stable [`kind`](KbError::kind) string, which
//! is what a failed job stores in its `error.kind` field.

use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum KbError {
    /// Bad config bounds, missing required field, malformed request.
    #[error("validation error: {0}")]
    Validation(String),

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    /// Search or chat against a project with zero chunks.
    #[error("project {0} has not been indexed yet")]
    NotIndexed(String),

    #[error("unsupported format: {0}")]
    UnsupportedFormat(String),

    /// Memory engine or language backend failure, including empty answers.
    #[error("upstream error: {0}")]
    Upstream(String),

    #[error("job exceeded its {0}s execution timeout")]
    JobTimeout(u64),

    #[error("storage error at {path:?}: {message}")]
    Storage { path: PathBuf, message: String },

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, KbError>;

impl KbError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn project_not_found(id: impl Into<String>) -> Self {
        Self::NotFound {
            entity: "project",
            id: id.into(),
        }
    }

    pub fn job_not_found(id: impl Into<String>) -> Self {
        Self::NotFound {
            entity: "job",
            id: id.into(),
        }
    }

    pub fn upstream(msg: impl Into<String>) -> Self {
        Self::Upstream(msg.into())
    }

    pub fn storage(path: impl Into<PathBuf>, err: impl std::fmt::Display) -> Self {
        Self::Storage {
            path: path.into(),
            message: err.to_string(),
        }
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Stable machine-readable kind, used in job records, HTTP error bodies,
    /// and metric labels.
    pub fn kind(&self) -> &'static str {
        match self {
            KbError::Validation(_) => "validation_error",
            KbError::NotFound { .. } => "not_found",
            KbError::NotIndexed(_) => "not_indexed",
            KbError::UnsupportedFormat(_) => "unsupported_format",
            KbError::Upstream(_) => "upstream_error",
            KbError::JobTimeout(_) => "job_timeout",
            KbError::Storage { .. } => "storage_error",
            KbError::Database(_) => "database_error",
            KbError::Internal(_) => "internal_error",
        }
    }
}

impl From<serde_json::Error> for KbError {
    fn from(err: serde_json::Error) -> Self {
        KbError::Internal(format!("json: {}", err))
    }
}
