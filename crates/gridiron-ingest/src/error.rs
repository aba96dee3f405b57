//! Error taxonomy for the ingestion pipeline.

use gridiron_storage::{FetchError, ObjectStoreError};
use thiserror::Error;

pub type IngestResult<T> = Result<T, IngestError>;

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl IngestError {
    /// Short label used in logs and outcome messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Configuration(_) => "configuration",
            Self::NotFound(_) => "not_found",
            Self::Fetch(_) => "fetch",
            Self::Validation(_) => "validation",
            Self::Storage(_) => "storage",
        }
    }
}

impl From<ObjectStoreError> for IngestError {
    fn from(err: ObjectStoreError) -> Self {
        Self::Storage(StorageError::Object(err))
    }
}

impl From<sqlx::Error> for IngestError {
    fn from(err: sqlx::Error) -> Self {
        Self::Storage(StorageError::Database(err))
    }
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("object store: {0}")]
    Object(#[from] ObjectStoreError),
    #[error("database: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("archive encoding: {0}")]
    Encode(String),
    #[error("backend: {0}")]
    Backend(String),
}

/// Every problem found in one batch, reported together.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("validation failed for {dataset}: {}", .problems.join("; "))]
pub struct ValidationError {
    pub dataset: String,
    pub missing: Vec<String>,
    pub all_null: Vec<String>,
    pub problems: Vec<String>,
}

impl ValidationError {
    pub fn new(dataset: impl Into<String>) -> Self {
        Self {
            dataset: dataset.into(),
            missing: Vec::new(),
            all_null: Vec::new(),
            problems: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.problems.is_empty()
    }

    pub fn push(&mut self, problem: impl Into<String>) {
        self.problems.push(problem.into());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_error_lists_every_problem() {
        let mut err = ValidationError::new("rosters");
        err.push("missing required field: team");
        err.push("required field entirely null: season");
        assert_eq!(
            err.to_string(),
            "validation failed for rosters: missing required field: team; required field entirely null: season"
        );
        assert_eq!(IngestError::from(err).kind(), "validation");
    }
}
