//! Repository traits describing persistence adapters.

use std::fmt;

use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

use crate::application::specification::{SpecError, Specification};
use crate::domain::schema::{Entity, SchemaError};
use crate::domain::types::EntityKind;

/// Operation a repository or setup call was performing when it failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RepoOperation {
    GetById,
    Query,
    Count,
    Add,
    Update,
    Delete,
    ExecuteRaw,
    Connect,
    Setup,
}

impl RepoOperation {
    pub fn as_str(self) -> &'static str {
        match self {
            RepoOperation::GetById => "get_by_id",
            RepoOperation::Query => "query",
            RepoOperation::Count => "count",
            RepoOperation::Add => "add",
            RepoOperation::Update => "update",
            RepoOperation::Delete => "delete",
            RepoOperation::ExecuteRaw => "execute_raw",
            RepoOperation::Connect => "connect",
            RepoOperation::Setup => "setup",
        }
    }
}

impl fmt::Display for RepoOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum RepoError {
    #[error("{kind} `{id}` was modified concurrently (expected version {expected_version})")]
    ConcurrencyConflict {
        kind: EntityKind,
        id: Uuid,
        expected_version: i64,
    },
    #[error("backend error during {operation} on {kind}: {source}")]
    Backend {
        operation: RepoOperation,
        /// Entity kind, or `raw` for privileged statements and setup scripts.
        kind: &'static str,
        #[source]
        source: sqlx::Error,
    },
    #[error("stored {kind} row could not be mapped: {source}")]
    Decode {
        kind: EntityKind,
        #[source]
        source: SchemaError,
    },
    #[error("configuration error: {message}")]
    Configuration { message: String },
    #[error("invalid specification: {0}")]
    InvalidSpecification(#[from] SpecError),
}

impl RepoError {
    pub fn backend(operation: RepoOperation, kind: &'static str, source: sqlx::Error) -> Self {
        Self::Backend {
            operation,
            kind,
            source,
        }
    }

    pub fn decode(kind: EntityKind, source: SchemaError) -> Self {
        Self::Decode { kind, source }
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Whether the backend rejected the statement with a unique-key violation.
    pub fn is_unique_violation(&self) -> bool {
        match self {
            RepoError::Backend {
                source: sqlx::Error::Database(db),
                ..
            } => db.is_unique_violation(),
            _ => false,
        }
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, RepoError::ConcurrencyConflict { .. })
    }
}

/// Storage for one entity type.
///
/// Every backend implements the same observable contract: identical specifications
/// return identical sequences, a missing id is `Ok(None)` rather than an error, and a
/// stale `update` fails with [`RepoError::ConcurrencyConflict`].
#[async_trait]
pub trait Repository<T: Entity>: Send + Sync {
    async fn get_by_id(&self, id: Uuid) -> Result<Option<T>, RepoError>;

    async fn query(&self, spec: &Specification<T>) -> Result<Vec<T>, RepoError>;

    async fn first_or_default(&self, spec: &Specification<T>) -> Result<Option<T>, RepoError> {
        let first = spec.clone().first();
        Ok(self.query(&first).await?.into_iter().next())
    }

    /// Number of rows matching the predicate; ordering and window are ignored.
    async fn count(&self, spec: &Specification<T>) -> Result<u64, RepoError>;

    /// Store a new entity. A nil id is replaced with a fresh one; the returned value
    /// carries the stored header.
    async fn add(&self, entity: T) -> Result<T, RepoError>;

    /// Replace the stored fields when the entity's version is still current. Owned
    /// collections that are not loaded keep their stored contents.
    async fn update(&self, entity: T) -> Result<T, RepoError>;

    /// Remove by id. Deleting an absent id succeeds.
    async fn delete(&self, id: Uuid) -> Result<(), RepoError>;

    /// Run a raw statement against the backend and return the affected row count.
    ///
    /// Privileged: callers are trusted, the text is not inspected, and backend errors
    /// come back unchanged inside [`RepoError::Backend`].
    async fn execute_raw(&self, statement: &str) -> Result<u64, RepoError>;
}
