//! First-run schema setup.
//!
//! Every backend keeps a single-row `schema_state` marker. A database without the
//! marker is uninitialized; [`SetupRunner::initialize`] runs the idempotent backend
//! script and then inserts the marker, so the marker's primary key decides a race
//! between processes initializing the same database.

mod mysql;
mod postgres;
mod sqlite;

pub use mysql::MySqlSetup;
pub use postgres::PgSetup;
pub use sqlite::SqliteSetup;

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use time::OffsetDateTime;
use tracing::{debug, info, warn};

use crate::application::repos::RepoError;
use crate::infra::db::DbBackend;

/// Version written to the marker by this build's scripts.
pub const SCHEMA_VERSION: i64 = 1;

const MAX_ATTEMPTS: u32 = 3;
const INITIAL_BACKOFF: Duration = Duration::from_millis(200);

/// Contents of the `schema_state` row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchemaMarker {
    pub schema_version: i64,
    pub initialized_at: OffsetDateTime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitOutcome {
    /// This call ran the script and wrote the marker.
    Initialized,
    /// The marker already existed or a concurrent initializer wrote it first.
    AlreadyInitialized,
}

impl fmt::Display for InitOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            InitOutcome::Initialized => "initialized",
            InitOutcome::AlreadyInitialized => "already initialized",
        })
    }
}

#[derive(Debug, Error)]
pub enum SetupError {
    #[error(transparent)]
    Backend(#[from] RepoError),
    #[error("schema marker still missing after {attempts} setup attempts")]
    RaceUnresolved { attempts: u32 },
    #[error("timed out after {seconds}s waiting for the setup lock")]
    LockTimeout { seconds: u64 },
}

impl SetupError {
    /// Lock contention that a later attempt may not hit.
    pub fn is_transient(&self) -> bool {
        match self {
            SetupError::LockTimeout { .. } => true,
            SetupError::Backend(RepoError::Backend { source, .. }) => is_transient_driver(source),
            _ => false,
        }
    }
}

fn is_transient_driver(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::PoolTimedOut => true,
        // SQLITE_BUSY, SQLITE_LOCKED, SQLITE_BUSY_SNAPSHOT, then the SQLSTATEs for
        // serialization failure and deadlock.
        sqlx::Error::Database(db) => db
            .code()
            .is_some_and(|code| matches!(&*code, "5" | "6" | "517" | "40001" | "40P01")),
        _ => false,
    }
}

/// Per-backend schema setup.
#[async_trait]
pub trait SetupRunner: Send + Sync {
    fn backend(&self) -> DbBackend;

    /// The stored marker, or `None` on an uninitialized database. Never writes.
    async fn marker(&self) -> Result<Option<SchemaMarker>, SetupError>;

    async fn is_first_run(&self) -> Result<bool, SetupError> {
        Ok(self.marker().await?.is_none())
    }

    /// Run the schema script and write the marker.
    async fn initialize(&self) -> Result<InitOutcome, SetupError>;
}

/// Bring the database to the initialized state, tolerating concurrent initializers.
pub async fn ensure_ready(runner: &dyn SetupRunner) -> Result<InitOutcome, SetupError> {
    let backend = runner.backend();
    let mut backoff = INITIAL_BACKOFF;

    for attempt in 1..=MAX_ATTEMPTS {
        if let Some(marker) = runner.marker().await? {
            info!(
                backend = %backend,
                schema_version = marker.schema_version,
                initialized_at = %marker.initialized_at,
                "Database already initialized"
            );
            if marker.schema_version > SCHEMA_VERSION {
                warn!(
                    stored = marker.schema_version,
                    supported = SCHEMA_VERSION,
                    "Database schema is newer than this build"
                );
            }
            return Ok(InitOutcome::AlreadyInitialized);
        }

        match runner.initialize().await {
            Ok(InitOutcome::Initialized) => {
                info!(backend = %backend, schema_version = SCHEMA_VERSION, "Database initialized");
                return Ok(InitOutcome::Initialized);
            }
            Ok(InitOutcome::AlreadyInitialized) => {
                debug!(backend = %backend, attempt, "Concurrent setup won; re-checking marker");
            }
            Err(err) if err.is_transient() && attempt < MAX_ATTEMPTS => {
                warn!(backend = %backend, attempt, error = %err, "Setup attempt failed; retrying");
                tokio::time::sleep(backoff).await;
                backoff *= 2;
            }
            Err(err) => return Err(err),
        }
    }

    Err(SetupError::RaceUnresolved {
        attempts: MAX_ATTEMPTS,
    })
}

/// Statements of a setup script: `--` comment lines dropped, split on `;`.
pub(crate) fn statements(script: &str) -> Vec<String> {
    let body: String = script
        .lines()
        .filter(|line| !line.trim_start().starts_with("--"))
        .collect::<Vec<_>>()
        .join("\n");
    body.split(';')
        .map(str::trim)
        .filter(|statement| !statement.is_empty())
        .map(str::to_string)
        .collect()
}
