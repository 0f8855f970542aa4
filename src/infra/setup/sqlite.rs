use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnection, SqlitePool};
use tracing::{debug, instrument};

use crate::application::repos::{RepoError, RepoOperation};
use crate::domain::values::now_micros;
use crate::infra::db::DbBackend;
use crate::infra::db::sqlite::{execute_raw, from_micros, to_micros};

use super::{InitOutcome, SCHEMA_VERSION, SchemaMarker, SetupError, SetupRunner, statements};

pub(super) const SCRIPT: &str = include_str!("sql/sqlite.sql");

fn setup_error(source: sqlx::Error) -> SetupError {
    SetupError::Backend(RepoError::backend(RepoOperation::Setup, "raw", source))
}

/// Setup for SQLite; the script and marker run in one `BEGIN IMMEDIATE` transaction.
pub struct SqliteSetup {
    pool: SqlitePool,
}

impl SqliteSetup {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

async fn read_marker(conn: &mut SqliteConnection) -> Result<Option<SchemaMarker>, SetupError> {
    let tables: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = 'schema_state'",
    )
    .fetch_one(&mut *conn)
    .await
    .map_err(setup_error)?;
    if tables == 0 {
        return Ok(None);
    }

    let row: Option<(i64, i64)> =
        sqlx::query_as("SELECT schema_version, initialized_at FROM schema_state WHERE id = 1")
            .fetch_optional(&mut *conn)
            .await
            .map_err(setup_error)?;

    row.map(|(schema_version, micros)| {
        let initialized_at = from_micros("initialized_at", micros).map_err(|err| {
            SetupError::Backend(RepoError::configuration(format!(
                "schema marker is corrupt: {err}"
            )))
        })?;
        Ok(SchemaMarker {
            schema_version,
            initialized_at,
        })
    })
    .transpose()
}

/// Script and marker inside an open transaction.
async fn apply(conn: &mut SqliteConnection) -> Result<InitOutcome, SetupError> {
    if read_marker(conn).await?.is_some() {
        return Ok(InitOutcome::AlreadyInitialized);
    }

    for statement in statements(SCRIPT) {
        execute_raw(&mut *conn, &statement)
            .await
            .map_err(setup_error)?;
    }

    let inserted = sqlx::query(
        "INSERT INTO schema_state (id, schema_version, initialized_at) VALUES (1, ?, ?)",
    )
    .bind(SCHEMA_VERSION)
    .bind(to_micros(now_micros()))
    .execute(&mut *conn)
    .await;

    match inserted {
        Ok(_) => Ok(InitOutcome::Initialized),
        Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
            Ok(InitOutcome::AlreadyInitialized)
        }
        Err(err) => Err(setup_error(err)),
    }
}

#[async_trait]
impl SetupRunner for SqliteSetup {
    fn backend(&self) -> DbBackend {
        DbBackend::Sqlite
    }

    async fn marker(&self) -> Result<Option<SchemaMarker>, SetupError> {
        let mut conn = self.pool.acquire().await.map_err(setup_error)?;
        read_marker(&mut conn).await
    }

    #[instrument(skip_all, fields(backend = "sqlite"))]
    async fn initialize(&self) -> Result<InitOutcome, SetupError> {
        // Take the write lock up front so a concurrent initializer waits on the busy
        // timeout instead of failing halfway through the script. An error or a
        // dropped future rolls the transaction back.
        let mut tx = self
            .pool
            .begin_with("BEGIN IMMEDIATE")
            .await
            .map_err(setup_error)?;

        let outcome = apply(&mut tx).await?;
        match outcome {
            InitOutcome::Initialized => tx.commit().await.map_err(setup_error)?,
            InitOutcome::AlreadyInitialized => tx.rollback().await.map_err(setup_error)?,
        }

        debug!(?outcome, "Setup transaction finished");
        Ok(outcome)
    }
}
