use async_trait::async_trait;
use sqlx::postgres::{PgConnection, PgPool};
use time::OffsetDateTime;
use tracing::instrument;

use crate::application::repos::{RepoError, RepoOperation};
use crate::domain::values::now_micros;
use crate::infra::db::DbBackend;
use crate::infra::db::postgres::execute_raw;

use super::{InitOutcome, SCHEMA_VERSION, SchemaMarker, SetupError, SetupRunner, statements};

pub(super) const SCRIPT: &str = include_str!("sql/postgres.sql");

/// Key of the transaction-scoped advisory lock serializing setup across processes.
const SETUP_LOCK_KEY: i64 = 0x5343_5249_5054_4f52;

fn setup_error(source: sqlx::Error) -> SetupError {
    SetupError::Backend(RepoError::backend(RepoOperation::Setup, "raw", source))
}

/// Setup for PostgreSQL; the script and marker commit in one transaction.
pub struct PgSetup {
    pool: PgPool,
}

impl PgSetup {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

async fn read_marker(conn: &mut PgConnection) -> Result<Option<SchemaMarker>, SetupError> {
    let exists: bool = sqlx::query_scalar("SELECT to_regclass('schema_state') IS NOT NULL")
        .fetch_one(&mut *conn)
        .await
        .map_err(setup_error)?;
    if !exists {
        return Ok(None);
    }

    let row: Option<(i64, OffsetDateTime)> =
        sqlx::query_as("SELECT schema_version, initialized_at FROM schema_state WHERE id = 1")
            .fetch_optional(&mut *conn)
            .await
            .map_err(setup_error)?;

    Ok(row.map(|(schema_version, initialized_at)| SchemaMarker {
        schema_version,
        initialized_at,
    }))
}

#[async_trait]
impl SetupRunner for PgSetup {
    fn backend(&self) -> DbBackend {
        DbBackend::Postgres
    }

    async fn marker(&self) -> Result<Option<SchemaMarker>, SetupError> {
        let mut conn = self.pool.acquire().await.map_err(setup_error)?;
        read_marker(&mut conn).await
    }

    #[instrument(skip_all, fields(backend = "postgres"))]
    async fn initialize(&self) -> Result<InitOutcome, SetupError> {
        let mut tx = self.pool.begin().await.map_err(setup_error)?;

        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(SETUP_LOCK_KEY)
            .execute(&mut *tx)
            .await
            .map_err(setup_error)?;

        if read_marker(&mut tx).await?.is_some() {
            return Ok(InitOutcome::AlreadyInitialized);
        }

        for statement in statements(SCRIPT) {
            execute_raw(&mut *tx, &statement)
                .await
                .map_err(setup_error)?;
        }

        let inserted = sqlx::query(
            "INSERT INTO schema_state (id, schema_version, initialized_at) VALUES (1, $1, $2)",
        )
        .bind(SCHEMA_VERSION)
        .bind(now_micros())
        .execute(&mut *tx)
        .await;

        match inserted {
            Ok(_) => {
                tx.commit().await.map_err(setup_error)?;
                Ok(InitOutcome::Initialized)
            }
            // Dropping the transaction rolls it back.
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                Ok(InitOutcome::AlreadyInitialized)
            }
            Err(err) => Err(setup_error(err)),
        }
    }
}
