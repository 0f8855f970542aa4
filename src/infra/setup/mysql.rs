use async_trait::async_trait;
use sqlx::mysql::{MySqlConnection, MySqlPool};
use time::{PrimitiveDateTime, UtcOffset};
use tracing::{instrument, warn};

use crate::application::repos::{RepoError, RepoOperation};
use crate::domain::values::now_micros;
use crate::infra::db::DbBackend;
use crate::infra::db::mysql::execute_raw;

use super::{InitOutcome, SCHEMA_VERSION, SchemaMarker, SetupError, SetupRunner, statements};

pub(super) const SCRIPT: &str = include_str!("sql/mysql.sql");

const SETUP_LOCK_NAME: &str = "scriptorium_setup";
const SETUP_LOCK_TIMEOUT_SECS: u64 = 30;

fn setup_error(source: sqlx::Error) -> SetupError {
    SetupError::Backend(RepoError::backend(RepoOperation::Setup, "raw", source))
}

/// Setup for MySQL / MariaDB.
///
/// DDL commits implicitly, so the script cannot share a transaction with the marker.
/// Processes serialize on a named session lock instead and the marker insert runs last;
/// a failure before it leaves the database uninitialized and the script safe to rerun.
pub struct MySqlSetup {
    pool: MySqlPool,
}

impl MySqlSetup {
    pub fn new(pool: MySqlPool) -> Self {
        Self { pool }
    }
}

async fn read_marker(conn: &mut MySqlConnection) -> Result<Option<SchemaMarker>, SetupError> {
    let tables: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM information_schema.tables \
         WHERE table_schema = DATABASE() AND table_name = 'schema_state'",
    )
    .fetch_one(&mut *conn)
    .await
    .map_err(setup_error)?;
    if tables == 0 {
        return Ok(None);
    }

    let row: Option<(i64, PrimitiveDateTime)> =
        sqlx::query_as("SELECT schema_version, initialized_at FROM schema_state WHERE id = 1")
            .fetch_optional(&mut *conn)
            .await
            .map_err(setup_error)?;

    Ok(row.map(|(schema_version, initialized_at)| SchemaMarker {
        schema_version,
        initialized_at: initialized_at.assume_utc(),
    }))
}

async fn apply(conn: &mut MySqlConnection) -> Result<InitOutcome, SetupError> {
    if read_marker(conn).await?.is_some() {
        return Ok(InitOutcome::AlreadyInitialized);
    }

    for statement in statements(SCRIPT) {
        execute_raw(&mut *conn, &statement)
            .await
            .map_err(setup_error)?;
    }

    let now = now_micros().to_offset(UtcOffset::UTC);
    let inserted = sqlx::query(
        "INSERT INTO schema_state (id, schema_version, initialized_at) VALUES (1, ?, ?)",
    )
    .bind(SCHEMA_VERSION)
    .bind(PrimitiveDateTime::new(now.date(), now.time()))
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
impl SetupRunner for MySqlSetup {
    fn backend(&self) -> DbBackend {
        DbBackend::MySql
    }

    async fn marker(&self) -> Result<Option<SchemaMarker>, SetupError> {
        let mut conn = self.pool.acquire().await.map_err(setup_error)?;
        read_marker(&mut conn).await
    }

    #[instrument(skip_all, fields(backend = "mysql"))]
    async fn initialize(&self) -> Result<InitOutcome, SetupError> {
        let mut conn = self.pool.acquire().await.map_err(setup_error)?;

        let acquired: Option<i64> = sqlx::query_scalar("SELECT GET_LOCK(?, ?)")
            .bind(SETUP_LOCK_NAME)
            .bind(SETUP_LOCK_TIMEOUT_SECS)
            .fetch_one(&mut *conn)
            .await
            .map_err(setup_error)?;
        if acquired != Some(1) {
            return Err(SetupError::LockTimeout {
                seconds: SETUP_LOCK_TIMEOUT_SECS,
            });
        }

        let outcome = apply(&mut conn).await;

        let released = sqlx::query("SELECT RELEASE_LOCK(?)")
            .bind(SETUP_LOCK_NAME)
            .execute(&mut *conn)
            .await;
        if let Err(err) = released {
            warn!(error = %err, "Failed to release the setup lock");
            // Closing the session releases the lock.
            conn.close_on_drop();
        }

        outcome
    }
}
