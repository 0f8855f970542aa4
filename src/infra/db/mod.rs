//! Relational repository implementations for SQLite, MySQL and PostgreSQL.

mod backend;
pub mod mysql;
pub mod postgres;
mod sql;
pub mod sqlite;
mod util;

pub use backend::{DbBackend, UnknownBackend};
pub use mysql::MySqlRepository;
pub use postgres::PgRepository;
pub use sqlite::SqliteRepository;

use std::sync::Arc;

use sqlx::{mysql::MySqlPool, postgres::PgPool, query, sqlite::SqlitePool};
use tracing::info;

use crate::application::repos::{RepoError, RepoOperation, Repository};
use crate::cache::{CacheTrigger, InvalidatingRepository};
use crate::config::DatabaseSettings;
use crate::domain::schema::Entity;
use crate::infra::setup::{MySqlSetup, PgSetup, SetupRunner, SqliteSetup};

use util::{PoolSettings, backend_error};

/// Connection pool for the configured backend.
///
/// Cloning is cheap; every repository built from a handle shares its pool.
#[derive(Clone, Debug)]
pub enum DbHandle {
    Sqlite(SqlitePool),
    MySql(MySqlPool),
    Postgres(PgPool),
}

impl DbHandle {
    /// Open a pool for `settings.url`, choosing the backend from the URL scheme.
    pub async fn connect(settings: &DatabaseSettings) -> Result<Self, RepoError> {
        let url = settings
            .url
            .as_deref()
            .ok_or_else(|| RepoError::configuration("database.url is not set"))?;
        let backend = resolve_backend(url, settings.backend)?;
        let pool = PoolSettings {
            max_connections: settings.max_connections.get(),
            acquire_timeout: settings.acquire_timeout,
        };

        let connect_error = |err: sqlx::Error| {
            RepoError::configuration(format!("cannot connect to {backend} database: {err}"))
        };
        let handle = match backend {
            DbBackend::Sqlite => DbHandle::Sqlite(
                sqlite::connect(url, pool)
                    .await
                    .map_err(connect_error)?,
            ),
            DbBackend::MySql => DbHandle::MySql(
                mysql::connect(url, pool)
                    .await
                    .map_err(connect_error)?,
            ),
            DbBackend::Postgres => DbHandle::Postgres(
                postgres::connect(url, pool)
                    .await
                    .map_err(connect_error)?,
            ),
        };

        info!(
            backend = %backend,
            max_connections = pool.max_connections,
            "Database pool ready"
        );
        Ok(handle)
    }

    pub fn backend(&self) -> DbBackend {
        match self {
            DbHandle::Sqlite(_) => DbBackend::Sqlite,
            DbHandle::MySql(_) => DbBackend::MySql,
            DbHandle::Postgres(_) => DbBackend::Postgres,
        }
    }

    /// Repository whose writes do not touch any cache.
    ///
    /// Services that read through a [`crate::cache::CacheStore`] take
    /// [`DbHandle::cached_repository`] instead.
    pub fn repository<T: Entity>(&self) -> Arc<dyn Repository<T>> {
        match self {
            DbHandle::Sqlite(pool) => Arc::new(SqliteRepository::<T>::new(pool.clone())),
            DbHandle::MySql(pool) => Arc::new(MySqlRepository::<T>::new(pool.clone())),
            DbHandle::Postgres(pool) => Arc::new(PgRepository::<T>::new(pool.clone())),
        }
    }

    /// Repository whose successful writes fire `trigger` before returning.
    pub fn cached_repository<T: Entity>(
        &self,
        trigger: &Arc<CacheTrigger>,
    ) -> Arc<dyn Repository<T>> {
        InvalidatingRepository::wrap(self.repository::<T>(), trigger.clone())
    }

    pub fn setup_runner(&self) -> Arc<dyn SetupRunner> {
        match self {
            DbHandle::Sqlite(pool) => Arc::new(SqliteSetup::new(pool.clone())),
            DbHandle::MySql(pool) => Arc::new(MySqlSetup::new(pool.clone())),
            DbHandle::Postgres(pool) => Arc::new(PgSetup::new(pool.clone())),
        }
    }

    /// Run a privileged statement batch; errors are surfaced unchanged.
    pub async fn execute_raw(&self, statement: &str) -> Result<u64, RepoError> {
        let result = match self {
            DbHandle::Sqlite(pool) => sqlite::execute_raw(pool, statement).await,
            DbHandle::MySql(pool) => mysql::execute_raw(pool, statement).await,
            DbHandle::Postgres(pool) => postgres::execute_raw(pool, statement).await,
        };
        result.map_err(backend_error(RepoOperation::ExecuteRaw, "raw"))
    }

    pub async fn health_check(&self) -> Result<(), RepoError> {
        let result = match self {
            DbHandle::Sqlite(pool) => query("SELECT 1").execute(pool).await.map(|_| ()),
            DbHandle::MySql(pool) => query("SELECT 1").execute(pool).await.map(|_| ()),
            DbHandle::Postgres(pool) => query("SELECT 1").execute(pool).await.map(|_| ()),
        };
        result.map_err(backend_error(RepoOperation::Connect, "raw"))
    }

    pub async fn close(&self) {
        match self {
            DbHandle::Sqlite(pool) => pool.close().await,
            DbHandle::MySql(pool) => pool.close().await,
            DbHandle::Postgres(pool) => pool.close().await,
        }
    }
}

fn resolve_backend(url: &str, explicit: Option<DbBackend>) -> Result<DbBackend, RepoError> {
    match (DbBackend::detect(url), explicit) {
        (Some(detected), Some(explicit)) if detected != explicit => {
            Err(RepoError::configuration(format!(
                "database backend `{explicit}` does not match the `{detected}` url scheme"
            )))
        }
        (Some(detected), _) => Ok(detected),
        (None, _) => Err(RepoError::configuration(
            "database url must start with sqlite:, mysql://, postgres:// or postgresql://",
        )),
    }
}
