//! SQLite repository.
//!
//! Storage types: UUIDs as lowercase hyphenated TEXT, timestamps as INTEGER unix
//! microseconds, JSON as TEXT, booleans as INTEGER. Text comparison uses the default
//! `BINARY` collation.

use std::marker::PhantomData;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow,
    SqliteSynchronous,
};
use sqlx::{Executor, QueryBuilder, Row, Sqlite};
use time::OffsetDateTime;
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::application::repos::{RepoError, RepoOperation, Repository};
use crate::application::specification::Specification;
use crate::domain::schema::{Column, Entity, SchemaError};
use crate::domain::types::ColumnType;
use crate::domain::values::{Value, now_micros, truncate_to_micros};

use super::backend::DbBackend;
use super::sql::{self, Dialect};
use super::util::{ColumnError, PoolSettings, backend_error, decode_row, invalid_value};

const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_millis(5000);

pub(crate) struct SqliteDialect;

impl Dialect for SqliteDialect {
    type Db = Sqlite;

    const BACKEND: DbBackend = DbBackend::Sqlite;

    fn push_value(
        qb: &mut QueryBuilder<'_, Sqlite>,
        column: &Column,
        value: &Value,
    ) -> Result<(), SchemaError> {
        sql::expect_type(column, value)?;
        match value {
            Value::Null => qb.push_bind(None::<String>),
            Value::Bool(flag) => qb.push_bind(*flag),
            Value::Int(number) => qb.push_bind(*number),
            Value::Text(text) => qb.push_bind(text.clone()),
            Value::Uuid(id) => qb.push_bind(id.hyphenated().to_string()),
            Value::Timestamp(at) => qb.push_bind(to_micros(*at)),
            Value::Json(json) => qb.push_bind(json.to_string()),
        };
        Ok(())
    }

    fn push_contains(
        qb: &mut QueryBuilder<'_, Sqlite>,
        column: &Column,
        needle: &str,
        ignore_case: bool,
    ) {
        if ignore_case {
            qb.push("instr(");
            Self::push_ascii_lower(qb, column);
            qb.push(", ");
            qb.push_bind(needle.to_ascii_lowercase());
            qb.push(") > 0");
        } else {
            qb.push("instr(");
            qb.push(column.name);
            qb.push(", ");
            qb.push_bind(needle.to_string());
            qb.push(") > 0");
        }
    }

    fn push_window(qb: &mut QueryBuilder<'_, Sqlite>, skip: u64, take: Option<u64>) {
        if take.is_none() && skip == 0 {
            return;
        }
        qb.push(" LIMIT ");
        qb.push_bind(take.map_or(-1, sql::to_i64));
        qb.push(" OFFSET ");
        qb.push_bind(sql::to_i64(skip));
    }
}

pub(crate) fn to_micros(at: OffsetDateTime) -> i64 {
    let micros = truncate_to_micros(at).unix_timestamp_nanos() / 1_000;
    i64::try_from(micros).unwrap_or(i64::MAX)
}

pub(crate) fn from_micros(column: &'static str, micros: i64) -> Result<OffsetDateTime, SchemaError> {
    OffsetDateTime::from_unix_timestamp_nanos(i128::from(micros) * 1_000)
        .map_err(|err| invalid_value(column, err))
}

fn read_column(row: &SqliteRow, column: &'static Column) -> Result<Option<Value>, ColumnError> {
    let name = column.name;
    let value = match column.ty {
        ColumnType::Bool => row.try_get::<Option<bool>, _>(name)?.map(Value::Bool),
        ColumnType::Int => row.try_get::<Option<i64>, _>(name)?.map(Value::Int),
        ColumnType::Text => row.try_get::<Option<String>, _>(name)?.map(Value::Text),
        ColumnType::Uuid => row
            .try_get::<Option<String>, _>(name)?
            .map(|text| Uuid::parse_str(&text).map_err(|err| invalid_value(name, err)))
            .transpose()?
            .map(Value::Uuid),
        ColumnType::Timestamp => row
            .try_get::<Option<i64>, _>(name)?
            .map(|micros| from_micros(name, micros))
            .transpose()?
            .map(Value::Timestamp),
        ColumnType::Json => row
            .try_get::<Option<String>, _>(name)?
            .map(|text| {
                serde_json::from_str(&text)
                    .map_err(|source| SchemaError::Json { column: name, source })
            })
            .transpose()?
            .map(Value::Json),
    };
    Ok(value)
}

/// Connection pool for a SQLite URL.
///
/// File databases use WAL journaling and wait on a busy database; an in-memory
/// database is held open by a single connection, since each connection would
/// otherwise see its own empty database.
pub(crate) async fn connect(url: &str, pool: PoolSettings) -> Result<SqlitePool, sqlx::Error> {
    let in_memory = is_memory_url(url);
    let mut options = SqliteConnectOptions::from_str(url)?
        .create_if_missing(true)
        .synchronous(SqliteSynchronous::Normal);
    options = if in_memory {
        options.journal_mode(SqliteJournalMode::Delete)
    } else {
        options
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(DEFAULT_BUSY_TIMEOUT)
    };

    let pool_options = if in_memory {
        SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
    } else {
        SqlitePoolOptions::new().max_connections(pool.max_connections)
    };

    pool_options
        .acquire_timeout(pool.acquire_timeout)
        .connect_with(options)
        .await
}

fn is_memory_url(url: &str) -> bool {
    url.contains(":memory:") || url.contains("mode=memory")
}

/// Run a privileged statement batch.
pub(crate) async fn execute_raw<'e, E>(executor: E, statement: &'e str) -> Result<u64, sqlx::Error>
where
    E: Executor<'e, Database = Sqlite>,
{
    let result = executor.execute(sqlx::raw_sql(statement)).await?;
    Ok(result.rows_affected())
}

pub struct SqliteRepository<T> {
    pool: SqlitePool,
    marker: PhantomData<fn() -> T>,
}

impl<T: Entity> SqliteRepository<T> {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            marker: PhantomData,
        }
    }

    async fn fetch_by_id<'e, E>(
        executor: E,
        operation: RepoOperation,
        id: Uuid,
    ) -> Result<Option<T>, RepoError>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        let columns = sql::all_columns::<T>();
        let mut qb = QueryBuilder::<Sqlite>::new("");
        sql::push_select::<SqliteDialect, T>(&mut qb, &columns);
        sql::push_where_id::<SqliteDialect, T>(&mut qb, id)?;

        let row = qb
            .build()
            .fetch_optional(executor)
            .await
            .map_err(backend_error(operation, T::KIND.as_str()))?;
        row.map(|row| decode_row(operation, &columns, |column| read_column(&row, column)))
            .transpose()
    }
}

#[async_trait]
impl<T: Entity> Repository<T> for SqliteRepository<T> {
    async fn get_by_id(&self, id: Uuid) -> Result<Option<T>, RepoError> {
        Self::fetch_by_id(&self.pool, RepoOperation::GetById, id).await
    }

    async fn query(&self, spec: &Specification<T>) -> Result<Vec<T>, RepoError> {
        spec.validate()?;
        if spec.is_empty_window() {
            return Ok(Vec::new());
        }

        let columns = sql::columns_for_spec(spec);
        let mut qb = QueryBuilder::<Sqlite>::new("");
        sql::push_query::<SqliteDialect, T>(&mut qb, spec, &columns)?;

        let rows = qb
            .build()
            .fetch_all(&self.pool)
            .await
            .map_err(backend_error(RepoOperation::Query, T::KIND.as_str()))?;
        rows.iter()
            .map(|row| decode_row(RepoOperation::Query, &columns, |column| read_column(row, column)))
            .collect()
    }

    async fn count(&self, spec: &Specification<T>) -> Result<u64, RepoError> {
        spec.validate()?;
        let mut qb = QueryBuilder::<Sqlite>::new("");
        sql::push_count::<SqliteDialect, T>(&mut qb, spec)?;

        let count: i64 = qb
            .build_query_scalar()
            .fetch_one(&self.pool)
            .await
            .map_err(backend_error(RepoOperation::Count, T::KIND.as_str()))?;
        Ok(sql::count_to_u64(count))
    }

    #[instrument(skip_all, fields(backend = "sqlite", kind = %T::KIND))]
    async fn add(&self, entity: T) -> Result<T, RepoError> {
        let map_err = backend_error(RepoOperation::Add, T::KIND.as_str());
        let meta = sql::new_record_meta(entity.meta());
        let values = sql::values_for_write(&entity)?;

        let mut tx = self.pool.begin().await.map_err(map_err)?;
        let mut qb = QueryBuilder::<Sqlite>::new("");
        sql::push_insert::<SqliteDialect, T>(&mut qb, &meta, values)?;
        qb.build().execute(&mut *tx).await.map_err(map_err)?;

        let stored = Self::fetch_by_id(&mut *tx, RepoOperation::Add, meta.id).await?;
        tx.commit().await.map_err(map_err)?;

        debug!(id = %meta.id, "Entity added");
        stored.ok_or_else(|| map_err(sqlx::Error::RowNotFound))
    }

    #[instrument(skip_all, fields(backend = "sqlite", kind = %T::KIND, id = %entity.id()))]
    async fn update(&self, entity: T) -> Result<T, RepoError> {
        let map_err = backend_error(RepoOperation::Update, T::KIND.as_str());
        let meta = *entity.meta();
        let values = sql::values_for_write(&entity)?;
        let conflict = RepoError::ConcurrencyConflict {
            kind: T::KIND,
            id: meta.id,
            expected_version: meta.version,
        };

        let mut tx = self.pool.begin().await.map_err(map_err)?;
        let mut qb = QueryBuilder::<Sqlite>::new("");
        sql::push_update::<SqliteDialect, T>(&mut qb, &meta, values, now_micros())?;
        let result = qb.build().execute(&mut *tx).await.map_err(map_err)?;

        if result.rows_affected() == 0 {
            debug!(expected_version = meta.version, "Update lost a version race");
            return Err(conflict);
        }

        let stored = Self::fetch_by_id(&mut *tx, RepoOperation::Update, meta.id).await?;
        tx.commit().await.map_err(map_err)?;
        stored.ok_or(conflict)
    }

    #[instrument(skip_all, fields(backend = "sqlite", kind = %T::KIND, id = %id))]
    async fn delete(&self, id: Uuid) -> Result<(), RepoError> {
        let mut qb = QueryBuilder::<Sqlite>::new("");
        sql::push_delete::<SqliteDialect, T>(&mut qb, id)?;
        let result = qb
            .build()
            .execute(&self.pool)
            .await
            .map_err(backend_error(RepoOperation::Delete, T::KIND.as_str()))?;
        debug!(rows = result.rows_affected(), "Entity deleted");
        Ok(())
    }

    async fn execute_raw(&self, statement: &str) -> Result<u64, RepoError> {
        execute_raw(&self.pool, statement)
            .await
            .map_err(backend_error(RepoOperation::ExecuteRaw, "raw"))
    }
}
