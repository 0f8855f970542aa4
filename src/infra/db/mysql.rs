//! MySQL / MariaDB repository.
//!
//! Storage types: UUIDs as `BINARY(16)`, timestamps as UTC `DATETIME(6)`, JSON as
//! `JSON`, booleans as `TINYINT(1)`. Text columns use `utf8mb4_bin` so comparisons and
//! ordering are byte-wise like the other backends.

use std::marker::PhantomData;

use async_trait::async_trait;
use sqlx::mysql::{MySqlPool, MySqlPoolOptions, MySqlRow};
use sqlx::types::Json;
use sqlx::{Executor, MySql, QueryBuilder, Row};
use time::{OffsetDateTime, PrimitiveDateTime, UtcOffset};
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::application::repos::{RepoError, RepoOperation, Repository};
use crate::application::specification::Specification;
use crate::domain::schema::{Column, Entity, SchemaError};
use crate::domain::types::ColumnType;
use crate::domain::values::{Value, now_micros, truncate_to_micros};

use super::backend::DbBackend;
use super::sql::{self, Dialect};
use super::util::{ColumnError, PoolSettings, backend_error, decode_row};

pub(crate) struct MySqlDialect;

impl Dialect for MySqlDialect {
    type Db = MySql;

    const BACKEND: DbBackend = DbBackend::MySql;

    fn push_value(
        qb: &mut QueryBuilder<'_, MySql>,
        column: &Column,
        value: &Value,
    ) -> Result<(), SchemaError> {
        sql::expect_type(column, value)?;
        match value {
            Value::Null => qb.push_bind(None::<String>),
            Value::Bool(flag) => qb.push_bind(*flag),
            Value::Int(number) => qb.push_bind(*number),
            Value::Text(text) => qb.push_bind(text.clone()),
            Value::Uuid(id) => qb.push_bind(*id),
            Value::Timestamp(at) => qb.push_bind(to_utc_datetime(*at)),
            Value::Json(json) => qb.push_bind(Json(json.clone())),
        };
        Ok(())
    }

    fn push_contains(
        qb: &mut QueryBuilder<'_, MySql>,
        column: &Column,
        needle: &str,
        ignore_case: bool,
    ) {
        if ignore_case {
            qb.push("LOCATE(");
            qb.push_bind(needle.to_ascii_lowercase());
            qb.push(", ");
            Self::push_ascii_lower(qb, column);
            qb.push(") > 0");
        } else {
            qb.push("LOCATE(");
            qb.push_bind(needle.to_string());
            qb.push(", ");
            qb.push(column.name);
            qb.push(") > 0");
        }
    }

    fn push_window(qb: &mut QueryBuilder<'_, MySql>, skip: u64, take: Option<u64>) {
        if take.is_none() && skip == 0 {
            return;
        }
        // MySQL has no OFFSET without LIMIT.
        qb.push(" LIMIT ");
        qb.push_bind(take.map_or(i64::MAX, sql::to_i64));
        qb.push(" OFFSET ");
        qb.push_bind(sql::to_i64(skip));
    }
}

fn to_utc_datetime(at: OffsetDateTime) -> PrimitiveDateTime {
    let utc = truncate_to_micros(at).to_offset(UtcOffset::UTC);
    PrimitiveDateTime::new(utc.date(), utc.time())
}

fn read_column(row: &MySqlRow, column: &'static Column) -> Result<Option<Value>, ColumnError> {
    let name = column.name;
    let value = match column.ty {
        ColumnType::Bool => row.try_get::<Option<bool>, _>(name)?.map(Value::Bool),
        ColumnType::Int => row.try_get::<Option<i64>, _>(name)?.map(Value::Int),
        ColumnType::Text => row.try_get::<Option<String>, _>(name)?.map(Value::Text),
        ColumnType::Uuid => row.try_get::<Option<Uuid>, _>(name)?.map(Value::Uuid),
        ColumnType::Timestamp => row
            .try_get::<Option<PrimitiveDateTime>, _>(name)?
            .map(|at| Value::Timestamp(at.assume_utc())),
        ColumnType::Json => row
            .try_get::<Option<Json<serde_json::Value>>, _>(name)?
            .map(|Json(json)| Value::Json(json)),
    };
    Ok(value)
}

pub(crate) async fn connect(url: &str, pool: PoolSettings) -> Result<MySqlPool, sqlx::Error> {
    MySqlPoolOptions::new()
        .max_connections(pool.max_connections)
        .acquire_timeout(pool.acquire_timeout)
        // Sessions store and compare DATETIME values in UTC.
        .after_connect(|conn, _meta| {
            Box::pin(async move {
                conn.execute(sqlx::raw_sql("SET time_zone = '+00:00'")).await?;
                Ok(())
            })
        })
        .connect(url)
        .await
}

pub(crate) async fn execute_raw<'e, E>(executor: E, statement: &'e str) -> Result<u64, sqlx::Error>
where
    E: Executor<'e, Database = MySql>,
{
    let result = executor.execute(sqlx::raw_sql(statement)).await?;
    Ok(result.rows_affected())
}

pub struct MySqlRepository<T> {
    pool: MySqlPool,
    marker: PhantomData<fn() -> T>,
}

impl<T: Entity> MySqlRepository<T> {
    pub fn new(pool: MySqlPool) -> Self {
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
        E: Executor<'e, Database = MySql>,
    {
        let columns = sql::all_columns::<T>();
        let mut qb = QueryBuilder::<MySql>::new("");
        sql::push_select::<MySqlDialect, T>(&mut qb, &columns);
        sql::push_where_id::<MySqlDialect, T>(&mut qb, id)?;

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
impl<T: Entity> Repository<T> for MySqlRepository<T> {
    async fn get_by_id(&self, id: Uuid) -> Result<Option<T>, RepoError> {
        Self::fetch_by_id(&self.pool, RepoOperation::GetById, id).await
    }

    async fn query(&self, spec: &Specification<T>) -> Result<Vec<T>, RepoError> {
        spec.validate()?;
        if spec.is_empty_window() {
            return Ok(Vec::new());
        }

        let columns = sql::columns_for_spec(spec);
        let mut qb = QueryBuilder::<MySql>::new("");
        sql::push_query::<MySqlDialect, T>(&mut qb, spec, &columns)?;

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
        let mut qb = QueryBuilder::<MySql>::new("");
        sql::push_count::<MySqlDialect, T>(&mut qb, spec)?;

        let count: i64 = qb
            .build_query_scalar()
            .fetch_one(&self.pool)
            .await
            .map_err(backend_error(RepoOperation::Count, T::KIND.as_str()))?;
        Ok(sql::count_to_u64(count))
    }

    #[instrument(skip_all, fields(backend = "mysql", kind = %T::KIND))]
    async fn add(&self, entity: T) -> Result<T, RepoError> {
        let map_err = backend_error(RepoOperation::Add, T::KIND.as_str());
        let meta = sql::new_record_meta(entity.meta());
        let values = sql::values_for_write(&entity)?;

        let mut tx = self.pool.begin().await.map_err(map_err)?;
        let mut qb = QueryBuilder::<MySql>::new("");
        sql::push_insert::<MySqlDialect, T>(&mut qb, &meta, values)?;
        qb.build().execute(&mut *tx).await.map_err(map_err)?;

        let stored = Self::fetch_by_id(&mut *tx, RepoOperation::Add, meta.id).await?;
        tx.commit().await.map_err(map_err)?;

        debug!(id = %meta.id, "Entity added");
        stored.ok_or_else(|| map_err(sqlx::Error::RowNotFound))
    }

    #[instrument(skip_all, fields(backend = "mysql", kind = %T::KIND, id = %entity.id()))]
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
        let mut qb = QueryBuilder::<MySql>::new("");
        sql::push_update::<MySqlDialect, T>(&mut qb, &meta, values, now_micros())?;
        // The version column always changes, so a matched row is always reported.
        let result = qb.build().execute(&mut *tx).await.map_err(map_err)?;

        if result.rows_affected() == 0 {
            debug!(expected_version = meta.version, "Update lost a version race");
            return Err(conflict);
        }

        let stored = Self::fetch_by_id(&mut *tx, RepoOperation::Update, meta.id).await?;
        tx.commit().await.map_err(map_err)?;
        stored.ok_or(conflict)
    }

    #[instrument(skip_all, fields(backend = "mysql", kind = %T::KIND, id = %id))]
    async fn delete(&self, id: Uuid) -> Result<(), RepoError> {
        let mut qb = QueryBuilder::<MySql>::new("");
        sql::push_delete::<MySqlDialect, T>(&mut qb, id)?;
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
