//! PostgreSQL repository.
//!
//! Storage types: native `UUID`, `TIMESTAMPTZ`, `JSONB` and `BOOLEAN`. Text is compared
//! and ordered under `COLLATE "C"` so results match the byte-wise order of the other
//! backends whatever the database's default collation.

use std::marker::PhantomData;

use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::{Executor, Postgres, QueryBuilder, Row};
use time::OffsetDateTime;
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::application::repos::{RepoError, RepoOperation, Repository};
use crate::application::specification::{Direction, Specification};
use crate::domain::schema::{Column, Entity, SchemaError};
use crate::domain::types::ColumnType;
use crate::domain::values::{Value, now_micros, truncate_to_micros};

use super::backend::DbBackend;
use super::sql::{self, Dialect};
use super::util::{ColumnError, PoolSettings, backend_error, decode_row};

pub(crate) struct PgDialect;

impl PgDialect {
    /// Postgres infers parameter types, so a NULL is bound with the column's type.
    fn push_null(qb: &mut QueryBuilder<'_, Postgres>, ty: ColumnType) {
        match ty {
            ColumnType::Bool => qb.push_bind(None::<bool>),
            ColumnType::Int => qb.push_bind(None::<i64>),
            ColumnType::Text => qb.push_bind(None::<String>),
            ColumnType::Uuid => qb.push_bind(None::<Uuid>),
            ColumnType::Timestamp => qb.push_bind(None::<OffsetDateTime>),
            ColumnType::Json => qb.push_bind(None::<Json<serde_json::Value>>),
        };
    }
}

impl Dialect for PgDialect {
    type Db = Postgres;

    const BACKEND: DbBackend = DbBackend::Postgres;

    fn push_value(
        qb: &mut QueryBuilder<'_, Postgres>,
        column: &Column,
        value: &Value,
    ) -> Result<(), SchemaError> {
        sql::expect_type(column, value)?;
        match value {
            Value::Null => Self::push_null(qb, column.ty),
            Value::Bool(flag) => {
                qb.push_bind(*flag);
            }
            Value::Int(number) => {
                qb.push_bind(*number);
            }
            Value::Text(text) => {
                qb.push_bind(text.clone());
            }
            Value::Uuid(id) => {
                qb.push_bind(*id);
            }
            Value::Timestamp(at) => {
                qb.push_bind(truncate_to_micros(*at));
            }
            Value::Json(json) => {
                qb.push_bind(Json(json.clone()));
            }
        }
        Ok(())
    }

    fn push_column(qb: &mut QueryBuilder<'_, Postgres>, column: &Column) {
        qb.push(column.name);
        if sql::is_text(column) {
            qb.push(" COLLATE \"C\"");
        }
    }

    fn push_ascii_lower(qb: &mut QueryBuilder<'_, Postgres>, column: &Column) {
        qb.push("translate(");
        qb.push(column.name);
        qb.push(", 'ABCDEFGHIJKLMNOPQRSTUVWXYZ', 'abcdefghijklmnopqrstuvwxyz')");
    }

    fn push_contains(
        qb: &mut QueryBuilder<'_, Postgres>,
        column: &Column,
        needle: &str,
        ignore_case: bool,
    ) {
        if ignore_case {
            qb.push("strpos(");
            Self::push_ascii_lower(qb, column);
            qb.push(", ");
            qb.push_bind(needle.to_ascii_lowercase());
            qb.push(") > 0");
        } else {
            qb.push("strpos(");
            qb.push(column.name);
            qb.push(", ");
            qb.push_bind(needle.to_string());
            qb.push(") > 0");
        }
    }

    fn push_order_term(qb: &mut QueryBuilder<'_, Postgres>, column: &Column, direction: Direction) {
        Self::push_column(qb, column);
        qb.push(" ");
        qb.push(direction.as_sql());
        qb.push(" NULLS LAST");
    }

    fn push_window(qb: &mut QueryBuilder<'_, Postgres>, skip: u64, take: Option<u64>) {
        if let Some(take) = take {
            qb.push(" LIMIT ");
            qb.push_bind(sql::to_i64(take));
        }
        if skip > 0 {
            qb.push(" OFFSET ");
            qb.push_bind(sql::to_i64(skip));
        }
    }
}

fn read_column(row: &PgRow, column: &'static Column) -> Result<Option<Value>, ColumnError> {
    let name = column.name;
    let value = match column.ty {
        ColumnType::Bool => row.try_get::<Option<bool>, _>(name)?.map(Value::Bool),
        ColumnType::Int => row.try_get::<Option<i64>, _>(name)?.map(Value::Int),
        ColumnType::Text => row.try_get::<Option<String>, _>(name)?.map(Value::Text),
        ColumnType::Uuid => row.try_get::<Option<Uuid>, _>(name)?.map(Value::Uuid),
        ColumnType::Timestamp => row
            .try_get::<Option<OffsetDateTime>, _>(name)?
            .map(|at| Value::Timestamp(truncate_to_micros(at))),
        ColumnType::Json => row
            .try_get::<Option<Json<serde_json::Value>>, _>(name)?
            .map(|Json(json)| Value::Json(json)),
    };
    Ok(value)
}

pub(crate) async fn connect(url: &str, pool: PoolSettings) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(pool.max_connections)
        .acquire_timeout(pool.acquire_timeout)
        .connect(url)
        .await
}

pub(crate) async fn execute_raw<'e, E>(executor: E, statement: &'e str) -> Result<u64, sqlx::Error>
where
    E: Executor<'e, Database = Postgres>,
{
    let result = executor.execute(sqlx::raw_sql(statement)).await?;
    Ok(result.rows_affected())
}

pub struct PgRepository<T> {
    pool: PgPool,
    marker: PhantomData<fn() -> T>,
}

impl<T: Entity> PgRepository<T> {
    pub fn new(pool: PgPool) -> Self {
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
        E: Executor<'e, Database = Postgres>,
    {
        let columns = sql::all_columns::<T>();
        let mut qb = QueryBuilder::<Postgres>::new("");
        sql::push_select::<PgDialect, T>(&mut qb, &columns);
        sql::push_where_id::<PgDialect, T>(&mut qb, id)?;

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
impl<T: Entity> Repository<T> for PgRepository<T> {
    async fn get_by_id(&self, id: Uuid) -> Result<Option<T>, RepoError> {
        Self::fetch_by_id(&self.pool, RepoOperation::GetById, id).await
    }

    async fn query(&self, spec: &Specification<T>) -> Result<Vec<T>, RepoError> {
        spec.validate()?;
        if spec.is_empty_window() {
            return Ok(Vec::new());
        }

        let columns = sql::columns_for_spec(spec);
        let mut qb = QueryBuilder::<Postgres>::new("");
        sql::push_query::<PgDialect, T>(&mut qb, spec, &columns)?;

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
        let mut qb = QueryBuilder::<Postgres>::new("");
        sql::push_count::<PgDialect, T>(&mut qb, spec)?;

        let count: i64 = qb
            .build_query_scalar()
            .fetch_one(&self.pool)
            .await
            .map_err(backend_error(RepoOperation::Count, T::KIND.as_str()))?;
        Ok(sql::count_to_u64(count))
    }

    #[instrument(skip_all, fields(backend = "postgres", kind = %T::KIND))]
    async fn add(&self, entity: T) -> Result<T, RepoError> {
        let map_err = backend_error(RepoOperation::Add, T::KIND.as_str());
        let meta = sql::new_record_meta(entity.meta());
        let values = sql::values_for_write(&entity)?;

        let mut tx = self.pool.begin().await.map_err(map_err)?;
        let mut qb = QueryBuilder::<Postgres>::new("");
        sql::push_insert::<PgDialect, T>(&mut qb, &meta, values)?;
        qb.build().execute(&mut *tx).await.map_err(map_err)?;

        let stored = Self::fetch_by_id(&mut *tx, RepoOperation::Add, meta.id).await?;
        tx.commit().await.map_err(map_err)?;

        debug!(id = %meta.id, "Entity added");
        stored.ok_or_else(|| map_err(sqlx::Error::RowNotFound))
    }

    #[instrument(skip_all, fields(backend = "postgres", kind = %T::KIND, id = %entity.id()))]
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
        let mut qb = QueryBuilder::<Postgres>::new("");
        sql::push_update::<PgDialect, T>(&mut qb, &meta, values, now_micros())?;
        let result = qb.build().execute(&mut *tx).await.map_err(map_err)?;

        if result.rows_affected() == 0 {
            debug!(expected_version = meta.version, "Update lost a version race");
            return Err(conflict);
        }

        let stored = Self::fetch_by_id(&mut *tx, RepoOperation::Update, meta.id).await?;
        tx.commit().await.map_err(map_err)?;
        stored.ok_or(conflict)
    }

    #[instrument(skip_all, fields(backend = "postgres", kind = %T::KIND, id = %id))]
    async fn delete(&self, id: Uuid) -> Result<(), RepoError> {
        let mut qb = QueryBuilder::<Postgres>::new("");
        sql::push_delete::<PgDialect, T>(&mut qb, id)?;
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
