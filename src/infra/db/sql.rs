//! Statement construction shared by the three backends.
//!
//! Everything here pushes SQL text; values are bound by the backend's [`Dialect`],
//! which knows the storage type of each column on that backend.

use sqlx::{Database, QueryBuilder};
use uuid::Uuid;

use crate::application::repos::RepoError;
use crate::application::specification::{Direction, OrderBy, Predicate, SpecError, Specification};
use crate::domain::schema::{self, Column, Entity, HEADER_COLUMNS, RecordMeta, SchemaError};
use crate::domain::types::ColumnType;
use crate::domain::values::Value;

use super::backend::DbBackend;

/// Backend-specific pieces of statement construction.
pub(crate) trait Dialect {
    type Db: Database;

    const BACKEND: DbBackend;

    /// Bind `value` as a parameter for `column`.
    fn push_value(
        qb: &mut QueryBuilder<'_, Self::Db>,
        column: &Column,
        value: &Value,
    ) -> Result<(), SchemaError>;

    /// Column reference with byte-wise collation, used for comparisons and ordering.
    fn push_column(qb: &mut QueryBuilder<'_, Self::Db>, column: &Column) {
        qb.push(column.name);
    }

    /// Text column with ASCII `A`-`Z` folded to lowercase and every other character
    /// left as stored.
    ///
    /// Case-insensitive predicates fold only ASCII so that every backend matches the
    /// same rows; `LOWER()` folds Unicode on some servers and not on others.
    fn push_ascii_lower(qb: &mut QueryBuilder<'_, Self::Db>, column: &Column) {
        for _ in b'A'..=b'Z' {
            qb.push("REPLACE(");
        }
        qb.push(column.name);
        for upper in b'A'..=b'Z' {
            qb.push(format_args!(
                ", '{}', '{}')",
                char::from(upper),
                char::from(upper.to_ascii_lowercase())
            ));
        }
    }

    /// `needle` occurs in the text column. With `ignore_case` both sides are folded
    /// as in [`Dialect::push_ascii_lower`].
    fn push_contains(
        qb: &mut QueryBuilder<'_, Self::Db>,
        column: &Column,
        needle: &str,
        ignore_case: bool,
    );

    /// Ordering term that sorts NULLs after every value in both directions.
    fn push_order_term(qb: &mut QueryBuilder<'_, Self::Db>, column: &Column, direction: Direction) {
        if column.nullable {
            qb.push("(");
            qb.push(column.name);
            qb.push(" IS NULL) ASC, ");
        }
        Self::push_column(qb, column);
        qb.push(" ");
        qb.push(direction.as_sql());
    }

    fn push_window(qb: &mut QueryBuilder<'_, Self::Db>, skip: u64, take: Option<u64>);
}

pub(crate) fn to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

pub(crate) fn count_to_u64(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}

fn column_of<T: Entity>(field: &str) -> Result<&'static Column, SpecError> {
    T::column(field).ok_or_else(|| SpecError::UnknownField {
        field: field.to_string(),
    })
}

fn id_column() -> &'static Column {
    &HEADER_COLUMNS[0]
}

fn schema_to_repo<T: Entity>(err: SchemaError) -> RepoError {
    RepoError::decode(T::KIND, err)
}

/// Columns a read returns: the header, scalar columns, and owned collections selected
/// by `include`.
pub(crate) fn selected_columns<T: Entity>(include: impl Fn(&Column) -> bool) -> Vec<&'static Column> {
    HEADER_COLUMNS
        .iter()
        .chain(T::COLUMNS.iter())
        .filter(|column| !column.owned || include(column))
        .collect()
}

pub(crate) fn columns_for_spec<T: Entity>(spec: &Specification<T>) -> Vec<&'static Column> {
    selected_columns::<T>(|column| spec.includes_collection(column.name))
}

pub(crate) fn all_columns<T: Entity>() -> Vec<&'static Column> {
    selected_columns::<T>(|_| true)
}

pub(crate) fn push_select<D: Dialect, T: Entity>(
    qb: &mut QueryBuilder<'_, D::Db>,
    columns: &[&'static Column],
) {
    qb.push("SELECT ");
    for (index, column) in columns.iter().enumerate() {
        if index > 0 {
            qb.push(", ");
        }
        qb.push(column.name);
    }
    qb.push(" FROM ");
    qb.push(T::TABLE);
}

pub(crate) fn push_where_id<D: Dialect, T: Entity>(
    qb: &mut QueryBuilder<'_, D::Db>,
    id: Uuid,
) -> Result<(), RepoError> {
    qb.push(" WHERE id = ");
    D::push_value(qb, id_column(), &Value::Uuid(id)).map_err(schema_to_repo::<T>)
}

/// `SELECT ... WHERE ... ORDER BY ... LIMIT/OFFSET` for a validated specification.
pub(crate) fn push_query<D: Dialect, T: Entity>(
    qb: &mut QueryBuilder<'_, D::Db>,
    spec: &Specification<T>,
    columns: &[&'static Column],
) -> Result<(), RepoError> {
    push_select::<D, T>(qb, columns);
    push_filter::<D, T>(qb, spec.predicate())?;
    push_order::<D, T>(qb, spec.ordering())?;
    D::push_window(qb, spec.skip_count(), spec.take_count());
    Ok(())
}

pub(crate) fn push_count<D: Dialect, T: Entity>(
    qb: &mut QueryBuilder<'_, D::Db>,
    spec: &Specification<T>,
) -> Result<(), RepoError> {
    qb.push("SELECT COUNT(*) FROM ");
    qb.push(T::TABLE);
    push_filter::<D, T>(qb, spec.predicate())
}

fn push_filter<D: Dialect, T: Entity>(
    qb: &mut QueryBuilder<'_, D::Db>,
    predicate: &Predicate,
) -> Result<(), RepoError> {
    if matches!(predicate, Predicate::All) {
        return Ok(());
    }
    qb.push(" WHERE ");
    push_predicate::<D, T>(qb, predicate)
}

fn push_order<D: Dialect, T: Entity>(
    qb: &mut QueryBuilder<'_, D::Db>,
    order: Option<&OrderBy>,
) -> Result<(), RepoError> {
    qb.push(" ORDER BY ");
    if let Some(order) = order {
        let column = column_of::<T>(&order.field)?;
        D::push_order_term(qb, column, order.direction);
        qb.push(", ");
    }
    // Identity breaks ties so every backend returns the same sequence.
    qb.push("id ASC");
    Ok(())
}

pub(crate) fn push_predicate<D: Dialect, T: Entity>(
    qb: &mut QueryBuilder<'_, D::Db>,
    predicate: &Predicate,
) -> Result<(), RepoError> {
    match predicate {
        Predicate::All => {
            qb.push("1 = 1");
        }
        Predicate::Compare { field, cmp, value } => {
            let column = column_of::<T>(field)?;
            D::push_column(qb, column);
            qb.push(" ");
            qb.push(cmp.as_sql());
            qb.push(" ");
            D::push_value(qb, column, value).map_err(schema_to_repo::<T>)?;
        }
        Predicate::EqIgnoreCase { field, value } => {
            let column = column_of::<T>(field)?;
            D::push_ascii_lower(qb, column);
            qb.push(" = ");
            D::push_value(qb, column, &Value::Text(value.to_ascii_lowercase()))
                .map_err(schema_to_repo::<T>)?;
        }
        Predicate::Contains {
            field,
            needle,
            ignore_case,
        } => {
            let column = column_of::<T>(field)?;
            D::push_contains(qb, column, needle, *ignore_case);
        }
        Predicate::In { field, values } => {
            let column = column_of::<T>(field)?;
            if values.is_empty() {
                qb.push("1 = 0");
                return Ok(());
            }
            D::push_column(qb, column);
            qb.push(" IN (");
            for (index, value) in values.iter().enumerate() {
                if index > 0 {
                    qb.push(", ");
                }
                D::push_value(qb, column, value).map_err(schema_to_repo::<T>)?;
            }
            qb.push(")");
        }
        Predicate::IsNull { field } => {
            let column = column_of::<T>(field)?;
            qb.push(column.name);
            qb.push(" IS NULL");
        }
        Predicate::IsNotNull { field } => {
            let column = column_of::<T>(field)?;
            qb.push(column.name);
            qb.push(" IS NOT NULL");
        }
        Predicate::And { predicates } => {
            push_junction::<D, T>(qb, predicates, " AND ", "1 = 1")?;
        }
        Predicate::Or { predicates } => {
            push_junction::<D, T>(qb, predicates, " OR ", "1 = 0")?;
        }
        Predicate::Not { predicate } => {
            qb.push("NOT (");
            push_predicate::<D, T>(qb, predicate)?;
            qb.push(")");
        }
    }
    Ok(())
}

fn push_junction<D: Dialect, T: Entity>(
    qb: &mut QueryBuilder<'_, D::Db>,
    predicates: &[Predicate],
    separator: &str,
    empty: &str,
) -> Result<(), RepoError> {
    if predicates.is_empty() {
        qb.push(empty);
        return Ok(());
    }
    qb.push("(");
    for (index, predicate) in predicates.iter().enumerate() {
        if index > 0 {
            qb.push(separator);
        }
        push_predicate::<D, T>(qb, predicate)?;
    }
    qb.push(")");
    Ok(())
}

/// Stored value for a column on insert; a collection that was never loaded is empty.
fn insert_value(column: &Column, value: Option<Value>) -> Value {
    value.unwrap_or_else(|| {
        if column.owned {
            Value::Json(serde_json::Value::Array(Vec::new()))
        } else {
            Value::Null
        }
    })
}

pub(crate) fn push_insert<D: Dialect, T: Entity>(
    qb: &mut QueryBuilder<'_, D::Db>,
    meta: &RecordMeta,
    values: Vec<Option<Value>>,
) -> Result<(), RepoError> {
    qb.push("INSERT INTO ");
    qb.push(T::TABLE);
    qb.push(" (");
    for (index, column) in HEADER_COLUMNS.iter().chain(T::COLUMNS.iter()).enumerate() {
        if index > 0 {
            qb.push(", ");
        }
        qb.push(column.name);
    }
    qb.push(") VALUES (");

    let header = [
        Value::Uuid(meta.id),
        Value::Int(meta.version),
        Value::Timestamp(meta.created_at),
        Value::Timestamp(meta.updated_at),
    ];
    for (index, (column, value)) in HEADER_COLUMNS.iter().zip(header.iter()).enumerate() {
        if index > 0 {
            qb.push(", ");
        }
        D::push_value(qb, column, value).map_err(schema_to_repo::<T>)?;
    }
    for (column, value) in T::COLUMNS.iter().zip(values) {
        qb.push(", ");
        let value = insert_value(column, value);
        D::push_value(qb, column, &value).map_err(schema_to_repo::<T>)?;
    }
    qb.push(")");
    Ok(())
}

/// Versioned update; affects no row when the stored version moved on.
pub(crate) fn push_update<D: Dialect, T: Entity>(
    qb: &mut QueryBuilder<'_, D::Db>,
    meta: &RecordMeta,
    values: Vec<Option<Value>>,
    updated_at: time::OffsetDateTime,
) -> Result<(), RepoError> {
    qb.push("UPDATE ");
    qb.push(T::TABLE);
    qb.push(" SET ");
    for (column, value) in T::COLUMNS.iter().zip(values) {
        // Unloaded collections keep their stored contents.
        let Some(value) = value else {
            continue;
        };
        qb.push(column.name);
        qb.push(" = ");
        D::push_value(qb, column, &value).map_err(schema_to_repo::<T>)?;
        qb.push(", ");
    }
    qb.push("version = version + 1, updated_at = ");
    D::push_value(qb, &HEADER_COLUMNS[3], &Value::Timestamp(updated_at))
        .map_err(schema_to_repo::<T>)?;
    push_where_id::<D, T>(qb, meta.id)?;
    qb.push(" AND version = ");
    D::push_value(qb, &HEADER_COLUMNS[1], &Value::Int(meta.version)).map_err(schema_to_repo::<T>)?;
    Ok(())
}

pub(crate) fn push_delete<D: Dialect, T: Entity>(
    qb: &mut QueryBuilder<'_, D::Db>,
    id: Uuid,
) -> Result<(), RepoError> {
    qb.push("DELETE FROM ");
    qb.push(T::TABLE);
    push_where_id::<D, T>(qb, id)
}

/// Type check shared by the dialects' binders.
pub(crate) fn expect_type(column: &Column, value: &Value) -> Result<(), SchemaError> {
    match value.column_type() {
        None if column.nullable || column.owned => Ok(()),
        None => Err(SchemaError::InvalidValue {
            column: column.name,
            reason: "null in a non-nullable column".to_string(),
        }),
        Some(found) if found == column.ty => Ok(()),
        Some(_) => Err(SchemaError::TypeMismatch {
            column: column.name,
            expected: column.ty,
            found: value.type_name(),
        }),
    }
}

/// Header for a row about to be inserted.
pub(crate) fn new_record_meta(meta: &RecordMeta) -> RecordMeta {
    let now = crate::domain::values::now_micros();
    RecordMeta {
        id: if meta.id.is_nil() {
            Uuid::new_v4()
        } else {
            meta.id
        },
        version: 1,
        created_at: now,
        updated_at: now,
    }
}

pub(crate) fn is_text(column: &Column) -> bool {
    column.ty == ColumnType::Text
}

pub(crate) fn values_for_write<T: Entity>(entity: &T) -> Result<Vec<Option<Value>>, RepoError> {
    entity.to_values().map_err(schema_to_repo::<T>)
}

pub(crate) fn decode_entity<T: Entity>(mut row: schema::RowValues) -> Result<T, RepoError> {
    let meta = schema::split_header(&mut row).map_err(schema_to_repo::<T>)?;
    T::from_values(meta, &mut row).map_err(schema_to_repo::<T>)
}
