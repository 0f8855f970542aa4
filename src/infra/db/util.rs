use std::time::Duration;

use crate::application::repos::{RepoError, RepoOperation};
use crate::domain::schema::{Column, Entity, RowValues, SchemaError};
use crate::domain::types::EntityKind;
use crate::domain::values::Value;

use super::sql;

/// Pool sizing shared by every backend.
#[derive(Debug, Clone, Copy)]
pub(crate) struct PoolSettings {
    pub max_connections: u32,
    pub acquire_timeout: Duration,
}

/// Wrap driver errors with the failing operation and the entity kind.
pub(crate) fn backend_error(
    operation: RepoOperation,
    kind: &'static str,
) -> impl Fn(sqlx::Error) -> RepoError + Copy {
    move |source| RepoError::backend(operation, kind, source)
}

/// Failure while reading one column of a row.
#[derive(Debug)]
pub(crate) enum ColumnError {
    Driver(sqlx::Error),
    Schema(SchemaError),
}

impl From<sqlx::Error> for ColumnError {
    fn from(err: sqlx::Error) -> Self {
        Self::Driver(err)
    }
}

impl From<SchemaError> for ColumnError {
    fn from(err: SchemaError) -> Self {
        Self::Schema(err)
    }
}

impl ColumnError {
    fn into_repo(self, operation: RepoOperation, kind: EntityKind) -> RepoError {
        match self {
            ColumnError::Driver(source) => RepoError::backend(operation, kind.as_str(), source),
            ColumnError::Schema(source) => RepoError::decode(kind, source),
        }
    }
}

pub(crate) fn invalid_value(column: &'static str, reason: impl ToString) -> SchemaError {
    SchemaError::InvalidValue {
        column,
        reason: reason.to_string(),
    }
}

/// Map a backend row to `T` with a per-backend column reader.
pub(crate) fn decode_row<T, F>(
    operation: RepoOperation,
    columns: &[&'static Column],
    mut read: F,
) -> Result<T, RepoError>
where
    T: Entity,
    F: FnMut(&'static Column) -> Result<Option<Value>, ColumnError>,
{
    let mut values = RowValues::new();
    for &column in columns {
        let value = read(column).map_err(|err| err.into_repo(operation, T::KIND))?;
        values.insert(column.name, value.unwrap_or(Value::Null));
    }
    sql::decode_entity(values)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::entities::CategoryRecord;
    use crate::domain::schema::HEADER_COLUMNS;

    #[test]
    fn driver_errors_keep_operation_context() {
        let map = backend_error(RepoOperation::Delete, "menu");
        let err = map(sqlx::Error::PoolTimedOut);
        assert!(matches!(
            err,
            RepoError::Backend {
                operation: RepoOperation::Delete,
                kind: "menu",
                ..
            }
        ));
    }

    #[test]
    fn schema_errors_become_decode_errors() {
        let columns: Vec<&'static Column> = HEADER_COLUMNS.iter().collect();
        let result = decode_row::<CategoryRecord, _>(RepoOperation::Query, &columns, |column| {
            Err(ColumnError::from(invalid_value(column.name, "corrupt")))
        });
        assert!(matches!(result, Err(RepoError::Decode { .. })));
    }
}
