//! Table mapping between entities and backend-neutral rows.

use std::collections::HashMap;

use serde::{Serialize, de::DeserializeOwned};
use thiserror::Error;
use time::OffsetDateTime;
use uuid::Uuid;

use super::types::{ColumnType, EntityKind};
use super::values::Value;

/// A mapped column of an entity table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Column {
    pub name: &'static str,
    pub ty: ColumnType,
    pub nullable: bool,
    /// Owned sub-collection stored inside the parent row.
    pub owned: bool,
}

impl Column {
    const fn new(name: &'static str, ty: ColumnType) -> Self {
        Self {
            name,
            ty,
            nullable: false,
            owned: false,
        }
    }

    pub const fn uuid(name: &'static str) -> Self {
        Self::new(name, ColumnType::Uuid)
    }

    pub const fn text(name: &'static str) -> Self {
        Self::new(name, ColumnType::Text)
    }

    pub const fn int(name: &'static str) -> Self {
        Self::new(name, ColumnType::Int)
    }

    pub const fn bool(name: &'static str) -> Self {
        Self::new(name, ColumnType::Bool)
    }

    pub const fn timestamp(name: &'static str) -> Self {
        Self::new(name, ColumnType::Timestamp)
    }

    pub const fn json(name: &'static str) -> Self {
        Self::new(name, ColumnType::Json)
    }

    pub const fn owned(name: &'static str) -> Self {
        Self {
            name,
            ty: ColumnType::Json,
            nullable: false,
            owned: true,
        }
    }

    pub const fn nullable(self) -> Self {
        Self {
            nullable: true,
            ..self
        }
    }

    /// Whether predicates and ordering may reference this column.
    pub fn is_queryable(&self) -> bool {
        !self.owned && self.ty != ColumnType::Json
    }
}

pub const ID: &str = "id";
pub const VERSION: &str = "version";
pub const CREATED_AT: &str = "created_at";
pub const UPDATED_AT: &str = "updated_at";

/// Record header columns present on every table.
pub const HEADER_COLUMNS: [Column; 4] = [
    Column::uuid(ID),
    Column::int(VERSION),
    Column::timestamp(CREATED_AT),
    Column::timestamp(UPDATED_AT),
];

/// Identity and write bookkeeping carried by every stored entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordMeta {
    pub id: Uuid,
    /// Row version; `0` means never stored.
    pub version: i64,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

impl RecordMeta {
    pub fn with_id(id: Uuid) -> Self {
        Self {
            id,
            ..Self::default()
        }
    }
}

impl Default for RecordMeta {
    fn default() -> Self {
        Self {
            id: Uuid::nil(),
            version: 0,
            created_at: OffsetDateTime::UNIX_EPOCH,
            updated_at: OffsetDateTime::UNIX_EPOCH,
        }
    }
}

/// Owned sub-collection that may or may not have been loaded.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Related<T> {
    #[default]
    NotLoaded,
    Loaded(Vec<T>),
}

impl<T> Related<T> {
    pub fn is_loaded(&self) -> bool {
        matches!(self, Related::Loaded(_))
    }

    pub fn as_slice(&self) -> Option<&[T]> {
        match self {
            Related::Loaded(items) => Some(items),
            Related::NotLoaded => None,
        }
    }
}

impl<T: Serialize> Related<T> {
    /// Encoded column value; `None` when the collection was not loaded.
    pub fn to_value(&self, column: &'static str) -> Result<Option<Value>, SchemaError> {
        match self {
            Related::NotLoaded => Ok(None),
            Related::Loaded(items) => encode_json(column, items).map(Some),
        }
    }
}

impl<T> From<Vec<T>> for Related<T> {
    fn from(items: Vec<T>) -> Self {
        Related::Loaded(items)
    }
}

#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("column `{column}` missing from row")]
    MissingColumn { column: &'static str },
    #[error("column `{column}` expected {expected}, found {found}")]
    TypeMismatch {
        column: &'static str,
        expected: ColumnType,
        found: &'static str,
    },
    #[error("column `{column}` holds an invalid value: {reason}")]
    InvalidValue { column: &'static str, reason: String },
    #[error("column `{column}` json could not be mapped: {source}")]
    Json {
        column: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

pub fn encode_json<S: Serialize + ?Sized>(
    column: &'static str,
    value: &S,
) -> Result<Value, SchemaError> {
    serde_json::to_value(value)
        .map(Value::Json)
        .map_err(|source| SchemaError::Json { column, source })
}

/// Decoded row keyed by column name.
#[derive(Debug, Default)]
pub struct RowValues {
    values: HashMap<&'static str, Value>,
}

impl RowValues {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, column: &'static str, value: Value) {
        self.values.insert(column, value);
    }

    pub fn contains(&self, column: &str) -> bool {
        self.values.contains_key(column)
    }

    fn take(&mut self, column: &'static str) -> Result<Value, SchemaError> {
        self.values
            .remove(column)
            .ok_or(SchemaError::MissingColumn { column })
    }

    fn mismatch(column: &'static str, expected: ColumnType, found: &Value) -> SchemaError {
        SchemaError::TypeMismatch {
            column,
            expected,
            found: found.type_name(),
        }
    }

    pub fn text(&mut self, column: &'static str) -> Result<String, SchemaError> {
        match self.take(column)? {
            Value::Text(value) => Ok(value),
            other => Err(Self::mismatch(column, ColumnType::Text, &other)),
        }
    }

    pub fn opt_text(&mut self, column: &'static str) -> Result<Option<String>, SchemaError> {
        match self.take(column)? {
            Value::Null => Ok(None),
            Value::Text(value) => Ok(Some(value)),
            other => Err(Self::mismatch(column, ColumnType::Text, &other)),
        }
    }

    pub fn int(&mut self, column: &'static str) -> Result<i64, SchemaError> {
        match self.take(column)? {
            Value::Int(value) => Ok(value),
            other => Err(Self::mismatch(column, ColumnType::Int, &other)),
        }
    }

    pub fn bool(&mut self, column: &'static str) -> Result<bool, SchemaError> {
        match self.take(column)? {
            Value::Bool(value) => Ok(value),
            other => Err(Self::mismatch(column, ColumnType::Bool, &other)),
        }
    }

    pub fn uuid(&mut self, column: &'static str) -> Result<Uuid, SchemaError> {
        match self.take(column)? {
            Value::Uuid(value) => Ok(value),
            other => Err(Self::mismatch(column, ColumnType::Uuid, &other)),
        }
    }

    pub fn opt_uuid(&mut self, column: &'static str) -> Result<Option<Uuid>, SchemaError> {
        match self.take(column)? {
            Value::Null => Ok(None),
            Value::Uuid(value) => Ok(Some(value)),
            other => Err(Self::mismatch(column, ColumnType::Uuid, &other)),
        }
    }

    pub fn timestamp(&mut self, column: &'static str) -> Result<OffsetDateTime, SchemaError> {
        match self.take(column)? {
            Value::Timestamp(value) => Ok(value),
            other => Err(Self::mismatch(column, ColumnType::Timestamp, &other)),
        }
    }

    pub fn opt_timestamp(
        &mut self,
        column: &'static str,
    ) -> Result<Option<OffsetDateTime>, SchemaError> {
        match self.take(column)? {
            Value::Null => Ok(None),
            Value::Timestamp(value) => Ok(Some(value)),
            other => Err(Self::mismatch(column, ColumnType::Timestamp, &other)),
        }
    }

    pub fn json(&mut self, column: &'static str) -> Result<serde_json::Value, SchemaError> {
        match self.take(column)? {
            Value::Json(value) => Ok(value),
            other => Err(Self::mismatch(column, ColumnType::Json, &other)),
        }
    }

    pub fn json_as<T: DeserializeOwned>(&mut self, column: &'static str) -> Result<T, SchemaError> {
        let value = self.json(column)?;
        serde_json::from_value(value).map_err(|source| SchemaError::Json { column, source })
    }

    /// Owned collection; absent columns were not selected and decode as not loaded.
    pub fn related<T: DeserializeOwned>(
        &mut self,
        column: &'static str,
    ) -> Result<Related<T>, SchemaError> {
        if !self.contains(column) {
            return Ok(Related::NotLoaded);
        }
        self.json_as::<Vec<T>>(column).map(Related::Loaded)
    }
}

/// A stored aggregate mapped onto one table.
///
/// `COLUMNS` lists the business columns in the order `to_values` produces them; the
/// record header (`id`, `version`, `created_at`, `updated_at`) is implicit.
pub trait Entity: Clone + Send + Sync + 'static {
    const KIND: EntityKind;
    const TABLE: &'static str;
    const COLUMNS: &'static [Column];

    fn meta(&self) -> &RecordMeta;
    fn meta_mut(&mut self) -> &mut RecordMeta;

    /// Column values in `COLUMNS` order. `None` marks an owned collection that was
    /// not loaded and must be left untouched on update.
    fn to_values(&self) -> Result<Vec<Option<Value>>, SchemaError>;

    fn from_values(meta: RecordMeta, row: &mut RowValues) -> Result<Self, SchemaError>;

    fn id(&self) -> Uuid {
        self.meta().id
    }

    fn column(name: &str) -> Option<&'static Column> {
        HEADER_COLUMNS
            .iter()
            .chain(Self::COLUMNS.iter())
            .find(|column| column.name == name)
    }

    fn owned_columns() -> impl Iterator<Item = &'static Column> {
        Self::COLUMNS.iter().filter(|column| column.owned)
    }
}

/// Split a decoded row into its header and the remaining business values.
pub fn split_header(row: &mut RowValues) -> Result<RecordMeta, SchemaError> {
    Ok(RecordMeta {
        id: row.uuid(ID)?,
        version: row.int(VERSION)?,
        created_at: row.timestamp(CREATED_AT)?,
        updated_at: row.timestamp(UPDATED_AT)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn related_missing_column_is_not_loaded() {
        let mut row = RowValues::new();
        let related: Related<String> = row.related("children").expect("decode");
        assert_eq!(related, Related::NotLoaded);
    }

    #[test]
    fn related_column_decodes_in_order() {
        let mut row = RowValues::new();
        row.insert("children", Value::Json(serde_json::json!(["a", "b"])));
        let related: Related<String> = row.related("children").expect("decode");
        assert_eq!(
            related.as_slice(),
            Some(&["a".to_string(), "b".to_string()][..])
        );
    }

    #[test]
    fn type_mismatch_is_reported_with_column() {
        let mut row = RowValues::new();
        row.insert("title", Value::Int(3));
        let err = row.text("title").expect_err("mismatch");
        assert!(matches!(
            err,
            SchemaError::TypeMismatch {
                column: "title",
                expected: ColumnType::Text,
                found: "int"
            }
        ));
    }

    #[test]
    fn owned_and_json_columns_are_not_queryable() {
        assert!(!Column::owned("replies").is_queryable());
        assert!(!Column::json("tags").is_queryable());
        assert!(Column::text("slug").nullable().is_queryable());
    }
}
