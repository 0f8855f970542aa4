//! Backend-neutral query descriptions.
//!
//! A [`Specification`] is plain data: a predicate tree, an optional ordering key, the
//! owned collections to populate, and a skip/take window. Repositories validate it
//! against the entity's columns and translate it into their own SQL dialect, so the
//! same value can be run against every backend and compared.

use std::fmt;
use std::marker::PhantomData;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::schema::{Column, Entity};
use crate::domain::types::ColumnType;
use crate::domain::values::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompareOp {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
}

impl CompareOp {
    pub fn as_sql(self) -> &'static str {
        match self {
            CompareOp::Eq => "=",
            CompareOp::Ne => "<>",
            CompareOp::Gt => ">",
            CompareOp::Ge => ">=",
            CompareOp::Lt => "<",
            CompareOp::Le => "<=",
        }
    }
}

impl fmt::Display for CompareOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_sql())
    }
}

/// Filter expression over scalar columns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Predicate {
    All,
    Compare {
        field: String,
        cmp: CompareOp,
        value: Value,
    },
    EqIgnoreCase {
        field: String,
        value: String,
    },
    Contains {
        field: String,
        needle: String,
        ignore_case: bool,
    },
    In {
        field: String,
        values: Vec<Value>,
    },
    IsNull {
        field: String,
    },
    IsNotNull {
        field: String,
    },
    And {
        predicates: Vec<Predicate>,
    },
    Or {
        predicates: Vec<Predicate>,
    },
    Not {
        predicate: Box<Predicate>,
    },
}

impl Predicate {
    fn compare(field: &str, cmp: CompareOp, value: impl Into<Value>) -> Self {
        Predicate::Compare {
            field: field.to_string(),
            cmp,
            value: value.into(),
        }
    }

    pub fn eq(field: &str, value: impl Into<Value>) -> Self {
        Self::compare(field, CompareOp::Eq, value)
    }

    pub fn ne(field: &str, value: impl Into<Value>) -> Self {
        Self::compare(field, CompareOp::Ne, value)
    }

    pub fn gt(field: &str, value: impl Into<Value>) -> Self {
        Self::compare(field, CompareOp::Gt, value)
    }

    pub fn ge(field: &str, value: impl Into<Value>) -> Self {
        Self::compare(field, CompareOp::Ge, value)
    }

    pub fn lt(field: &str, value: impl Into<Value>) -> Self {
        Self::compare(field, CompareOp::Lt, value)
    }

    pub fn le(field: &str, value: impl Into<Value>) -> Self {
        Self::compare(field, CompareOp::Le, value)
    }

    pub fn eq_ignore_case(field: &str, value: impl Into<String>) -> Self {
        Predicate::EqIgnoreCase {
            field: field.to_string(),
            value: value.into(),
        }
    }

    pub fn contains(field: &str, needle: impl Into<String>) -> Self {
        Predicate::Contains {
            field: field.to_string(),
            needle: needle.into(),
            ignore_case: false,
        }
    }

    pub fn contains_ignore_case(field: &str, needle: impl Into<String>) -> Self {
        Predicate::Contains {
            field: field.to_string(),
            needle: needle.into(),
            ignore_case: true,
        }
    }

    pub fn is_in<V: Into<Value>>(field: &str, values: impl IntoIterator<Item = V>) -> Self {
        Predicate::In {
            field: field.to_string(),
            values: values.into_iter().map(Into::into).collect(),
        }
    }

    pub fn is_null(field: &str) -> Self {
        Predicate::IsNull {
            field: field.to_string(),
        }
    }

    pub fn is_not_null(field: &str) -> Self {
        Predicate::IsNotNull {
            field: field.to_string(),
        }
    }

    pub fn and(self, other: Predicate) -> Self {
        match (self, other) {
            (Predicate::All, other) | (other, Predicate::All) => other,
            (Predicate::And { mut predicates }, other) => {
                predicates.push(other);
                Predicate::And { predicates }
            }
            (left, right) => Predicate::And {
                predicates: vec![left, right],
            },
        }
    }

    pub fn or(self, other: Predicate) -> Self {
        match self {
            Predicate::Or { mut predicates } => {
                predicates.push(other);
                Predicate::Or { predicates }
            }
            left => Predicate::Or {
                predicates: vec![left, other],
            },
        }
    }

    pub fn negate(self) -> Self {
        Predicate::Not {
            predicate: Box::new(self),
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Predicate::All => "all",
            Predicate::Compare { .. } => "compare",
            Predicate::EqIgnoreCase { .. } => "eq_ignore_case",
            Predicate::Contains { .. } => "contains",
            Predicate::In { .. } => "in",
            Predicate::IsNull { .. } => "is_null",
            Predicate::IsNotNull { .. } => "is_not_null",
            Predicate::And { .. } => "and",
            Predicate::Or { .. } => "or",
            Predicate::Not { .. } => "not",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    #[default]
    Asc,
    Desc,
}

impl Direction {
    pub fn as_sql(self) -> &'static str {
        match self {
            Direction::Asc => "ASC",
            Direction::Desc => "DESC",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderBy {
    pub field: String,
    pub direction: Direction,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SpecError {
    #[error("unknown field `{field}`")]
    UnknownField { field: String },
    #[error("field `{field}` cannot be used in `{op}` (column type {ty})")]
    UnsupportedOperator {
        field: String,
        op: &'static str,
        ty: ColumnType,
    },
    #[error("field `{field}` expects {expected}, got {found}")]
    TypeMismatch {
        field: String,
        expected: ColumnType,
        found: &'static str,
    },
    #[error("`{field}` compared with null; use is_null / is_not_null")]
    NullComparison { field: String },
    #[error("`{name}` is not an owned collection")]
    UnknownInclude { name: String },
}

/// Immutable query description for entities of type `T`.
///
/// Builder methods consume and return the value, so a shared `Specification` is never
/// mutated in place.
#[derive(Debug, Serialize, Deserialize)]
#[serde(bound = "")]
pub struct Specification<T> {
    predicate: Predicate,
    order: Option<OrderBy>,
    include: Vec<String>,
    skip: u64,
    take: Option<u64>,
    #[serde(skip)]
    marker: PhantomData<fn() -> T>,
}

impl<T> Clone for Specification<T> {
    fn clone(&self) -> Self {
        Self {
            predicate: self.predicate.clone(),
            order: self.order.clone(),
            include: self.include.clone(),
            skip: self.skip,
            take: self.take,
            marker: PhantomData,
        }
    }
}

impl<T> PartialEq for Specification<T> {
    fn eq(&self, other: &Self) -> bool {
        self.predicate == other.predicate
            && self.order == other.order
            && self.include == other.include
            && self.skip == other.skip
            && self.take == other.take
    }
}

impl<T> Default for Specification<T> {
    fn default() -> Self {
        Self::all()
    }
}

impl<T> Specification<T> {
    pub fn all() -> Self {
        Self {
            predicate: Predicate::All,
            order: None,
            include: Vec::new(),
            skip: 0,
            take: None,
            marker: PhantomData,
        }
    }

    pub fn filter(predicate: Predicate) -> Self {
        Self::all().and(predicate)
    }

    /// Narrow the predicate with an additional conjunct.
    pub fn and(mut self, predicate: Predicate) -> Self {
        self.predicate = std::mem::replace(&mut self.predicate, Predicate::All).and(predicate);
        self
    }

    pub fn order_by(mut self, field: &str, direction: Direction) -> Self {
        self.order = Some(OrderBy {
            field: field.to_string(),
            direction,
        });
        self
    }

    pub fn include(mut self, collection: &str) -> Self {
        if !self.include.iter().any(|name| name == collection) {
            self.include.push(collection.to_string());
        }
        self
    }

    pub fn skip(mut self, skip: u64) -> Self {
        self.skip = skip;
        self
    }

    pub fn take(mut self, take: u64) -> Self {
        self.take = Some(take);
        self
    }

    /// At most one row, keeping an explicit `take(0)`.
    pub fn first(self) -> Self {
        let take = self.take.map_or(1, |take| take.min(1));
        self.take(take)
    }

    pub fn predicate(&self) -> &Predicate {
        &self.predicate
    }

    pub fn ordering(&self) -> Option<&OrderBy> {
        self.order.as_ref()
    }

    pub fn includes(&self) -> &[String] {
        &self.include
    }

    pub fn includes_collection(&self, name: &str) -> bool {
        self.include.iter().any(|included| included == name)
    }

    pub fn skip_count(&self) -> u64 {
        self.skip
    }

    pub fn take_count(&self) -> Option<u64> {
        self.take
    }

    /// True when the window can only produce an empty result.
    pub fn is_empty_window(&self) -> bool {
        self.take == Some(0)
    }
}

impl<T: Entity> Specification<T> {
    /// Check every referenced field and value against `T`'s columns.
    pub fn validate(&self) -> Result<(), SpecError> {
        validate_predicate::<T>(&self.predicate)?;

        if let Some(order) = &self.order {
            let column = queryable_column::<T>(&order.field, "order_by")?;
            if column.ty == ColumnType::Json {
                return Err(unsupported(&order.field, "order_by", column.ty));
            }
        }

        for name in &self.include {
            match T::column(name) {
                Some(column) if column.owned => {}
                _ => return Err(SpecError::UnknownInclude { name: name.clone() }),
            }
        }

        Ok(())
    }
}

fn unsupported(field: &str, op: &'static str, ty: ColumnType) -> SpecError {
    SpecError::UnsupportedOperator {
        field: field.to_string(),
        op,
        ty,
    }
}

fn queryable_column<T: Entity>(field: &str, op: &'static str) -> Result<&'static Column, SpecError> {
    let column = T::column(field).ok_or_else(|| SpecError::UnknownField {
        field: field.to_string(),
    })?;
    if column.owned {
        return Err(unsupported(field, op, column.ty));
    }
    Ok(column)
}

fn check_value(field: &str, column: &Column, value: &Value) -> Result<(), SpecError> {
    match value.column_type() {
        None => Err(SpecError::NullComparison {
            field: field.to_string(),
        }),
        Some(found) if found == column.ty => Ok(()),
        Some(_) => Err(SpecError::TypeMismatch {
            field: field.to_string(),
            expected: column.ty,
            found: value.type_name(),
        }),
    }
}

fn validate_predicate<T: Entity>(predicate: &Predicate) -> Result<(), SpecError> {
    match predicate {
        Predicate::All => Ok(()),
        Predicate::Compare { field, value, .. } => {
            let column = queryable_column::<T>(field, predicate.name())?;
            if !column.is_queryable() {
                return Err(unsupported(field, predicate.name(), column.ty));
            }
            check_value(field, column, value)
        }
        Predicate::In { field, values } => {
            let column = queryable_column::<T>(field, predicate.name())?;
            if !column.is_queryable() {
                return Err(unsupported(field, predicate.name(), column.ty));
            }
            values
                .iter()
                .try_for_each(|value| check_value(field, column, value))
        }
        Predicate::EqIgnoreCase { field, .. } | Predicate::Contains { field, .. } => {
            let column = queryable_column::<T>(field, predicate.name())?;
            if column.ty != ColumnType::Text {
                return Err(unsupported(field, predicate.name(), column.ty));
            }
            Ok(())
        }
        Predicate::IsNull { field } | Predicate::IsNotNull { field } => {
            queryable_column::<T>(field, predicate.name()).map(|_| ())
        }
        Predicate::And { predicates } | Predicate::Or { predicates } => predicates
            .iter()
            .try_for_each(|inner| validate_predicate::<T>(inner)),
        Predicate::Not { predicate } => validate_predicate::<T>(predicate),
    }
}
