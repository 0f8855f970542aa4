//! Shared domain enumerations.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Kinds of stored aggregates. Each kind maps to one table and one cache region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Post,
    Category,
    Page,
    Menu,
    Comment,
    Pingback,
    Configuration,
}

impl EntityKind {
    pub const ALL: [EntityKind; 7] = [
        EntityKind::Post,
        EntityKind::Category,
        EntityKind::Page,
        EntityKind::Menu,
        EntityKind::Comment,
        EntityKind::Pingback,
        EntityKind::Configuration,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            EntityKind::Post => "post",
            EntityKind::Category => "category",
            EntityKind::Page => "page",
            EntityKind::Menu => "menu",
            EntityKind::Comment => "comment",
            EntityKind::Pingback => "pingback",
            EntityKind::Configuration => "configuration",
        }
    }

    /// Cache region holding values derived from this kind.
    pub fn region(self) -> &'static str {
        match self {
            EntityKind::Configuration => "config",
            other => other.as_str(),
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityKind {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        EntityKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == value)
            .ok_or_else(|| format!("unknown entity kind `{value}`"))
    }
}

/// Storage type of a mapped column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnType {
    Uuid,
    Text,
    Int,
    Bool,
    Timestamp,
    Json,
}

impl ColumnType {
    pub fn as_str(self) -> &'static str {
        match self {
            ColumnType::Uuid => "uuid",
            ColumnType::Text => "text",
            ColumnType::Int => "int",
            ColumnType::Bool => "bool",
            ColumnType::Timestamp => "timestamp",
            ColumnType::Json => "json",
        }
    }
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entity_kind_round_trips_through_str() {
        for kind in EntityKind::ALL {
            assert_eq!(kind.as_str().parse::<EntityKind>(), Ok(kind));
        }
        assert!("widget".parse::<EntityKind>().is_err());
    }

    #[test]
    fn configuration_uses_short_region() {
        assert_eq!(EntityKind::Configuration.region(), "config");
        assert_eq!(EntityKind::Post.region(), "post");
    }
}
