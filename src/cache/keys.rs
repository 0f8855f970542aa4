//! Cache key definitions.
//!
//! Keys are strings namespaced `region:rest`. The region is the entity kind or the
//! derived aggregate a key belongs to, and selects the sliding-expiry window.

use std::borrow::Cow;
use std::fmt;

/// A cache entry key, `region:rest`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(String);

impl CacheKey {
    /// Build a key from a region and the region-local remainder.
    pub fn new(region: &str, rest: impl fmt::Display) -> Self {
        Self(format!("{region}:{rest}"))
    }

    /// Wrap an already-namespaced key string.
    pub fn raw(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Region part; a key without `:` is its own region.
    pub fn region(&self) -> &str {
        region_of(&self.0)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CacheKey {
    fn from(value: &str) -> Self {
        Self::raw(value)
    }
}

pub(crate) fn region_of(key: &str) -> &str {
    key.split_once(':').map_or(key, |(region, _)| region)
}

/// Selects cache entries for invalidation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum KeyPattern {
    /// One key.
    Exact(Cow<'static, str>),
    /// Every key starting with the prefix.
    Prefix(Cow<'static, str>),
}

impl KeyPattern {
    pub const fn prefix(prefix: &'static str) -> Self {
        KeyPattern::Prefix(Cow::Borrowed(prefix))
    }

    pub fn exact(key: impl Into<String>) -> Self {
        KeyPattern::Exact(Cow::Owned(key.into()))
    }

    pub fn matches(&self, key: &str) -> bool {
        match self {
            KeyPattern::Exact(exact) => key == &**exact,
            KeyPattern::Prefix(prefix) => key.starts_with(&**prefix),
        }
    }

    /// Whether every key this pattern selects is also selected by `other`.
    pub fn is_covered_by(&self, other: &KeyPattern) -> bool {
        match (self, other) {
            (KeyPattern::Exact(exact), _) => other.matches(exact),
            (KeyPattern::Prefix(prefix), KeyPattern::Prefix(wider)) => {
                prefix.starts_with(&**wider)
            }
            (KeyPattern::Prefix(_), KeyPattern::Exact(_)) => false,
        }
    }
}

impl From<&CacheKey> for KeyPattern {
    fn from(key: &CacheKey) -> Self {
        KeyPattern::exact(key.as_str())
    }
}

impl fmt::Display for KeyPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyPattern::Exact(key) => f.write_str(key),
            KeyPattern::Prefix(prefix) => write!(f, "{prefix}*"),
        }
    }
}
