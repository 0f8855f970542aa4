//! Invalidation plan generation.
//!
//! Merges the patterns of every binding matched by a batch of write events into the
//! smallest equivalent set of purges.

use std::collections::{BTreeSet, HashSet};
use std::fmt;

use super::events::CacheEvent;
use super::keys::KeyPattern;
use super::registry::BindingRegistry;

/// Purges to apply for a batch of events.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct InvalidationPlan {
    /// Patterns to purge; no pattern is covered by another.
    pub patterns: Vec<KeyPattern>,
    /// Number of distinct events merged into the plan.
    pub event_count: usize,
}

impl fmt::Display for InvalidationPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "InvalidationPlan {{ events: {}, purge: [", self.event_count)?;
        for (index, pattern) in self.patterns.iter().enumerate() {
            if index > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{pattern}")?;
        }
        f.write_str("] }")
    }
}

impl InvalidationPlan {
    /// Merge events into a plan.
    ///
    /// - Deduplicates by event ID
    /// - Collects the patterns of every matching binding
    /// - Drops patterns already covered by a wider prefix
    pub fn from_events(events: &[CacheEvent], registry: &BindingRegistry) -> Self {
        let mut seen_ids = HashSet::new();
        let mut collected = BTreeSet::new();
        let mut event_count = 0;

        for event in events.iter().filter(|event| seen_ids.insert(event.id)) {
            event_count += 1;
            for binding in registry.matching(event.kind, event.op) {
                collected.extend(binding.patterns.iter().cloned());
            }
        }

        let candidates: Vec<KeyPattern> = collected.into_iter().collect();
        let patterns = candidates
            .iter()
            .filter(|pattern| {
                !candidates
                    .iter()
                    .any(|other| other != *pattern && pattern.is_covered_by(other))
            })
            .cloned()
            .collect();

        Self {
            patterns,
            event_count,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }
}
