//! Static invalidation bindings.
//!
//! Each binding maps "entity kind K written by one of these operations" to the key
//! patterns that must be purged. Bindings are fixed at construction; nothing is
//! discovered at runtime.

use super::events::WriteOp;
use super::keys::KeyPattern;
use crate::domain::types::EntityKind;

/// One `(kind, ops) -> patterns` rule.
#[derive(Debug, Clone)]
pub struct InvalidationBinding {
    pub kind: EntityKind,
    pub ops: &'static [WriteOp],
    pub patterns: Vec<KeyPattern>,
}

impl InvalidationBinding {
    pub fn new(kind: EntityKind, ops: &'static [WriteOp], patterns: Vec<KeyPattern>) -> Self {
        Self {
            kind,
            ops,
            patterns,
        }
    }

    /// Binding for every write operation.
    pub fn on_any_write(kind: EntityKind, prefixes: &[&'static str]) -> Self {
        Self::new(
            kind,
            WriteOp::ALL,
            prefixes.iter().copied().map(KeyPattern::prefix).collect(),
        )
    }

    pub fn applies_to(&self, kind: EntityKind, op: WriteOp) -> bool {
        self.kind == kind && self.ops.contains(&op)
    }
}

/// The set of bindings consulted on every write.
#[derive(Debug, Clone, Default)]
pub struct BindingRegistry {
    bindings: Vec<InvalidationBinding>,
}

impl BindingRegistry {
    /// Registry without any binding.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Bindings for the site's cached aggregates.
    pub fn with_defaults() -> Self {
        Self::empty()
            .bind(InvalidationBinding::on_any_write(
                EntityKind::Configuration,
                &["config:", "feed:", "sitemap:"],
            ))
            .bind(InvalidationBinding::on_any_write(
                EntityKind::Category,
                &["category:", "feed:"],
            ))
            .bind(InvalidationBinding::on_any_write(EntityKind::Menu, &["menu:"]))
            .bind(InvalidationBinding::on_any_write(
                EntityKind::Post,
                &["post:", "feed:", "sitemap:"],
            ))
            .bind(InvalidationBinding::on_any_write(
                EntityKind::Page,
                &["page:", "sitemap:"],
            ))
            .bind(InvalidationBinding::on_any_write(
                EntityKind::Comment,
                &["comment:"],
            ))
            .bind(InvalidationBinding::on_any_write(
                EntityKind::Pingback,
                &["pingback:"],
            ))
    }

    pub fn bind(mut self, binding: InvalidationBinding) -> Self {
        self.bindings.push(binding);
        self
    }

    pub fn matching(
        &self,
        kind: EntityKind,
        op: WriteOp,
    ) -> impl Iterator<Item = &InvalidationBinding> {
        self.bindings
            .iter()
            .filter(move |binding| binding.applies_to(kind, op))
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }
}
