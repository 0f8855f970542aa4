//! Cache trigger service.
//!
//! Applies invalidation bindings for a successful write. Firing is synchronous: when
//! `fire` returns, every entry the write could have made stale is gone.

use std::sync::Arc;

use tracing::{debug, info};
use uuid::Uuid;

use super::events::{CacheEvent, EpochCounter, WriteOp};
use super::planner::InvalidationPlan;
use super::registry::BindingRegistry;
use super::store::CacheStore;
use crate::domain::types::EntityKind;

/// Connects write events to the cache store through the binding registry.
pub struct CacheTrigger {
    store: Arc<CacheStore>,
    registry: BindingRegistry,
    epochs: EpochCounter,
}

impl CacheTrigger {
    pub fn new(store: Arc<CacheStore>, registry: BindingRegistry) -> Self {
        Self {
            store,
            registry,
            epochs: EpochCounter::default(),
        }
    }

    /// Trigger wired with the default bindings.
    pub fn with_defaults(store: Arc<CacheStore>) -> Self {
        Self::new(store, BindingRegistry::with_defaults())
    }

    pub fn store(&self) -> &Arc<CacheStore> {
        &self.store
    }

    pub fn registry(&self) -> &BindingRegistry {
        &self.registry
    }

    /// Purge everything bound to a write of `kind` and return the number of removed
    /// entries.
    pub fn fire(&self, kind: EntityKind, op: WriteOp, entity_id: Uuid) -> usize {
        let event = CacheEvent::new(kind, op, entity_id, self.epochs.next());
        self.apply(std::slice::from_ref(&event))
    }

    /// Apply a batch of events as one plan.
    pub fn apply(&self, events: &[CacheEvent]) -> usize {
        let plan = InvalidationPlan::from_events(events, &self.registry);
        if plan.is_empty() {
            debug!(event_count = events.len(), "Cache trigger skipped: no binding");
            return 0;
        }

        let removed: usize = plan
            .patterns
            .iter()
            .map(|pattern| self.store.invalidate(pattern))
            .sum();

        for event in events {
            info!(
                event_id = %event.id,
                event_epoch = event.epoch,
                event_kind = %event.kind,
                event_op = %event.op,
                entity_id = %event.entity_id,
                "Cache invalidation fired"
            );
        }
        debug!(plan = %plan, removed, "Cache invalidation plan applied");
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::keys::CacheKey;

    async fn fill(store: &CacheStore, keys: &[&str]) {
        for raw in keys {
            store
                .get_or_compute(&CacheKey::raw(*raw), || async { Ok::<_, ()>(()) })
                .await
                .expect("compute");
        }
    }

    #[tokio::test]
    async fn post_write_purges_post_feed_and_sitemap() {
        let store = Arc::new(CacheStore::default());
        fill(
            &store,
            &["post:slug:a", "feed:all", "sitemap:entries", "menu:tree"],
        )
        .await;

        let trigger = CacheTrigger::with_defaults(store.clone());
        let removed = trigger.fire(EntityKind::Post, WriteOp::Updated, Uuid::new_v4());

        assert_eq!(removed, 3);
        assert!(store.contains(&CacheKey::raw("menu:tree")));
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn unbound_write_leaves_cache_untouched() {
        let store = Arc::new(CacheStore::default());
        fill(&store, &["menu:tree"]).await;

        let trigger = CacheTrigger::new(store.clone(), BindingRegistry::empty());
        assert_eq!(
            trigger.fire(EntityKind::Menu, WriteOp::Added, Uuid::new_v4()),
            0
        );
        assert_eq!(store.len(), 1);
    }
}
