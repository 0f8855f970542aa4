//! Cache write events.
//!
//! A write event records that a repository write of one entity kind succeeded. The
//! trigger turns it into an invalidation plan and applies it before the write returns.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use uuid::Uuid;

use crate::domain::types::EntityKind;

/// Monotonic epoch for ordering events within this process.
pub type Epoch = u64;

/// Kind of repository write that produced an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WriteOp {
    Added,
    Updated,
    Deleted,
}

impl WriteOp {
    pub const ALL: &'static [WriteOp] = &[WriteOp::Added, WriteOp::Updated, WriteOp::Deleted];

    pub fn as_str(self) -> &'static str {
        match self {
            WriteOp::Added => "added",
            WriteOp::Updated => "updated",
            WriteOp::Deleted => "deleted",
        }
    }
}

impl fmt::Display for WriteOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A successful write, as seen by the cache.
#[derive(Debug, Clone)]
pub struct CacheEvent {
    /// Unique identifier for idempotency (UUIDv4).
    pub id: Uuid,
    /// Monotonic epoch for ordering within this process.
    pub epoch: Epoch,
    /// Entity kind that was written.
    pub kind: EntityKind,
    pub op: WriteOp,
    /// Identity of the written entity.
    pub entity_id: Uuid,
}

impl CacheEvent {
    pub fn new(kind: EntityKind, op: WriteOp, entity_id: Uuid, epoch: Epoch) -> Self {
        Self {
            id: Uuid::new_v4(),
            epoch,
            kind,
            op,
            entity_id,
        }
    }
}

/// Source of event epochs.
#[derive(Debug, Default)]
pub struct EpochCounter(AtomicU64);

impl EpochCounter {
    pub fn next(&self) -> Epoch {
        self.0.fetch_add(1, Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_creation() {
        let entity_id = Uuid::new_v4();
        let event = CacheEvent::new(EntityKind::Post, WriteOp::Updated, entity_id, 42);

        assert_eq!(event.epoch, 42);
        assert_eq!(event.kind, EntityKind::Post);
        assert_eq!(event.entity_id, entity_id);
        assert!(!event.id.is_nil());
    }

    #[test]
    fn epoch_monotonicity() {
        let counter = EpochCounter::default();

        let e1 = counter.next();
        let e2 = counter.next();
        let e3 = counter.next();

        assert!(e1 < e2);
        assert!(e2 < e3);
    }
}
