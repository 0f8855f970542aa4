//! Write-interception decorator for repositories.
//!
//! Wraps any [`Repository`] and fires the cache trigger after each successful write,
//! before the write call returns. Reads pass straight through.

use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::instrument;
use uuid::Uuid;

use super::events::WriteOp;
use super::trigger::CacheTrigger;
use crate::application::repos::{RepoError, Repository};
use crate::application::specification::Specification;
use crate::domain::schema::Entity;

/// Repository decorator that keeps the cache consistent with writes.
///
/// Failed writes, including concurrency conflicts, fire nothing.
pub struct InvalidatingRepository<T> {
    inner: Arc<dyn Repository<T>>,
    trigger: Arc<CacheTrigger>,
    marker: PhantomData<fn() -> T>,
}

impl<T: Entity> InvalidatingRepository<T> {
    pub fn new(inner: Arc<dyn Repository<T>>, trigger: Arc<CacheTrigger>) -> Self {
        Self {
            inner,
            trigger,
            marker: PhantomData,
        }
    }

    /// Shorthand for wrapping and erasing in one step.
    pub fn wrap(inner: Arc<dyn Repository<T>>, trigger: Arc<CacheTrigger>) -> Arc<dyn Repository<T>> {
        Arc::new(Self::new(inner, trigger))
    }

    fn fire(&self, op: WriteOp, id: Uuid) {
        self.trigger.fire(T::KIND, op, id);
    }
}

#[async_trait]
impl<T: Entity> Repository<T> for InvalidatingRepository<T> {
    async fn get_by_id(&self, id: Uuid) -> Result<Option<T>, RepoError> {
        self.inner.get_by_id(id).await
    }

    async fn query(&self, spec: &Specification<T>) -> Result<Vec<T>, RepoError> {
        self.inner.query(spec).await
    }

    async fn first_or_default(&self, spec: &Specification<T>) -> Result<Option<T>, RepoError> {
        self.inner.first_or_default(spec).await
    }

    async fn count(&self, spec: &Specification<T>) -> Result<u64, RepoError> {
        self.inner.count(spec).await
    }

    #[instrument(skip_all, fields(kind = %T::KIND))]
    async fn add(&self, entity: T) -> Result<T, RepoError> {
        let stored = self.inner.add(entity).await?;
        self.fire(WriteOp::Added, stored.id());
        Ok(stored)
    }

    #[instrument(skip_all, fields(kind = %T::KIND, id = %entity.id()))]
    async fn update(&self, entity: T) -> Result<T, RepoError> {
        let stored = self.inner.update(entity).await?;
        self.fire(WriteOp::Updated, stored.id());
        Ok(stored)
    }

    #[instrument(skip_all, fields(kind = %T::KIND, id = %id))]
    async fn delete(&self, id: Uuid) -> Result<(), RepoError> {
        self.inner.delete(id).await?;
        self.fire(WriteOp::Deleted, id);
        Ok(())
    }

    /// Raw statements bypass the bindings; callers invalidate explicitly.
    async fn execute_raw(&self, statement: &str) -> Result<u64, RepoError> {
        self.inner.execute_raw(statement).await
    }
}
