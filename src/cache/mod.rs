//! Scriptorium read cache.
//!
//! A process-local key/value store in front of the hot, rarely written aggregates
//! (configuration, categories, menus, sitemap, feeds):
//!
//! - **Store**: single-flight `get_or_compute`, exact/prefix invalidation, sliding
//!   expiry per region
//! - **Bindings**: static `entity kind written -> key patterns` rules
//! - **Decorator**: repository wrapper that fires bindings before a write returns
//!
//! ## Configuration
//!
//! Sliding expiry is set per region in `scriptorium.toml`:
//!
//! ```toml
//! [cache.regions]
//! sitemap = 60
//! ```

mod config;
mod events;
mod keys;
mod lock;
mod middleware;
mod planner;
mod registry;
mod store;
mod trigger;

pub use config::CacheConfig;
pub use events::{CacheEvent, Epoch, EpochCounter, WriteOp};
pub use keys::{CacheKey, KeyPattern};
pub use middleware::InvalidatingRepository;
pub use planner::InvalidationPlan;
pub use registry::{BindingRegistry, InvalidationBinding};
pub use store::CacheStore;
pub use trigger::CacheTrigger;

/// Metric names emitted by the cache.
pub mod metric_names {
    pub use super::store::{
        METRIC_CACHE_COMPUTE, METRIC_CACHE_COMPUTE_FAILED, METRIC_CACHE_EXPIRED,
        METRIC_CACHE_HIT, METRIC_CACHE_INVALIDATED, METRIC_CACHE_MISS,
    };
}
