//! Cache configuration.
//!
//! Sliding expiry is configured per region as `{region: minutes}` under `[cache.regions]`
//! in `scriptorium.toml`:
//!
//! ```toml
//! [cache.regions]
//! sitemap = 60
//! feed = 30
//! ```
//!
//! Regions that are not listed never expire.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::Deserialize;

const SECONDS_PER_MINUTE: u64 = 60;

/// Cache configuration, read once at startup.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Sliding expiration per region, in minutes of no access.
    pub regions: BTreeMap<String, u64>,
}

impl From<&crate::config::CacheSettings> for CacheConfig {
    fn from(settings: &crate::config::CacheSettings) -> Self {
        Self {
            regions: settings
                .regions
                .iter()
                .map(|(region, minutes)| (region.clone(), u64::from(minutes.get())))
                .collect(),
        }
    }
}

impl CacheConfig {
    pub fn with_region(mut self, region: impl Into<String>, minutes: u64) -> Self {
        self.regions.insert(region.into(), minutes);
        self
    }

    /// Sliding window for `region`; `None` means entries never expire.
    pub fn sliding_expiration(&self, region: &str) -> Option<Duration> {
        self.regions
            .get(region)
            .filter(|minutes| **minutes > 0)
            .map(|minutes| Duration::from_secs(minutes.saturating_mul(SECONDS_PER_MINUTE)))
    }
}
