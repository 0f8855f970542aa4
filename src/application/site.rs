//! Cached read models for the public site.
//!
//! Each aggregate lives under a cache key in the region of the entity it is derived
//! from, so the static invalidation bindings purge it when that entity is written.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use metrics::histogram;
use serde::Serialize;
use time::OffsetDateTime;
use tracing::{debug, info};
use uuid::Uuid;

use crate::application::repos::{RepoError, Repository};
use crate::application::specification::{Direction, Predicate, Specification};
use crate::cache::{CacheKey, CacheStore};
use crate::domain::entities::{
    BlogConfigurationRecord, CategoryRecord, MenuRecord, PageRecord, PostRecord,
};

pub const METRIC_CACHE_WARM_MS: &str = "scriptorium_cache_warm_ms";

const FEED_CONFIG_KEY: &str = "feed";
const DEFAULT_FEED_ITEM_COUNT: u64 = 20;

/// Configuration blobs keyed by `cfg_key`.
pub type SiteConfiguration = BTreeMap<String, serde_json::Value>;

/// Repositories the read models are computed from.
#[derive(Clone)]
pub struct SiteRepositories {
    pub posts: Arc<dyn Repository<PostRecord>>,
    pub categories: Arc<dyn Repository<CategoryRecord>>,
    pub pages: Arc<dyn Repository<PageRecord>>,
    pub menus: Arc<dyn Repository<MenuRecord>>,
    pub configurations: Arc<dyn Repository<BlogConfigurationRecord>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SitemapKind {
    Post,
    Page,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SitemapEntry {
    pub kind: SitemapKind,
    pub path: String,
    #[serde(with = "time::serde::rfc3339")]
    pub last_modified: OffsetDateTime,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FeedItem {
    pub id: Uuid,
    pub title: String,
    pub slug: String,
    pub author: String,
    pub excerpt: String,
    #[serde(with = "time::serde::rfc3339")]
    pub published_at: OffsetDateTime,
    pub category_id: Option<Uuid>,
}

impl FeedItem {
    fn from_post(post: &PostRecord) -> Option<Self> {
        Some(Self {
            id: post.meta.id,
            title: post.title.clone(),
            slug: post.slug.clone(),
            author: post.author.clone(),
            excerpt: post.excerpt.clone(),
            published_at: post.pub_date?,
            category_id: post.category_id,
        })
    }
}

#[derive(Clone)]
pub struct SiteService {
    repos: SiteRepositories,
    cache: Arc<CacheStore>,
}

impl SiteService {
    pub fn new(repos: SiteRepositories, cache: Arc<CacheStore>) -> Self {
        Self { repos, cache }
    }

    pub fn cache(&self) -> &Arc<CacheStore> {
        &self.cache
    }

    pub async fn configuration(&self) -> Result<Arc<SiteConfiguration>, RepoError> {
        let key = CacheKey::new("config", "all");
        self.cache
            .get_or_compute(&key, || async {
                let spec = Specification::all().order_by("cfg_key", Direction::Asc);
                let records = self.repos.configurations.query(&spec).await?;
                Ok(records
                    .into_iter()
                    .map(|record| (record.cfg_key, record.cfg_value))
                    .collect::<SiteConfiguration>())
            })
            .await
    }

    pub async fn categories(&self) -> Result<Arc<Vec<CategoryRecord>>, RepoError> {
        let key = CacheKey::new("category", "all");
        self.cache
            .get_or_compute(&key, || async {
                let spec = Specification::all().order_by("display_name", Direction::Asc);
                self.repos.categories.query(&spec).await
            })
            .await
    }

    /// Top-level menus in display order with their sub-menus loaded.
    pub async fn menu_tree(&self) -> Result<Arc<Vec<MenuRecord>>, RepoError> {
        let key = CacheKey::new("menu", "tree");
        self.cache
            .get_or_compute(&key, || async {
                let spec = Specification::all()
                    .order_by("display_order", Direction::Asc)
                    .include("sub_menus");
                self.repos.menus.query(&spec).await
            })
            .await
    }

    pub async fn sitemap(&self) -> Result<Arc<Vec<SitemapEntry>>, RepoError> {
        let key = CacheKey::new("sitemap", "entries");
        self.cache
            .get_or_compute(&key, || async {
                let published = Predicate::eq("is_published", true);
                let post_spec =
                    Specification::filter(published.clone().and(Predicate::is_not_null("pub_date")))
                        .order_by("pub_date", Direction::Desc);
                let page_spec = Specification::filter(published).order_by("slug", Direction::Asc);
                let (posts, pages) = tokio::try_join!(
                    self.repos.posts.query(&post_spec),
                    self.repos.pages.query(&page_spec),
                )?;

                let entries = posts
                    .iter()
                    .map(|post| SitemapEntry {
                        kind: SitemapKind::Post,
                        path: format!("/post/{}", post.slug),
                        last_modified: post.meta.updated_at,
                    })
                    .chain(pages.iter().map(|page| SitemapEntry {
                        kind: SitemapKind::Page,
                        path: format!("/page/{}", page.slug),
                        last_modified: page.meta.updated_at,
                    }))
                    .collect::<Vec<_>>();
                Ok(entries)
            })
            .await
    }

    /// Newest published posts, optionally limited to one category by route name.
    ///
    /// The item count comes from the `feed` configuration blob. An unknown category
    /// yields an empty feed.
    pub async fn feed(&self, category: Option<&str>) -> Result<Arc<Vec<FeedItem>>, RepoError> {
        let key = match category {
            Some(route) => CacheKey::new("feed", format_args!("category:{route}")),
            None => CacheKey::new("feed", "all"),
        };
        self.cache
            .get_or_compute(&key, || async {
                let item_count = feed_item_count(&*self.configuration().await?);

                let mut predicate =
                    Predicate::eq("is_published", true).and(Predicate::is_not_null("pub_date"));
                if let Some(route) = category {
                    let spec = Specification::filter(Predicate::eq("route_name", route));
                    let found = self.repos.categories.first_or_default(&spec).await?;
                    let Some(found) = found else {
                        debug!(category = route, "Feed requested for unknown category");
                        return Ok(Vec::new());
                    };
                    predicate = predicate.and(Predicate::eq("category_id", found.meta.id));
                }

                let spec = Specification::filter(predicate)
                    .order_by("pub_date", Direction::Desc)
                    .take(item_count);
                let posts = self.repos.posts.query(&spec).await?;
                Ok(posts.iter().filter_map(FeedItem::from_post).collect::<Vec<_>>())
            })
            .await
    }

    /// Post by slug, matched case-insensitively. Absence is cached as well.
    pub async fn post_by_slug(&self, slug: &str) -> Result<Arc<Option<PostRecord>>, RepoError> {
        let normalized = slug.trim().to_ascii_lowercase();
        let key = CacheKey::new("post", format_args!("slug:{normalized}"));
        self.cache
            .get_or_compute(&key, || async {
                let spec =
                    Specification::filter(Predicate::eq_ignore_case("slug", normalized.as_str()));
                self.repos.posts.first_or_default(&spec).await
            })
            .await
    }

    /// Compute every site-wide aggregate so the first requests hit memory.
    pub async fn warm(&self) -> Result<usize, RepoError> {
        let started_at = Instant::now();
        tokio::try_join!(
            self.configuration(),
            self.categories(),
            self.menu_tree(),
            self.sitemap(),
            self.feed(None),
        )?;
        let elapsed = started_at.elapsed();
        histogram!(METRIC_CACHE_WARM_MS).record(elapsed.as_secs_f64() * 1000.0);

        let entries = self.cache.len();
        info!(entries, elapsed_ms = elapsed.as_millis() as u64, "Cache warmed");
        Ok(entries)
    }
}

fn feed_item_count(configuration: &SiteConfiguration) -> u64 {
    configuration
        .get(FEED_CONFIG_KEY)
        .and_then(|feed| feed.get("item_count"))
        .and_then(serde_json::Value::as_u64)
        .filter(|count| *count > 0)
        .unwrap_or(DEFAULT_FEED_ITEM_COUNT)
}
