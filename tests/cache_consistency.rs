//! Cache consistency against a real SQLite database.
//!
//! Reads go through `SiteService`, writes through `InvalidatingRepository`; a read
//! issued after a write returns must never observe the pre-write aggregate.

mod support;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use scriptorium::application::repos::{RepoError, Repository};
use scriptorium::application::site::{SiteRepositories, SiteService};
use scriptorium::application::specification::{Predicate, Specification};
use scriptorium::cache::{CacheConfig, CacheKey, CacheStore, CacheTrigger, InvalidatingRepository};
use scriptorium::domain::entities::{
    BlogConfigurationRecord, CategoryRecord, MenuRecord, PageRecord, PostRecord, SubMenu,
};
use scriptorium::domain::schema::Entity;
use scriptorium::infra::db::DbHandle;
use serde_json::json;
use tempfile::TempDir;
use uuid::Uuid;

/// Counts reads that reach the database.
struct CountingRepository<T> {
    inner: Arc<dyn Repository<T>>,
    reads: Arc<AtomicUsize>,
}

#[async_trait]
impl<T: Entity> Repository<T> for CountingRepository<T> {
    async fn get_by_id(&self, id: Uuid) -> Result<Option<T>, RepoError> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        self.inner.get_by_id(id).await
    }

    async fn query(&self, spec: &Specification<T>) -> Result<Vec<T>, RepoError> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        // Widen the window in which concurrent readers pile up.
        tokio::time::sleep(Duration::from_millis(20)).await;
        self.inner.query(spec).await
    }

    async fn count(&self, spec: &Specification<T>) -> Result<u64, RepoError> {
        self.inner.count(spec).await
    }

    async fn add(&self, entity: T) -> Result<T, RepoError> {
        self.inner.add(entity).await
    }

    async fn update(&self, entity: T) -> Result<T, RepoError> {
        self.inner.update(entity).await
    }

    async fn delete(&self, id: Uuid) -> Result<(), RepoError> {
        self.inner.delete(id).await
    }

    async fn execute_raw(&self, statement: &str) -> Result<u64, RepoError> {
        self.inner.execute_raw(statement).await
    }
}

struct Site {
    _dir: TempDir,
    handle: DbHandle,
    store: Arc<CacheStore>,
    service: SiteService,
    repos: SiteRepositories,
    post_reads: Arc<AtomicUsize>,
}

fn wrap<T: Entity>(
    handle: &DbHandle,
    trigger: &Arc<CacheTrigger>,
    reads: &Arc<AtomicUsize>,
) -> Arc<dyn Repository<T>> {
    let counting: Arc<dyn Repository<T>> = Arc::new(CountingRepository {
        inner: handle.repository::<T>(),
        reads: reads.clone(),
    });
    InvalidatingRepository::wrap(counting, trigger.clone())
}

async fn site() -> Site {
    let dir = tempfile::tempdir().expect("temp dir");
    let handle = support::ready_handle(&support::sqlite_url(&dir)).await;
    let store = Arc::new(CacheStore::new(CacheConfig::default()));
    let trigger = Arc::new(CacheTrigger::with_defaults(store.clone()));

    let post_reads = Arc::new(AtomicUsize::new(0));
    let other_reads = Arc::new(AtomicUsize::new(0));
    let repos = SiteRepositories {
        posts: wrap(&handle, &trigger, &post_reads),
        categories: wrap(&handle, &trigger, &other_reads),
        pages: wrap(&handle, &trigger, &other_reads),
        menus: wrap(&handle, &trigger, &other_reads),
        configurations: wrap(&handle, &trigger, &other_reads),
    };
    let service = SiteService::new(repos.clone(), store.clone());

    Site {
        _dir: dir,
        handle,
        store,
        service,
        repos,
        post_reads,
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_readers_share_one_computation() {
    let site = site().await;
    site.repos
        .posts
        .add(support::post("First", "first"))
        .await
        .expect("add");

    let service = Arc::new(site.service.clone());
    let mut tasks = Vec::new();
    for _ in 0..16 {
        let service = service.clone();
        tasks.push(tokio::spawn(async move { service.sitemap().await }));
    }
    let results = futures::future::join_all(tasks).await;

    let first = results[0]
        .as_ref()
        .expect("join")
        .as_ref()
        .expect("sitemap")
        .clone();
    for result in &results {
        let entries = result.as_ref().expect("join").as_ref().expect("sitemap");
        assert!(Arc::ptr_eq(entries, &first), "every reader sees the same value");
    }
    assert_eq!(first.len(), 1);
    assert_eq!(site.post_reads.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn post_writes_refresh_feed_sitemap_and_slug_lookups() {
    let site = site().await;
    let posts = &site.repos.posts;

    assert!(site.service.feed(None).await.expect("feed").is_empty());
    assert!(site.service.post_by_slug("Hello").await.expect("slug").is_none());
    let reads_before = site.post_reads.load(Ordering::SeqCst);
    assert!(site.service.post_by_slug("hello").await.expect("slug").is_none());
    assert_eq!(
        site.post_reads.load(Ordering::SeqCst),
        reads_before,
        "absence is served from the cache"
    );

    let stored = posts.add(support::post("Hello", "hello")).await.expect("add");
    assert!(!site.store.contains(&CacheKey::new("feed", "all")));
    assert!(!site.store.contains(&CacheKey::new("post", "slug:hello")));

    let feed = site.service.feed(None).await.expect("feed");
    assert_eq!(feed.len(), 1);
    assert_eq!(feed[0].title, "Hello");
    let found = site.service.post_by_slug("HELLO").await.expect("slug");
    assert_eq!(Option::as_ref(&*found).map(Entity::id), Some(stored.id()));

    let mut edited = stored.clone();
    edited.title = "Hello, world".to_string();
    posts.update(edited).await.expect("update");
    let feed = site.service.feed(None).await.expect("feed");
    assert_eq!(feed[0].title, "Hello, world");

    posts.delete(stored.id()).await.expect("delete");
    assert!(site.service.feed(None).await.expect("feed").is_empty());
    assert!(site.service.sitemap().await.expect("sitemap").is_empty());
}

#[tokio::test]
async fn slug_lookups_fold_ascii_letters_only() {
    let site = site().await;
    let stored = site
        .repos
        .posts
        .add(support::post("Ärger", "Ärger"))
        .await
        .expect("add");

    for slug in ["Ärger", "ÄRGER", " Ärger "] {
        let found = site.service.post_by_slug(slug).await.expect("slug");
        assert_eq!(Option::as_ref(&*found).map(Entity::id), Some(stored.id()), "{slug}");
    }
    assert!(site.store.contains(&CacheKey::new("post", "slug:Ärger")));
    assert!(site.service.post_by_slug("ärger").await.expect("slug").is_none());
}

#[tokio::test]
async fn only_cached_repositories_invalidate_on_write() {
    let site = site().await;
    let trigger = Arc::new(CacheTrigger::with_defaults(site.store.clone()));
    let sitemap = CacheKey::new("sitemap", "entries");

    site.service.sitemap().await.expect("sitemap");
    site.handle
        .repository::<PostRecord>()
        .add(support::post("Quiet", "quiet"))
        .await
        .expect("add");
    assert!(site.store.contains(&sitemap), "plain repositories never touch the cache");

    site.handle
        .cached_repository::<PostRecord>(&trigger)
        .add(support::post("Loud", "loud"))
        .await
        .expect("add");
    assert!(!site.store.contains(&sitemap));
    assert_eq!(site.service.sitemap().await.expect("sitemap").len(), 2);
}

#[tokio::test]
async fn failed_writes_leave_the_cache_alone() {
    let site = site().await;
    let posts = &site.repos.posts;
    let stored = posts.add(support::post("Stable", "stable")).await.expect("add");

    site.service.sitemap().await.expect("sitemap");
    let mut first = stored.clone();
    first.title = "Winner".to_string();
    posts.update(first).await.expect("first update");

    let sitemap = site.service.sitemap().await.expect("recomputed");
    let entries_before = site.store.len();

    let mut stale = stored.clone();
    stale.title = "Loser".to_string();
    let err = posts.update(stale).await.expect_err("stale update");
    assert!(err.is_conflict());

    let duplicate = posts
        .add(support::post("Copy", "stable"))
        .await
        .expect_err("duplicate slug");
    assert!(duplicate.is_unique_violation());

    assert_eq!(site.store.len(), entries_before);
    let again = site.service.sitemap().await.expect("cached");
    assert!(Arc::ptr_eq(&sitemap, &again));
}

#[tokio::test]
async fn configuration_writes_change_the_feed_size() {
    let site = site().await;
    for index in 0..5 {
        site.repos
            .posts
            .add(support::post(&format!("Post {index}"), &format!("post-{index}")))
            .await
            .expect("add");
    }
    assert_eq!(site.service.feed(None).await.expect("feed").len(), 5);

    let configurations = &site.repos.configurations;
    let mut feed = configurations
        .first_or_default(&Specification::filter(Predicate::eq("cfg_key", "feed")))
        .await
        .expect("query")
        .expect("seeded feed blob");
    feed.cfg_value["item_count"] = json!(2);
    configurations.update(feed).await.expect("update");

    assert_eq!(site.service.feed(None).await.expect("feed").len(), 2);
    assert_eq!(
        site.service.configuration().await.expect("config")["feed"]["item_count"],
        json!(2)
    );
}

#[tokio::test]
async fn category_feeds_follow_category_writes() {
    let site = site().await;
    let categories = &site.repos.categories;

    assert!(
        site.service
            .feed(Some("rust"))
            .await
            .expect("unknown category")
            .is_empty()
    );

    let rust = categories
        .add(CategoryRecord {
            route_name: "rust".to_string(),
            display_name: "Rust".to_string(),
            ..CategoryRecord::default()
        })
        .await
        .expect("add category");
    let mut post = support::post("Borrowing", "borrowing");
    post.category_id = Some(rust.id());
    site.repos.posts.add(post).await.expect("add post");
    site.repos
        .posts
        .add(support::post("Elsewhere", "elsewhere"))
        .await
        .expect("add post");

    let feed = site.service.feed(Some("rust")).await.expect("feed");
    assert_eq!(feed.len(), 1);
    assert_eq!(feed[0].category_id, Some(rust.id()));

    let names: Vec<String> = site
        .service
        .categories()
        .await
        .expect("categories")
        .iter()
        .map(|category| category.display_name.clone())
        .collect();
    assert_eq!(names, ["Default", "Rust"]);
}

#[tokio::test]
async fn menu_and_page_writes_refresh_their_aggregates() {
    let site = site().await;

    assert!(site.service.menu_tree().await.expect("menus").is_empty());
    site.repos
        .menus
        .add(MenuRecord {
            title: "Docs".to_string(),
            url: "/docs".to_string(),
            sub_menus: vec![SubMenu::new("Guide", "/docs/guide")].into(),
            ..MenuRecord::default()
        })
        .await
        .expect("add menu");
    let tree = site.service.menu_tree().await.expect("menus");
    assert_eq!(tree.len(), 1);
    assert_eq!(tree[0].sub_menus.as_slice().map(<[_]>::len), Some(1));

    site.repos
        .pages
        .add(PageRecord {
            title: "About".to_string(),
            slug: "about".to_string(),
            is_published: true,
            ..PageRecord::default()
        })
        .await
        .expect("add page");
    let sitemap = site.service.sitemap().await.expect("sitemap");
    assert_eq!(sitemap.len(), 1);
    assert_eq!(sitemap[0].path, "/page/about");
}

#[tokio::test]
async fn warm_fills_every_site_aggregate() {
    let site = site().await;
    let entries = site.service.warm().await.expect("warm");
    assert_eq!(entries, 5);
    for key in [
        CacheKey::new("config", "all"),
        CacheKey::new("category", "all"),
        CacheKey::new("menu", "tree"),
        CacheKey::new("sitemap", "entries"),
        CacheKey::new("feed", "all"),
    ] {
        assert!(site.store.contains(&key), "missing {key}");
    }

    // Writes through a bare repository bypass the trigger; clearing recovers.
    let bare = site.handle.repository::<BlogConfigurationRecord>();
    bare.add(BlogConfigurationRecord {
        cfg_key: "extra".to_string(),
        cfg_value: json!({}),
        ..BlogConfigurationRecord::default()
    })
    .await
    .expect("add");
    assert_eq!(site.service.configuration().await.expect("config").len(), 4);
    assert_eq!(site.store.clear_all(), 5);
    assert_eq!(site.service.configuration().await.expect("config").len(), 5);
}
