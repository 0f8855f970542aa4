//! Shared fixtures and the repository contract every backend must satisfy.

#![allow(dead_code)]

use scriptorium::application::repos::{RepoError, Repository};
use scriptorium::application::specification::{Direction, Predicate, Specification};
use scriptorium::config::DatabaseSettings;
use scriptorium::domain::entities::{
    CommentRecord, CommentReply, MenuRecord, PostRecord, SubMenu,
};
use scriptorium::domain::schema::{Entity, Related};
use scriptorium::infra::db::DbHandle;
use scriptorium::infra::setup::{self, InitOutcome};
use tempfile::TempDir;
use time::macros::datetime;
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

/// File-backed SQLite database that lives as long as the returned directory.
pub async fn sqlite_handle() -> (TempDir, DbHandle) {
    let dir = tempfile::tempdir().expect("temp dir");
    let url = sqlite_url(&dir);
    let handle = DbHandle::connect(&DatabaseSettings::for_url(url))
        .await
        .expect("connect sqlite");
    (dir, handle)
}

pub fn sqlite_url(dir: &TempDir) -> String {
    format!("sqlite://{}", dir.path().join("blog.db").display())
}

/// Connect and run first-run setup.
pub async fn ready_handle(url: &str) -> DbHandle {
    let handle = DbHandle::connect(&DatabaseSettings::for_url(url))
        .await
        .expect("connect");
    let runner = handle.setup_runner();
    let outcome = setup::ensure_ready(runner.as_ref())
        .await
        .expect("setup");
    assert!(matches!(
        outcome,
        InitOutcome::Initialized | InitOutcome::AlreadyInitialized
    ));
    handle
}

pub fn post(title: &str, slug: &str) -> PostRecord {
    PostRecord {
        title: title.to_string(),
        slug: slug.to_string(),
        author: "admin".to_string(),
        excerpt: format!("About {title}"),
        content: format!("<p>{title}</p>"),
        is_published: true,
        pub_date: Some(datetime!(2024-03-01 12:00:00.123456 UTC)),
        tags: vec!["rust".to_string()],
        ..PostRecord::default()
    }
}

pub fn menu(title: &str, display_order: i64, sub_menus: Vec<SubMenu>) -> MenuRecord {
    MenuRecord {
        title: title.to_string(),
        url: format!("/{}", title.to_lowercase()),
        icon: "icon-star".to_string(),
        display_order,
        sub_menus: Related::Loaded(sub_menus),
        ..MenuRecord::default()
    }
}

/// Removes everything the contract wrote so shared servers can be reused.
pub async fn reset(handle: &DbHandle) {
    for table in ["comments", "posts", "menus"] {
        handle
            .execute_raw(&format!("DELETE FROM {table}"))
            .await
            .expect("reset table");
    }
}

/// Behaviour every backend must agree on.
pub async fn repository_contract(handle: &DbHandle) {
    reset(handle).await;
    crud_round_trip(handle).await;
    stale_update_conflicts(handle).await;
    ordering_and_windows(handle).await;
    text_predicates(handle).await;
    owned_collections(handle).await;
    unique_slug(handle).await;
    reset(handle).await;
}

async fn crud_round_trip(handle: &DbHandle) {
    let posts = handle.repository::<PostRecord>();

    assert!(posts.get_by_id(Uuid::new_v4()).await.expect("missing").is_none());

    let stored = posts.add(post("Hello", "hello")).await.expect("add");
    assert!(!stored.id().is_nil());
    assert_eq!(stored.meta.version, 1);
    assert_eq!(stored.title, "Hello");
    assert_eq!(stored.tags, vec!["rust".to_string()]);
    assert_eq!(stored.pub_date, Some(datetime!(2024-03-01 12:00:00.123456 UTC)));

    let loaded = posts
        .get_by_id(stored.id())
        .await
        .expect("get")
        .expect("present");
    assert_eq!(loaded, stored);

    let mut edited = loaded.clone();
    edited.title = "Hello again".to_string();
    edited.pub_date = None;
    let updated = posts.update(edited).await.expect("update");
    assert_eq!(updated.meta.version, 2);
    assert_eq!(updated.pub_date, None);
    assert_eq!(updated.meta.created_at, stored.meta.created_at);

    posts.delete(stored.id()).await.expect("delete");
    posts.delete(stored.id()).await.expect("second delete is a no-op");
    assert!(posts.get_by_id(stored.id()).await.expect("get").is_none());
}

async fn stale_update_conflicts(handle: &DbHandle) {
    let posts = handle.repository::<PostRecord>();
    let stored = posts.add(post("Race", "race")).await.expect("add");

    let mut first = stored.clone();
    first.title = "Race won".to_string();
    posts.update(first).await.expect("first writer");

    let mut second = stored.clone();
    second.title = "Race lost".to_string();
    let err = posts.update(second).await.expect_err("stale writer");
    assert!(err.is_conflict(), "unexpected error: {err}");

    let current = posts
        .get_by_id(stored.id())
        .await
        .expect("get")
        .expect("present");
    assert_eq!(current.title, "Race won");

    posts.delete(stored.id()).await.expect("delete");
    let err = posts.update(current).await.expect_err("deleted row");
    assert!(matches!(err, RepoError::ConcurrencyConflict { .. }));
}

async fn ordering_and_windows(handle: &DbHandle) {
    let posts = handle.repository::<PostRecord>();
    let base = datetime!(2024-01-01 00:00:00 UTC);

    let mut ids = Vec::new();
    for (index, title) in ["Same", "Same", "Same", "Other"].into_iter().enumerate() {
        let mut record = post(title, &format!("order-{index}"));
        record.pub_date = Some(base + Duration::days(index as i64));
        ids.push(posts.add(record).await.expect("add").id());
    }
    let mut undated = post("Undated", "order-undated");
    undated.pub_date = None;
    let undated = posts.add(undated).await.expect("add undated");

    let mut same_ids = ids[..3].to_vec();
    same_ids.sort();

    let spec = Specification::filter(Predicate::eq("title", "Same"))
        .order_by("title", Direction::Asc);
    let found: Vec<Uuid> = posts
        .query(&spec)
        .await
        .expect("query")
        .iter()
        .map(Entity::id)
        .collect();
    assert_eq!(found, same_ids, "ties break on id");

    let first_two = posts
        .query(&spec.clone().take(2))
        .await
        .expect("take");
    assert_eq!(
        first_two.iter().map(Entity::id).collect::<Vec<_>>(),
        same_ids[..2]
    );
    let rest = posts.query(&spec.clone().skip(2)).await.expect("skip");
    assert_eq!(rest.iter().map(Entity::id).collect::<Vec<_>>(), same_ids[2..]);

    assert!(posts.query(&spec.clone().take(0)).await.expect("take 0").is_empty());
    assert!(
        posts
            .first_or_default(&spec.clone().take(0))
            .await
            .expect("first of empty window")
            .is_none()
    );
    assert_eq!(posts.count(&spec.clone().skip(1).take(1)).await.expect("count"), 3);

    let by_date = posts
        .query(&Specification::all().order_by("pub_date", Direction::Desc))
        .await
        .expect("by date");
    assert_eq!(by_date.first().map(Entity::id), Some(ids[3]));
    assert_eq!(by_date.last().map(Entity::id), Some(undated.id()), "nulls sort last");

    let ascending = posts
        .query(&Specification::all().order_by("pub_date", Direction::Asc))
        .await
        .expect("ascending");
    assert_eq!(ascending.last().map(Entity::id), Some(undated.id()), "nulls sort last");

    let newest = posts
        .first_or_default(
            &Specification::filter(Predicate::is_not_null("pub_date"))
                .order_by("pub_date", Direction::Desc),
        )
        .await
        .expect("first")
        .expect("present");
    assert_eq!(newest.id(), ids[3]);

    let later = Predicate::gt("pub_date", base + Duration::days(1));
    assert_eq!(posts.count(&Specification::filter(later)).await.expect("count"), 2);

    let some = Predicate::is_in("id", [ids[0], ids[3]]);
    assert_eq!(posts.count(&Specification::filter(some)).await.expect("count"), 2);

    reset(handle).await;
}

async fn text_predicates(handle: &DbHandle) {
    let posts = handle.repository::<PostRecord>();
    posts
        .add(post("Rust Ownership", "Rust-Ownership"))
        .await
        .expect("add");
    posts.add(post("Cooking", "cooking")).await.expect("add");

    let spec = Specification::filter(Predicate::eq_ignore_case("slug", "rust-ownership"));
    assert_eq!(posts.count(&spec).await.expect("ignore case"), 1);

    let spec = Specification::filter(Predicate::eq("slug", "rust-ownership"));
    assert_eq!(posts.count(&spec).await.expect("exact case"), 0);

    let spec = Specification::filter(Predicate::contains("title", "Owner"));
    assert_eq!(posts.count(&spec).await.expect("contains"), 1);

    let spec = Specification::filter(Predicate::contains("title", "owner"));
    assert_eq!(posts.count(&spec).await.expect("contains is case sensitive"), 0);

    let spec = Specification::filter(Predicate::contains_ignore_case("title", "OWNER"));
    assert_eq!(posts.count(&spec).await.expect("contains ignore case"), 1);

    let spec = Specification::filter(Predicate::contains("title", "100%_"));
    assert_eq!(posts.count(&spec).await.expect("wildcards are literal"), 0);

    let spec = Specification::filter(Predicate::eq("slug", "cooking").negate());
    assert_eq!(posts.count(&spec).await.expect("negate"), 1);

    // Case folding covers ASCII letters only, identically on every backend.
    posts.add(post("Ärger im Büro", "Ärger")).await.expect("add");
    for (operand, expected) in [("Ärger", 1), ("ÄRGER", 1), ("ärger", 0), ("ärGER", 0)] {
        let spec = Specification::filter(Predicate::eq_ignore_case("slug", operand));
        assert_eq!(
            posts.count(&spec).await.expect("non-ascii ignore case"),
            expected,
            "{}: eq_ignore_case {operand}",
            handle.backend()
        );
    }
    for (needle, expected) in [("IM BüRO", 1), ("im büro", 1), ("IM BÜRO", 0)] {
        let spec = Specification::filter(Predicate::contains_ignore_case("title", needle));
        assert_eq!(
            posts.count(&spec).await.expect("non-ascii contains"),
            expected,
            "{}: contains_ignore_case {needle}",
            handle.backend()
        );
    }

    reset(handle).await;
}

async fn owned_collections(handle: &DbHandle) {
    let menus = handle.repository::<MenuRecord>();
    let stored = menus
        .add(menu(
            "Docs",
            1,
            vec![SubMenu::new("Guide", "/guide"), SubMenu::new("API", "/api")],
        ))
        .await
        .expect("add menu");
    menus.add(menu("About", 2, Vec::new())).await.expect("add");

    let loaded = menus
        .get_by_id(stored.id())
        .await
        .expect("get")
        .expect("present");
    let titles: Vec<&str> = loaded
        .sub_menus
        .as_slice()
        .expect("get_by_id loads owned collections")
        .iter()
        .map(|sub| sub.title.as_str())
        .collect();
    assert_eq!(titles, ["Guide", "API"]);

    let plain = menus
        .query(&Specification::all().order_by("display_order", Direction::Asc))
        .await
        .expect("query");
    assert!(plain.iter().all(|menu| !menu.sub_menus.is_loaded()));

    let with_subs = menus
        .query(
            &Specification::all()
                .order_by("display_order", Direction::Asc)
                .include("sub_menus"),
        )
        .await
        .expect("query with include");
    assert_eq!(with_subs.len(), 2);
    assert_eq!(with_subs[0].sub_menus.as_slice().map(<[_]>::len), Some(2));
    assert_eq!(with_subs[1].sub_menus.as_slice().map(<[_]>::len), Some(0));

    // Writing a menu whose sub-menus were never loaded keeps the stored ones.
    let mut renamed = plain[0].clone();
    renamed.title = "Documentation".to_string();
    menus.update(renamed).await.expect("update");
    let reloaded = menus
        .get_by_id(stored.id())
        .await
        .expect("get")
        .expect("present");
    assert_eq!(reloaded.title, "Documentation");
    assert_eq!(reloaded.sub_menus.as_slice().map(<[_]>::len), Some(2));

    let comments = handle.repository::<CommentRecord>();
    let reply_at = OffsetDateTime::UNIX_EPOCH + Duration::days(19_800);
    let comment = comments
        .add(CommentRecord {
            post_id: Uuid::new_v4(),
            username: "reader".to_string(),
            email: "reader@example.com".to_string(),
            ip_address: "127.0.0.1".to_string(),
            comment_content: "Nice post".to_string(),
            replies: Related::Loaded(vec![CommentReply::new("Thanks", reply_at)]),
            ..CommentRecord::default()
        })
        .await
        .expect("add comment");
    let loaded = comments
        .get_by_id(comment.id())
        .await
        .expect("get")
        .expect("present");
    let replies = loaded.replies.as_slice().expect("replies loaded");
    assert_eq!(replies.len(), 1);
    assert_eq!(replies[0].content, "Thanks");
    assert_eq!(replies[0].reply_time_utc, reply_at);

    reset(handle).await;
}

async fn unique_slug(handle: &DbHandle) {
    let posts = handle.repository::<PostRecord>();
    posts.add(post("One", "taken")).await.expect("add");
    let err = posts
        .add(post("Two", "taken"))
        .await
        .expect_err("duplicate slug");
    assert!(err.is_unique_violation(), "unexpected error: {err}");
    assert_eq!(posts.count(&Specification::all()).await.expect("count"), 1);
    reset(handle).await;
}
