//! Domain entities mirrored from persistent storage.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use super::schema::{Column, Entity, RecordMeta, Related, RowValues, SchemaError, encode_json};
use super::types::EntityKind;
use super::values::Value;

#[derive(Debug, Clone, PartialEq, Default)]
pub struct PostRecord {
    pub meta: RecordMeta,
    pub title: String,
    pub slug: String,
    pub author: String,
    pub excerpt: String,
    pub content: String,
    pub is_published: bool,
    pub is_featured: bool,
    pub pub_date: Option<OffsetDateTime>,
    pub category_id: Option<Uuid>,
    pub tags: Vec<String>,
}

impl Entity for PostRecord {
    const KIND: EntityKind = EntityKind::Post;
    const TABLE: &'static str = "posts";
    const COLUMNS: &'static [Column] = &[
        Column::text("title"),
        Column::text("slug"),
        Column::text("author"),
        Column::text("excerpt"),
        Column::text("content"),
        Column::bool("is_published"),
        Column::bool("is_featured"),
        Column::timestamp("pub_date").nullable(),
        Column::uuid("category_id").nullable(),
        Column::json("tags"),
    ];

    fn meta(&self) -> &RecordMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut RecordMeta {
        &mut self.meta
    }

    fn to_values(&self) -> Result<Vec<Option<Value>>, SchemaError> {
        Ok(vec![
            Some(self.title.clone().into()),
            Some(self.slug.clone().into()),
            Some(self.author.clone().into()),
            Some(self.excerpt.clone().into()),
            Some(self.content.clone().into()),
            Some(self.is_published.into()),
            Some(self.is_featured.into()),
            Some(self.pub_date.into()),
            Some(self.category_id.into()),
            Some(encode_json("tags", &self.tags)?),
        ])
    }

    fn from_values(meta: RecordMeta, row: &mut RowValues) -> Result<Self, SchemaError> {
        Ok(Self {
            meta,
            title: row.text("title")?,
            slug: row.text("slug")?,
            author: row.text("author")?,
            excerpt: row.text("excerpt")?,
            content: row.text("content")?,
            is_published: row.bool("is_published")?,
            is_featured: row.bool("is_featured")?,
            pub_date: row.opt_timestamp("pub_date")?,
            category_id: row.opt_uuid("category_id")?,
            tags: row.json_as("tags")?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CategoryRecord {
    pub meta: RecordMeta,
    pub route_name: String,
    pub display_name: String,
    pub note: Option<String>,
}

impl Entity for CategoryRecord {
    const KIND: EntityKind = EntityKind::Category;
    const TABLE: &'static str = "categories";
    const COLUMNS: &'static [Column] = &[
        Column::text("route_name"),
        Column::text("display_name"),
        Column::text("note").nullable(),
    ];

    fn meta(&self) -> &RecordMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut RecordMeta {
        &mut self.meta
    }

    fn to_values(&self) -> Result<Vec<Option<Value>>, SchemaError> {
        Ok(vec![
            Some(self.route_name.clone().into()),
            Some(self.display_name.clone().into()),
            Some(self.note.clone().into()),
        ])
    }

    fn from_values(meta: RecordMeta, row: &mut RowValues) -> Result<Self, SchemaError> {
        Ok(Self {
            meta,
            route_name: row.text("route_name")?,
            display_name: row.text("display_name")?,
            note: row.opt_text("note")?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct PageRecord {
    pub meta: RecordMeta,
    pub title: String,
    pub slug: String,
    pub meta_description: String,
    pub html_content: String,
    pub css_content: Option<String>,
    pub hide_sidebar: bool,
    pub is_published: bool,
}

impl Entity for PageRecord {
    const KIND: EntityKind = EntityKind::Page;
    const TABLE: &'static str = "pages";
    const COLUMNS: &'static [Column] = &[
        Column::text("title"),
        Column::text("slug"),
        Column::text("meta_description"),
        Column::text("html_content"),
        Column::text("css_content").nullable(),
        Column::bool("hide_sidebar"),
        Column::bool("is_published"),
    ];

    fn meta(&self) -> &RecordMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut RecordMeta {
        &mut self.meta
    }

    fn to_values(&self) -> Result<Vec<Option<Value>>, SchemaError> {
        Ok(vec![
            Some(self.title.clone().into()),
            Some(self.slug.clone().into()),
            Some(self.meta_description.clone().into()),
            Some(self.html_content.clone().into()),
            Some(self.css_content.clone().into()),
            Some(self.hide_sidebar.into()),
            Some(self.is_published.into()),
        ])
    }

    fn from_values(meta: RecordMeta, row: &mut RowValues) -> Result<Self, SchemaError> {
        Ok(Self {
            meta,
            title: row.text("title")?,
            slug: row.text("slug")?,
            meta_description: row.text("meta_description")?,
            html_content: row.text("html_content")?,
            css_content: row.opt_text("css_content")?,
            hide_sidebar: row.bool("hide_sidebar")?,
            is_published: row.bool("is_published")?,
        })
    }
}

/// Child entry of a menu. Lives only inside its parent's row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubMenu {
    pub id: Uuid,
    pub title: String,
    pub url: String,
    #[serde(default)]
    pub is_open_in_new_tab: bool,
}

impl SubMenu {
    pub fn new(title: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            title: title.into(),
            url: url.into(),
            is_open_in_new_tab: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct MenuRecord {
    pub meta: RecordMeta,
    pub title: String,
    pub url: String,
    pub icon: String,
    pub display_order: i64,
    pub is_open_in_new_tab: bool,
    pub sub_menus: Related<SubMenu>,
}

impl Entity for MenuRecord {
    const KIND: EntityKind = EntityKind::Menu;
    const TABLE: &'static str = "menus";
    const COLUMNS: &'static [Column] = &[
        Column::text("title"),
        Column::text("url"),
        Column::text("icon"),
        Column::int("display_order"),
        Column::bool("is_open_in_new_tab"),
        Column::owned("sub_menus"),
    ];

    fn meta(&self) -> &RecordMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut RecordMeta {
        &mut self.meta
    }

    fn to_values(&self) -> Result<Vec<Option<Value>>, SchemaError> {
        Ok(vec![
            Some(self.title.clone().into()),
            Some(self.url.clone().into()),
            Some(self.icon.clone().into()),
            Some(self.display_order.into()),
            Some(self.is_open_in_new_tab.into()),
            self.sub_menus.to_value("sub_menus")?,
        ])
    }

    fn from_values(meta: RecordMeta, row: &mut RowValues) -> Result<Self, SchemaError> {
        Ok(Self {
            meta,
            title: row.text("title")?,
            url: row.text("url")?,
            icon: row.text("icon")?,
            display_order: row.int("display_order")?,
            is_open_in_new_tab: row.bool("is_open_in_new_tab")?,
            sub_menus: row.related("sub_menus")?,
        })
    }
}

/// Reply owned by a comment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommentReply {
    pub id: Uuid,
    pub content: String,
    #[serde(with = "time::serde::rfc3339")]
    pub reply_time_utc: OffsetDateTime,
}

impl CommentReply {
    pub fn new(content: impl Into<String>, reply_time_utc: OffsetDateTime) -> Self {
        Self {
            id: Uuid::new_v4(),
            content: content.into(),
            reply_time_utc: super::values::truncate_to_micros(reply_time_utc),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct CommentRecord {
    pub meta: RecordMeta,
    pub post_id: Uuid,
    pub username: String,
    pub email: String,
    pub ip_address: String,
    pub comment_content: String,
    pub is_approved: bool,
    pub replies: Related<CommentReply>,
}

impl Entity for CommentRecord {
    const KIND: EntityKind = EntityKind::Comment;
    const TABLE: &'static str = "comments";
    const COLUMNS: &'static [Column] = &[
        Column::uuid("post_id"),
        Column::text("username"),
        Column::text("email"),
        Column::text("ip_address"),
        Column::text("comment_content"),
        Column::bool("is_approved"),
        Column::owned("replies"),
    ];

    fn meta(&self) -> &RecordMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut RecordMeta {
        &mut self.meta
    }

    fn to_values(&self) -> Result<Vec<Option<Value>>, SchemaError> {
        Ok(vec![
            Some(self.post_id.into()),
            Some(self.username.clone().into()),
            Some(self.email.clone().into()),
            Some(self.ip_address.clone().into()),
            Some(self.comment_content.clone().into()),
            Some(self.is_approved.into()),
            self.replies.to_value("replies")?,
        ])
    }

    fn from_values(meta: RecordMeta, row: &mut RowValues) -> Result<Self, SchemaError> {
        Ok(Self {
            meta,
            post_id: row.uuid("post_id")?,
            username: row.text("username")?,
            email: row.text("email")?,
            ip_address: row.text("ip_address")?,
            comment_content: row.text("comment_content")?,
            is_approved: row.bool("is_approved")?,
            replies: row.related("replies")?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct PingbackRecord {
    pub meta: RecordMeta,
    pub domain: String,
    pub source_url: String,
    pub source_title: String,
    pub source_ip: String,
    pub target_post_id: Uuid,
    pub target_post_title: String,
    pub ping_time_utc: Option<OffsetDateTime>,
}

impl Entity for PingbackRecord {
    const KIND: EntityKind = EntityKind::Pingback;
    const TABLE: &'static str = "pingbacks";
    const COLUMNS: &'static [Column] = &[
        Column::text("domain"),
        Column::text("source_url"),
        Column::text("source_title"),
        Column::text("source_ip"),
        Column::uuid("target_post_id"),
        Column::text("target_post_title"),
        Column::timestamp("ping_time_utc").nullable(),
    ];

    fn meta(&self) -> &RecordMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut RecordMeta {
        &mut self.meta
    }

    fn to_values(&self) -> Result<Vec<Option<Value>>, SchemaError> {
        Ok(vec![
            Some(self.domain.clone().into()),
            Some(self.source_url.clone().into()),
            Some(self.source_title.clone().into()),
            Some(self.source_ip.clone().into()),
            Some(self.target_post_id.into()),
            Some(self.target_post_title.clone().into()),
            Some(self.ping_time_utc.into()),
        ])
    }

    fn from_values(meta: RecordMeta, row: &mut RowValues) -> Result<Self, SchemaError> {
        Ok(Self {
            meta,
            domain: row.text("domain")?,
            source_url: row.text("source_url")?,
            source_title: row.text("source_title")?,
            source_ip: row.text("source_ip")?,
            target_post_id: row.uuid("target_post_id")?,
            target_post_title: row.text("target_post_title")?,
            ping_time_utc: row.opt_timestamp("ping_time_utc")?,
        })
    }
}

/// One named configuration blob, e.g. `feed` or `general`.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct BlogConfigurationRecord {
    pub meta: RecordMeta,
    pub cfg_key: String,
    pub cfg_value: serde_json::Value,
}

impl Entity for BlogConfigurationRecord {
    const KIND: EntityKind = EntityKind::Configuration;
    const TABLE: &'static str = "blog_configurations";
    const COLUMNS: &'static [Column] = &[Column::text("cfg_key"), Column::json("cfg_value")];

    fn meta(&self) -> &RecordMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut RecordMeta {
        &mut self.meta
    }

    fn to_values(&self) -> Result<Vec<Option<Value>>, SchemaError> {
        Ok(vec![
            Some(self.cfg_key.clone().into()),
            Some(Value::Json(self.cfg_value.clone())),
        ])
    }

    fn from_values(meta: RecordMeta, row: &mut RowValues) -> Result<Self, SchemaError> {
        Ok(Self {
            meta,
            cfg_key: row.text("cfg_key")?,
            cfg_value: row.json("cfg_value")?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_columns_match<T: Entity>(entity: &T) {
        let values = entity.to_values().expect("encode");
        assert_eq!(values.len(), T::COLUMNS.len(), "{}", T::TABLE);
    }

    #[test]
    fn every_entity_encodes_one_value_per_column() {
        assert_columns_match(&PostRecord::default());
        assert_columns_match(&CategoryRecord::default());
        assert_columns_match(&PageRecord::default());
        assert_columns_match(&MenuRecord::default());
        assert_columns_match(&CommentRecord::default());
        assert_columns_match(&PingbackRecord::default());
        assert_columns_match(&BlogConfigurationRecord::default());
    }

    #[test]
    fn unloaded_collections_encode_as_none() {
        let menu = MenuRecord::default();
        let values = menu.to_values().expect("encode");
        assert!(values.last().expect("sub_menus").is_none());

        let menu = MenuRecord {
            sub_menus: vec![SubMenu::new("Archive", "/archive")].into(),
            ..MenuRecord::default()
        };
        let values = menu.to_values().expect("encode");
        assert!(matches!(values.last(), Some(Some(Value::Json(_)))));
    }

    #[test]
    fn comment_decodes_from_row_values() {
        let post_id = Uuid::new_v4();
        let mut row = RowValues::new();
        row.insert("post_id", Value::Uuid(post_id));
        row.insert("username", "ada".into());
        row.insert("email", "ada@example.com".into());
        row.insert("ip_address", "127.0.0.1".into());
        row.insert("comment_content", "hello".into());
        row.insert("is_approved", true.into());

        let comment =
            CommentRecord::from_values(RecordMeta::default(), &mut row).expect("decode");
        assert_eq!(comment.post_id, post_id);
        assert_eq!(comment.replies, Related::NotLoaded);
    }

    #[test]
    fn column_lookup_includes_header() {
        assert!(PostRecord::column("id").is_some());
        assert!(PostRecord::column("updated_at").is_some());
        assert!(PostRecord::column("slug").is_some());
        assert!(PostRecord::column("nope").is_none());
        assert_eq!(CommentRecord::owned_columns().count(), 1);
    }
}
