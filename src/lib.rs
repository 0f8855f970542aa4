//! Scriptorium: a blog content store over SQLite, MySQL or PostgreSQL with a
//! consistent process-local read cache.

pub mod application;
pub mod cache;
pub mod config;
pub mod domain;
pub mod infra;
