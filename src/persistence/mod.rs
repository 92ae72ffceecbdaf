//! Durable session state: `SQLite` pool, schema bootstrap, resume store.

pub mod db;
pub mod resume_repo;
pub mod schema;
