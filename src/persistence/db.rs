//! `SQLite` connection pool setup and schema application.

use std::fs;
use std::path::Path;

use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;

use crate::{AppError, Result};

use super::schema;

/// Connect to the on-disk database, creating the file and parent
/// directories as needed, and apply the schema.
///
/// # Errors
///
/// Returns `AppError::Db` if the connection or schema application fails,
/// or `AppError::Io` if the parent directory cannot be created.
pub async fn connect(path: &Path) -> Result<SqlitePool> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)
                .map_err(|err| AppError::Io(format!("failed to create db dir: {err}")))?;
        }
    }

    let url = format!("sqlite://{}?mode=rwc", path.display());
    let pool = SqlitePoolOptions::new().connect(&url).await?;
    schema::bootstrap_schema(&pool).await?;
    Ok(pool)
}

/// Connect to an in-memory database for tests.
///
/// The pool is capped at a single connection: each `SQLite` in-memory
/// connection is its own database.
///
/// # Errors
///
/// Returns `AppError::Db` if the connection or schema application fails.
pub async fn connect_memory() -> Result<SqlitePool> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await?;
    schema::bootstrap_schema(&pool).await?;
    Ok(pool)
}
