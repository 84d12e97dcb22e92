//! SQLite connection pool.
//!
//! The database holds admission records and watch channels only, so a small
//! WAL-mode pool is enough. Writers from concurrent submissions wait up to
//! `db.busy_timeout_secs` for the write lock.

use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use tracing::debug;

use crate::config::Config;

pub async fn connect(config: &Config) -> Result<SqlitePool> {
    let db = &config.db;

    if let Some(parent) = db.path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create database directory: {}", parent.display())
            })?;
        }
    }

    let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", db.path.display()))?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_secs(db.busy_timeout_secs));

    let pool = SqlitePoolOptions::new()
        .max_connections(db.max_connections)
        .connect_with(options)
        .await
        .with_context(|| format!("Failed to open database: {}", db.path.display()))?;
    debug!(path = %db.path.display(), "database opened");

    Ok(pool)
}
