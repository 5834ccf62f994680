use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use tokio_rusqlite::{Connection, rusqlite};

pub mod crawl_logs;
pub mod memory;
pub mod targets;

pub use memory::MemoryStore;

/// SQLite-backed implementation of the engine's store traits.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    pub fn new(conn: Connection) -> Self {
        Self { conn }
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }
}

/// Open (creating if needed) the database at `path` and apply the schema.
pub async fn init(path: &Path) -> Result<SqliteStore> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }

    let conn = Connection::open(path)
        .await
        .with_context(|| format!("Failed to open database {}", path.display()))?;
    apply_schema(&conn).await?;
    Ok(SqliteStore::new(conn))
}

/// Private in-memory database, for tests.
pub async fn init_in_memory() -> Result<SqliteStore> {
    let conn = Connection::open_in_memory().await?;
    apply_schema(&conn).await?;
    Ok(SqliteStore::new(conn))
}

async fn apply_schema(conn: &Connection) -> Result<()> {
    conn.call(|conn| {
        let schema = include_str!("schema.sql");
        conn.execute_batch(schema)?;

        // SQLite disables foreign keys by default
        conn.execute("PRAGMA foreign_keys = ON;", [])?;

        Ok::<(), rusqlite::Error>(())
    })
    .await?;
    Ok(())
}

/// Fixed-width UTC timestamps so text order matches time order.
pub(crate) fn ts(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_ts(idx: usize, raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
        })
}

pub(crate) fn parse_opt_ts(idx: usize, raw: Option<String>) -> rusqlite::Result<Option<DateTime<Utc>>> {
    raw.map(|s| parse_ts(idx, &s)).transpose()
}

/// Parse an enum column through its `FromStr` impl.
pub(crate) fn parse_enum<T>(idx: usize, raw: &str) -> rusqlite::Result<T>
where
    T: std::str::FromStr<Err = String>,
{
    raw.parse::<T>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, e.into())
    })
}
