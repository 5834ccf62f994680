use anyhow::{Result, anyhow};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_rusqlite::rusqlite::{self, OptionalExtension};
use tokio_rusqlite::params;

use crate::core::models::{NewTarget, Target, TargetId, TargetStatus, TargetUpdate};
use crate::core::store::TargetStore;
use crate::db::{SqliteStore, parse_enum, parse_opt_ts, parse_ts, ts};

const COLUMNS: &str = "id, url, name, method, status, retry_count, last_error, recurrence_days,
     next_run_at, last_success_at, include_external, depth, size_bytes, item_count, updated_at";

fn row_to_target(row: &rusqlite::Row<'_>) -> rusqlite::Result<Target> {
    let method: String = row.get(3)?;
    let status: String = row.get(4)?;
    let updated_at: String = row.get(14)?;
    Ok(Target {
        id: row.get(0)?,
        url: row.get(1)?,
        name: row.get(2)?,
        method: parse_enum(3, &method)?,
        status: parse_enum(4, &status)?,
        retry_count: row.get(5)?,
        last_error: row.get(6)?,
        recurrence_days: row.get(7)?,
        next_run_at: parse_opt_ts(8, row.get(8)?)?,
        last_success_at: parse_opt_ts(9, row.get(9)?)?,
        include_external: row.get(10)?,
        depth: row.get(11)?,
        size_bytes: row.get::<_, i64>(12)? as u64,
        item_count: row.get::<_, i64>(13)? as u64,
        updated_at: parse_ts(14, &updated_at)?,
    })
}

fn select_one(c: &rusqlite::Connection, id: TargetId) -> rusqlite::Result<Option<Target>> {
    c.query_row(
        &format!("SELECT {} FROM targets WHERE id = ?1", COLUMNS),
        params![id],
        row_to_target,
    )
    .optional()
}

#[async_trait]
impl TargetStore for SqliteStore {
    async fn insert(&self, new: NewTarget) -> Result<Target> {
        let name = new.display_name();
        let now = ts(Utc::now());
        let target = self
            .connection()
            .call(move |c| {
                c.execute(
                    "INSERT INTO targets (url, name, method, recurrence_days, include_external,
                                          depth, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)",
                    params![
                        new.url,
                        name,
                        new.method.as_str(),
                        new.recurrence_days,
                        new.include_external,
                        new.depth,
                        now
                    ],
                )?;
                let id = c.last_insert_rowid();
                select_one(c, id)
            })
            .await?;

        target.ok_or_else(|| anyhow!("Inserted target vanished"))
    }

    async fn get(&self, id: TargetId) -> Result<Option<Target>> {
        Ok(self.connection().call(move |c| select_one(c, id)).await?)
    }

    async fn list(&self) -> Result<Vec<Target>> {
        let targets = self
            .connection()
            .call(|c| {
                let mut stmt = c.prepare(&format!("SELECT {} FROM targets ORDER BY id", COLUMNS))?;
                let rows = stmt.query_map([], row_to_target)?;
                rows.collect::<rusqlite::Result<Vec<_>>>()
            })
            .await?;
        Ok(targets)
    }

    async fn list_by_status(&self, status: TargetStatus) -> Result<Vec<Target>> {
        let targets = self
            .connection()
            .call(move |c| {
                let mut stmt = c.prepare(&format!(
                    "SELECT {} FROM targets WHERE status = ?1 ORDER BY id",
                    COLUMNS
                ))?;
                let rows = stmt.query_map(params![status.as_str()], row_to_target)?;
                rows.collect::<rusqlite::Result<Vec<_>>>()
            })
            .await?;
        Ok(targets)
    }

    async fn update(&self, id: TargetId, update: &TargetUpdate) -> Result<Target> {
        let update = update.clone();
        let now = ts(Utc::now());
        let target = self
            .connection()
            .call(move |c| {
                let tx = c.transaction()?;
                let changed = tx.execute(
                    "UPDATE targets SET status = ?1, retry_count = ?2, last_error = ?3,
                         next_run_at = ?4, last_success_at = ?5, updated_at = ?6
                     WHERE id = ?7",
                    params![
                        update.status.as_str(),
                        update.retry_count,
                        update.last_error,
                        update.next_run_at.map(ts),
                        update.last_success_at.map(ts),
                        now,
                        id
                    ],
                )?;
                if changed == 0 {
                    return Ok(None);
                }
                if let Some(stats) = update.artifacts {
                    tx.execute(
                        "UPDATE targets SET size_bytes = ?1, item_count = ?2 WHERE id = ?3",
                        params![stats.size_bytes as i64, stats.items as i64, id],
                    )?;
                }
                let target = select_one(&tx, id)?;
                tx.commit()?;
                Ok::<_, rusqlite::Error>(target)
            })
            .await?;

        target.ok_or_else(|| anyhow!("Target {} not found", id))
    }

    async fn list_due_retries(&self, now: DateTime<Utc>) -> Result<Vec<Target>> {
        let now = ts(now);
        let targets = self
            .connection()
            .call(move |c| {
                let mut stmt = c.prepare(&format!(
                    "SELECT {} FROM targets
                     WHERE status = 'retry_pending' AND next_run_at IS NOT NULL AND next_run_at <= ?1
                     ORDER BY next_run_at, id",
                    COLUMNS
                ))?;
                let rows = stmt.query_map(params![now], row_to_target)?;
                rows.collect::<rusqlite::Result<Vec<_>>>()
            })
            .await?;
        Ok(targets)
    }
}
