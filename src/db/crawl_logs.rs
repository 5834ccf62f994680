use anyhow::Result;
use async_trait::async_trait;
use tokio_rusqlite::params;
use tokio_rusqlite::rusqlite::{self, OptionalExtension};

use crate::core::models::{CrawlRecord, FailureKind, TargetId};
use crate::core::store::LogStore;
use crate::db::{SqliteStore, parse_ts, ts};

fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<CrawlRecord> {
    let started_at: String = row.get(3)?;
    let finished_at: String = row.get(4)?;
    let failure: Option<String> = row.get(6)?;
    let failure = match failure.as_deref() {
        Some("recoverable") => Some(FailureKind::Recoverable),
        Some("permanent") => Some(FailureKind::Permanent),
        _ => None,
    };
    Ok(CrawlRecord {
        job_id: row.get(0)?,
        target_id: row.get(1)?,
        attempt: row.get(2)?,
        started_at: parse_ts(3, &started_at)?,
        finished_at: parse_ts(4, &finished_at)?,
        status: row.get(5)?,
        failure,
        summary: row.get(7)?,
        exit_code: row.get(8)?,
        signal: row.get(9)?,
        items: row.get::<_, i64>(10)? as u64,
        size_bytes: row.get::<_, i64>(11)? as u64,
        log: row.get(12)?,
    })
}

#[async_trait]
impl LogStore for SqliteStore {
    async fn append(&self, record: &CrawlRecord) -> Result<()> {
        let record = record.clone();
        self.connection()
            .call(move |c| {
                c.execute(
                    "INSERT INTO crawl_logs (job_id, target_id, attempt, started_at, finished_at,
                                             status, failure, summary, exit_code, signal,
                                             items, size_bytes, log)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
                    params![
                        record.job_id,
                        record.target_id,
                        record.attempt,
                        ts(record.started_at),
                        ts(record.finished_at),
                        record.status,
                        record.failure.map(|f| f.as_str()),
                        record.summary,
                        record.exit_code,
                        record.signal,
                        record.items as i64,
                        record.size_bytes as i64,
                        record.log
                    ],
                )?;
                Ok::<(), rusqlite::Error>(())
            })
            .await?;
        Ok(())
    }

    async fn latest(&self, target_id: TargetId) -> Result<Option<CrawlRecord>> {
        let record = self
            .connection()
            .call(move |c| {
                c.query_row(
                    "SELECT job_id, target_id, attempt, started_at, finished_at, status, failure,
                            summary, exit_code, signal, items, size_bytes, log
                     FROM crawl_logs
                     WHERE target_id = ?1
                     ORDER BY finished_at DESC, job_id DESC
                     LIMIT 1",
                    params![target_id],
                    row_to_record,
                )
                .optional()
            })
            .await?;
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::models::{CaptureMethod, NewTarget};
    use crate::core::store::TargetStore;
    use crate::db::init_in_memory;
    use chrono::{Duration, Utc};
    use uuid::Uuid;

    fn record(target_id: TargetId, attempt: u32, finished_offset: i64) -> CrawlRecord {
        let finished_at = Utc::now() + Duration::seconds(finished_offset);
        CrawlRecord {
            job_id: Uuid::now_v7().to_string(),
            target_id,
            attempt,
            started_at: finished_at - Duration::seconds(30),
            finished_at,
            status: "error".to_string(),
            failure: Some(FailureKind::Recoverable),
            summary: "wget exited with 4 (network failure)".to_string(),
            exit_code: Some(4),
            signal: None,
            items: 0,
            size_bytes: 0,
            log: "Connecting to example.org... failed: Connection timed out.\n".to_string(),
        }
    }

    #[tokio::test]
    async fn latest_returns_most_recent_attempt() {
        let store = init_in_memory().await.unwrap();
        let target = store
            .insert(NewTarget::new("https://example.org/", CaptureMethod::Mirror))
            .await
            .unwrap();

        assert!(store.latest(target.id).await.unwrap().is_none());

        store.append(&record(target.id, 1, -60)).await.unwrap();
        store.append(&record(target.id, 2, 0)).await.unwrap();

        let latest = store.latest(target.id).await.unwrap().unwrap();
        assert_eq!(latest.attempt, 2);
        assert_eq!(latest.failure, Some(FailureKind::Recoverable));
        assert_eq!(latest.exit_code, Some(4));
    }

    #[tokio::test]
    async fn records_require_an_existing_target() {
        let store = init_in_memory().await.unwrap();
        assert!(store.append(&record(42, 1, 0)).await.is_err());
    }
}
