//! Worker heartbeat rows.

use tracing::trace;

use super::{Db, decode_ts, encode_ts};
use crate::error::Result;
use crate::model::WorkerInfo;

const WORKER_COLUMNS: &str =
    "worker_id, started_at, last_heartbeat_at, tasks_processed, tasks_failed";

impl Db {
    /// Upsert the worker's heartbeat row.
    pub async fn heartbeat(&self, info: &WorkerInfo) -> Result<()> {
        sqlx::query(
            "INSERT INTO workers (worker_id, started_at, last_heartbeat_at, tasks_processed, tasks_failed)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT (worker_id) DO UPDATE SET
                 last_heartbeat_at = excluded.last_heartbeat_at,
                 tasks_processed = excluded.tasks_processed,
                 tasks_failed = excluded.tasks_failed",
        )
        .bind(&info.worker_id)
        .bind(encode_ts(info.started_at))
        .bind(encode_ts(info.last_heartbeat_at))
        .bind(info.tasks_processed as i64)
        .bind(info.tasks_failed as i64)
        .execute(self.pool())
        .await?;

        trace!(worker_id = %info.worker_id, "heartbeat");
        Ok(())
    }

    pub async fn get_worker(&self, worker_id: &str) -> Result<Option<WorkerInfo>> {
        let sql = format!("SELECT {WORKER_COLUMNS} FROM workers WHERE worker_id = ?1");
        let row = sqlx::query_as::<_, WorkerRow>(&sql)
            .bind(worker_id)
            .fetch_optional(self.pool())
            .await?;
        row.map(WorkerRow::try_into_info).transpose()
    }

    /// All known workers, most recently seen first.
    pub async fn list_workers(&self) -> Result<Vec<WorkerInfo>> {
        let sql = format!("SELECT {WORKER_COLUMNS} FROM workers ORDER BY last_heartbeat_at DESC");
        let rows = sqlx::query_as::<_, WorkerRow>(&sql)
            .fetch_all(self.pool())
            .await?;
        rows.into_iter().map(WorkerRow::try_into_info).collect()
    }
}

#[derive(sqlx::FromRow)]
struct WorkerRow {
    worker_id: String,
    started_at: String,
    last_heartbeat_at: String,
    tasks_processed: i64,
    tasks_failed: i64,
}

impl WorkerRow {
    fn try_into_info(self) -> Result<WorkerInfo> {
        Ok(WorkerInfo {
            started_at: decode_ts("started_at", &self.started_at)?,
            last_heartbeat_at: decode_ts("last_heartbeat_at", &self.last_heartbeat_at)?,
            worker_id: self.worker_id,
            tasks_processed: self.tasks_processed.max(0) as u64,
            tasks_failed: self.tasks_failed.max(0) as u64,
        })
    }
}
