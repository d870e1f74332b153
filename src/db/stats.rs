//! Read-only observability queries: queue depth, outcome counts, worker
//! liveness.

use std::time::Duration;

use chrono::Utc;

use super::Db;
use crate::error::Result;
use crate::model::{OutcomeCounts, QueueDepth, QueueStats, WorkerStatus};

impl Db {
    /// Task counts grouped by type and status.
    pub async fn queue_depth(&self) -> Result<Vec<QueueDepth>> {
        let rows: Vec<(String, String, i64)> = sqlx::query_as(
            "SELECT task_type, status, COUNT(*) FROM tasks
             GROUP BY task_type, status
             ORDER BY task_type, status",
        )
        .fetch_all(self.pool())
        .await?;

        rows.into_iter()
            .map(|(task_type, status, count)| {
                Ok(QueueDepth {
                    task_type,
                    status: status.parse()?,
                    count: count.max(0) as u64,
                })
            })
            .collect()
    }

    /// Completed and failed totals, plus retries recorded across all tasks.
    pub async fn outcome_counts(&self) -> Result<OutcomeCounts> {
        let (completed, failed, retried): (i64, i64, i64) = sqlx::query_as(
            "SELECT
                 COALESCE(SUM(status = 'completed'), 0),
                 COALESCE(SUM(status = 'failed'), 0),
                 COALESCE(SUM(retry_count), 0)
             FROM tasks",
        )
        .fetch_one(self.pool())
        .await?;

        Ok(OutcomeCounts {
            completed: completed.max(0) as u64,
            failed: failed.max(0) as u64,
            retried: retried.max(0) as u64,
        })
    }

    /// Everything a dashboard needs in one call. Workers whose heartbeat is
    /// older than `stale_after` are flagged stale.
    pub async fn stats(&self, stale_after: Duration) -> Result<QueueStats> {
        let depth = self.queue_depth().await?;
        let outcomes = self.outcome_counts().await?;
        let now = Utc::now();
        let workers = self
            .list_workers()
            .await?
            .into_iter()
            .map(|info| WorkerStatus {
                stale: info.is_stale(stale_after, now),
                info,
            })
            .collect();

        Ok(QueueStats {
            depth,
            outcomes,
            workers,
        })
    }
}
