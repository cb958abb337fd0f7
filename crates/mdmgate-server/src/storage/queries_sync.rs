//! Sync job queries.

use super::models::{SyncJob, SyncJobKind, SyncJobStatus};
use super::{DatabaseError, MdmDatabase};
use mdmgate_core::db::unix_timestamp;

impl MdmDatabase {
    /// Return the unfinished job for `kind`+`target`, or create one with `id`.
    ///
    /// The boolean is `true` when a new job was created.
    pub async fn create_or_get_active_job(
        &self,
        id: &str,
        kind: SyncJobKind,
        target: &str,
    ) -> Result<(SyncJob, bool), DatabaseError> {
        let mut tx = self.pool().begin().await?;

        if let Some(existing) = sqlx::query_as::<_, SyncJob>(
            "SELECT * FROM sync_jobs WHERE kind = ? AND target = ? AND status IN ('pending', 'running')",
        )
        .bind(kind)
        .bind(target)
        .fetch_optional(&mut *tx)
        .await?
        {
            tx.commit().await?;
            return Ok((existing, false));
        }

        sqlx::query(
            "INSERT INTO sync_jobs (id, kind, target, status, created_at) VALUES (?, ?, ?, 'pending', ?)",
        )
        .bind(id)
        .bind(kind)
        .bind(target)
        .bind(unix_timestamp())
        .execute(&mut *tx)
        .await?;

        let job = sqlx::query_as::<_, SyncJob>("SELECT * FROM sync_jobs WHERE id = ?")
            .bind(id)
            .fetch_one(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok((job, true))
    }

    /// Get a job by id.
    pub async fn get_sync_job(&self, id: &str) -> Result<Option<SyncJob>, DatabaseError> {
        let job = sqlx::query_as::<_, SyncJob>("SELECT * FROM sync_jobs WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool())
            .await?;

        Ok(job)
    }

    /// Move a pending job to `running`.
    pub async fn mark_sync_job_running(&self, id: &str) -> Result<(), DatabaseError> {
        let result = sqlx::query(
            "UPDATE sync_jobs SET status = 'running', started_at = ? WHERE id = ? AND status = 'pending'",
        )
        .bind(unix_timestamp())
        .bind(id)
        .execute(self.pool())
        .await?;

        if result.rows_affected() == 0 {
            return Err(DatabaseError::NotFound(format!("Pending sync job {id}")));
        }
        Ok(())
    }

    /// Record the terminal state of a job.
    pub async fn finish_sync_job(
        &self,
        id: &str,
        status: SyncJobStatus,
        result: Option<&str>,
        error: Option<&str>,
    ) -> Result<(), DatabaseError> {
        let result = sqlx::query(
            "UPDATE sync_jobs SET status = ?, result = ?, error = ?, finished_at = ?
             WHERE id = ? AND status IN ('pending', 'running')",
        )
        .bind(status)
        .bind(result)
        .bind(error)
        .bind(unix_timestamp())
        .bind(id)
        .execute(self.pool())
        .await?;

        if result.rows_affected() == 0 {
            return Err(DatabaseError::NotFound(format!("Unfinished sync job {id}")));
        }
        Ok(())
    }

    /// Fail every job left unfinished by a previous process.
    pub async fn fail_interrupted_sync_jobs(&self, reason: &str) -> Result<u64, DatabaseError> {
        let result = sqlx::query(
            "UPDATE sync_jobs SET status = 'failed', error = ?, finished_at = ?
             WHERE status IN ('pending', 'running')",
        )
        .bind(reason)
        .bind(unix_timestamp())
        .execute(self.pool())
        .await?;

        Ok(result.rows_affected())
    }

    /// Delete finished jobs that finished before `before`.
    pub async fn delete_finished_sync_jobs(&self, before: i64) -> Result<u64, DatabaseError> {
        let result = sqlx::query(
            "DELETE FROM sync_jobs WHERE status IN ('succeeded', 'failed') AND finished_at < ?",
        )
        .bind(before)
        .execute(self.pool())
        .await?;

        Ok(result.rows_affected())
    }
}
