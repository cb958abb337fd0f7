use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{error, info, instrument, warn};

use super::{SyncError, SyncSource, SyncSummary};
use crate::storage::{MdmDatabase, SyncJob, SyncJobKind, SyncJobStatus};
use mdmgate_core::db::unix_timestamp;

/// A job as reported to operators.
#[derive(Debug, Clone, Serialize)]
pub struct SyncJobView {
    pub id: String,
    pub name: &'static str,
    /// `pending` or a terminal state; a running job reads as `pending`.
    pub status: SyncJobStatus,
    /// `true` until the job reaches a terminal state.
    pub unready: bool,
    pub target: String,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    pub created_at: i64,
    pub finished_at: Option<i64>,
}

impl From<SyncJob> for SyncJobView {
    fn from(job: SyncJob) -> Self {
        let result = job
            .result
            .as_deref()
            .and_then(|raw| serde_json::from_str(raw).ok());
        let unready = !job.status.is_terminal();
        Self {
            name: job.kind.as_str(),
            unready,
            id: job.id,
            status: if unready {
                SyncJobStatus::Pending
            } else {
                job.status
            },
            target: job.target,
            result,
            error: job.error,
            created_at: job.created_at,
            finished_at: job.finished_at,
        }
    }
}

/// Runs sync sources as background jobs.
pub struct SyncOrchestrator {
    db: MdmDatabase,
    sources: HashMap<SyncJobKind, Arc<dyn SyncSource>>,
    /// Serializes the find-or-create step of [`trigger`](Self::trigger).
    trigger_lock: Mutex<()>,
}

impl SyncOrchestrator {
    pub fn new(db: MdmDatabase) -> Self {
        Self {
            db,
            sources: HashMap::new(),
            trigger_lock: Mutex::new(()),
        }
    }

    #[must_use]
    pub fn with_source(mut self, source: Arc<dyn SyncSource>) -> Self {
        self.sources.insert(source.kind(), source);
        self
    }

    /// Start a job, or return the one already active for `kind` and `target`.
    #[instrument(skip(self))]
    pub async fn trigger(
        self: &Arc<Self>,
        kind: SyncJobKind,
        target: &str,
    ) -> Result<SyncJob, SyncError> {
        let _guard = self.trigger_lock.lock().await;

        let id = uuid::Uuid::new_v4().to_string();
        let (job, created) = self
            .db
            .create_or_get_active_job(&id, kind, target)
            .await?;

        if created {
            info!(job_id = %job.id, sync_target = %target, "Sync job queued");
            let orchestrator = Arc::clone(self);
            let job_id = job.id.clone();
            let target = target.to_string();
            tokio::spawn(async move {
                orchestrator.run_job(&job_id, kind, &target).await;
            });
        } else {
            info!(job_id = %job.id, sync_target = %target, "Sync job already active");
        }

        Ok(job)
    }

    pub async fn poll_result(&self, job_id: &str) -> Result<SyncJob, SyncError> {
        self.db
            .get_sync_job(job_id)
            .await?
            .ok_or_else(|| SyncError::UnknownJob(job_id.to_string()))
    }

    /// Fail jobs a previous process left unfinished.
    pub async fn recover_interrupted(&self) -> Result<u64, SyncError> {
        let count = self
            .db
            .fail_interrupted_sync_jobs("interrupted by server restart")
            .await?;
        if count > 0 {
            warn!(count, "Failed sync jobs interrupted by restart");
        }
        Ok(count)
    }

    /// Delete jobs that finished more than `retention` ago.
    pub async fn cleanup_finished(&self, retention: Duration) -> Result<u64, SyncError> {
        let retention = i64::try_from(retention.as_secs()).unwrap_or(i64::MAX);
        let before = unix_timestamp().saturating_sub(retention);
        Ok(self.db.delete_finished_sync_jobs(before).await?)
    }

    async fn run_job(&self, job_id: &str, kind: SyncJobKind, target: &str) {
        if let Err(e) = self.db.mark_sync_job_running(job_id).await {
            warn!(job_id, error = %e, "Sync job could not start");
            return;
        }

        let outcome = match self.sources.get(&kind) {
            Some(source) => source.run(target).await,
            None => Err(SyncError::UnknownTarget(format!(
                "no source configured for {}",
                kind.as_str()
            ))),
        };

        let finished = match outcome {
            Ok(summary) => {
                info!(job_id, processed = summary.processed, "Sync job succeeded");
                let result = job_result(&summary, None);
                self.db
                    .finish_sync_job(job_id, SyncJobStatus::Succeeded, Some(&result), None)
                    .await
            }
            Err(SyncError::PartialFailure { summary, detail }) => {
                warn!(job_id, failed = detail.len(), "Sync job finished with item failures");
                let result = job_result(&summary, Some(&detail));
                self.db
                    .finish_sync_job(job_id, SyncJobStatus::Succeeded, Some(&result), None)
                    .await
            }
            Err(e) => {
                error!(job_id, error = %e, "Sync job failed");
                self.db
                    .finish_sync_job(job_id, SyncJobStatus::Failed, None, Some(&e.to_string()))
                    .await
            }
        };

        if let Err(e) = finished {
            error!(job_id, error = %e, "Failed to record sync job result");
        }
    }
}

/// Spawn the hourly deletion of finished jobs older than `retention`.
pub fn spawn_job_cleanup(
    orchestrator: Arc<SyncOrchestrator>,
    retention: Duration,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut timer = tokio::time::interval(Duration::from_secs(3600));
        timer.tick().await; // Skip first immediate tick

        loop {
            tokio::select! {
                _ = timer.tick() => {
                    match orchestrator.cleanup_finished(retention).await {
                        Ok(removed) if removed > 0 => {
                            info!(removed, "Finished sync jobs cleaned up");
                        }
                        Err(e) => {
                            warn!(error = %e, "Sync job cleanup failed");
                        }
                        _ => {}
                    }
                }
                _ = shutdown.changed() => {
                    info!("Sync job cleanup shutting down");
                    return;
                }
            }
        }
    })
}

fn job_result(summary: &SyncSummary, failures: Option<&[String]>) -> String {
    let mut result = serde_json::json!({ "summary": summary });
    if let Some(failures) = failures {
        result["failures"] = serde_json::json!(failures);
    }
    result.to_string()
}
