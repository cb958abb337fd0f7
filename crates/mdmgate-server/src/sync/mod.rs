//! Asynchronous external sync jobs.
//!
//! Jobs are fire-and-forget: triggering returns a pending job at once and the
//! run happens in a spawned task. Results are polled by job id.

mod catalog;
mod directory;
mod orchestrator;

use async_trait::async_trait;
use serde::Serialize;

use crate::storage::{DatabaseError, SyncJobKind};

pub use catalog::CatalogSync;
pub use directory::DirectorySync;
pub use orchestrator::{SyncJobView, SyncOrchestrator, spawn_job_cleanup};

/// Counts reported by a finished sync run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncSummary {
    pub processed: u64,
    pub failed: u64,
    pub skipped: u64,
    /// `full` or `incremental` for directory syncs.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mode: Option<&'static str>,
}

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// Some items failed; the rest were applied.
    #[error("{} item(s) failed", detail.len())]
    PartialFailure {
        summary: SyncSummary,
        detail: Vec<String>,
    },

    #[error("external source unavailable: {0}")]
    ExternalSourceUnavailable(String),

    #[error("unknown sync target {0}")]
    UnknownTarget(String),

    #[error("unknown job {0}")]
    UnknownJob(String),

    #[error("storage error: {0}")]
    Storage(#[from] DatabaseError),
}

/// A system a sync job pulls from.
#[async_trait]
pub trait SyncSource: Send + Sync {
    fn kind(&self) -> SyncJobKind;

    async fn run(&self, target: &str) -> Result<SyncSummary, SyncError>;
}

/// Build the HTTP client shared by sync sources.
fn http_client(timeout: std::time::Duration) -> Result<reqwest::Client, SyncError> {
    // reqwest uses rustls-no-provider; Err means a provider is already installed.
    let _ = rustls::crypto::ring::default_provider().install_default();

    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| SyncError::ExternalSourceUnavailable(e.to_string()))
}
