//! Device-directory sync.
//!
//! The first run for a server pages through `/server/devices`; later runs ask
//! `/devices/sync` for changes since the stored cursor. A server that no
//! longer knows the cursor answers `EXPIRED_CURSOR`, and the run starts over
//! with a full fetch.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::AUTHORIZATION;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use super::{SyncError, SyncSource, SyncSummary, http_client};
use crate::storage::{DatabaseError, DirectoryDeviceParams, MdmDatabase, SyncJobKind};
use mdmgate_core::config::DirectoryServerConfig;

const EXPIRED_CURSOR: &str = "EXPIRED_CURSOR";

#[derive(Debug, thiserror::Error)]
enum DirectoryError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("directory API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("cursor expired")]
    ExpiredCursor,

    #[error(transparent)]
    Storage(#[from] DatabaseError),
}

impl From<DirectoryError> for SyncError {
    fn from(e: DirectoryError) -> Self {
        match e {
            DirectoryError::Storage(e) => Self::Storage(e),
            other => Self::ExternalSourceUnavailable(other.to_string()),
        }
    }
}

#[derive(Serialize)]
struct PageRequest<'a> {
    limit: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    cursor: Option<&'a str>,
}

#[derive(Deserialize)]
struct DevicePage {
    #[serde(default)]
    devices: Vec<DirectoryRecord>,
    cursor: Option<String>,
    #[serde(default)]
    more_to_follow: bool,
}

#[derive(Deserialize)]
struct DirectoryRecord {
    serial_number: Option<String>,
    model: Option<String>,
    description: Option<String>,
    color: Option<String>,
    profile_status: Option<String>,
    op_type: Option<String>,
    op_date: Option<String>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mode {
    Full,
    Incremental,
}

impl Mode {
    const fn path(self) -> &'static str {
        match self {
            Self::Full => "/server/devices",
            Self::Incremental => "/devices/sync",
        }
    }

    const fn as_str(self) -> &'static str {
        match self {
            Self::Full => "full",
            Self::Incremental => "incremental",
        }
    }
}

/// Pulls device records from configured directory servers.
pub struct DirectorySync {
    db: MdmDatabase,
    servers: HashMap<String, DirectoryServerConfig>,
    http: reqwest::Client,
}

impl DirectorySync {
    pub fn new(
        db: MdmDatabase,
        servers: &[DirectoryServerConfig],
        timeout: Duration,
    ) -> Result<Self, SyncError> {
        Ok(Self {
            db,
            servers: servers
                .iter()
                .map(|s| (s.id.clone(), s.clone()))
                .collect(),
            http: http_client(timeout)?,
        })
    }

    /// Fetch pages from `mode`'s endpoint until the server has no more.
    ///
    /// Records are applied as they arrive; the returned cursor is the last
    /// one the server handed out.
    async fn fetch(
        &self,
        server: &DirectoryServerConfig,
        mode: Mode,
        mut cursor: Option<String>,
        summary: &mut SyncSummary,
        failures: &mut Vec<String>,
    ) -> Result<Option<String>, DirectoryError> {
        let url = format!("{}{}", server.url.trim_end_matches('/'), mode.path());

        loop {
            let resp = self
                .http
                .post(&url)
                .header(AUTHORIZATION, format!("Bearer {}", server.token))
                .json(&PageRequest {
                    limit: server.page_limit,
                    cursor: cursor.as_deref(),
                })
                .send()
                .await?;

            let status = resp.status();
            if !status.is_success() {
                let message = resp.text().await.unwrap_or_default();
                if status.as_u16() == 400 && message.contains(EXPIRED_CURSOR) {
                    return Err(DirectoryError::ExpiredCursor);
                }
                return Err(DirectoryError::Api {
                    status: status.as_u16(),
                    message,
                });
            }

            let page: DevicePage = resp.json().await?;
            for record in &page.devices {
                self.apply(&server.id, record, summary, failures).await?;
            }

            if page.cursor.is_some() {
                cursor = page.cursor;
            }
            if !page.more_to_follow {
                return Ok(cursor);
            }
        }
    }

    async fn apply(
        &self,
        server_id: &str,
        record: &DirectoryRecord,
        summary: &mut SyncSummary,
        failures: &mut Vec<String>,
    ) -> Result<(), DatabaseError> {
        // Position within the whole run, not the page.
        let index = summary.processed + summary.failed + summary.skipped;
        let Some(serial_number) = record.serial_number.as_deref().filter(|s| !s.is_empty())
        else {
            summary.failed += 1;
            failures.push(format!("record {index}: missing serial number"));
            return Ok(());
        };

        self.db
            .upsert_directory_device(&DirectoryDeviceParams {
                serial_number,
                server_id,
                model: record.model.as_deref(),
                description: record.description.as_deref(),
                color: record.color.as_deref(),
                profile_status: record.profile_status.as_deref(),
                op_type: record.op_type.as_deref(),
                op_date: record.op_date.as_deref(),
            })
            .await?;
        summary.processed += 1;
        Ok(())
    }
}

#[async_trait]
impl SyncSource for DirectorySync {
    fn kind(&self) -> SyncJobKind {
        SyncJobKind::DirectorySync
    }

    #[instrument(skip(self))]
    async fn run(&self, target: &str) -> Result<SyncSummary, SyncError> {
        let server = self
            .servers
            .get(target)
            .ok_or_else(|| SyncError::UnknownTarget(target.to_string()))?;

        let mut summary = SyncSummary::default();
        let mut failures = Vec::new();

        let stored = self.db.get_directory_cursor(&server.id).await?;
        let mut mode = if stored.is_some() {
            Mode::Incremental
        } else {
            Mode::Full
        };

        let cursor = match self
            .fetch(server, mode, stored, &mut summary, &mut failures)
            .await
        {
            Err(DirectoryError::ExpiredCursor) if mode == Mode::Incremental => {
                warn!(server_id = %server.id, "Directory cursor expired, falling back to full fetch");
                self.db.clear_directory_cursor(&server.id).await?;
                mode = Mode::Full;
                self.fetch(server, mode, None, &mut summary, &mut failures)
                    .await?
            }
            other => other?,
        };

        if let Some(cursor) = cursor {
            self.db.set_directory_cursor(&server.id, &cursor).await?;
        }

        summary.mode = Some(mode.as_str());
        info!(
            server_id = %server.id,
            mode = mode.as_str(),
            processed = summary.processed,
            failed = summary.failed,
            "Directory sync finished"
        );

        if failures.is_empty() {
            Ok(summary)
        } else {
            Err(SyncError::PartialFailure {
                summary,
                detail: failures,
            })
        }
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    use axum::extract::State;
    use axum::http::{HeaderMap, StatusCode};
    use axum::response::{IntoResponse, Response};
    use axum::routing::post;
    use axum::{Json, Router};
    use serde_json::{Value, json};

    #[derive(Default)]
    struct Seen {
        calls: Vec<(String, Value)>,
        authorization: Vec<String>,
    }

    type Shared = Arc<Mutex<Seen>>;

    fn record(seen: &Shared, path: &str, headers: &HeaderMap, body: &Value) {
        let mut seen = seen.lock().unwrap();
        seen.calls.push((path.to_string(), body.clone()));
        seen.authorization.push(
            headers
                .get("authorization")
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default()
                .to_string(),
        );
    }

    async fn full(
        State(seen): State<Shared>,
        headers: HeaderMap,
        Json(body): Json<Value>,
    ) -> Json<Value> {
        record(&seen, "full", &headers, &body);
        if body.get("cursor").is_none() {
            Json(json!({
                "devices": [
                    {"serial_number": "C02AAA", "model": "MacBook Pro", "op_type": "added"},
                    {"model": "iPad"},
                ],
                "cursor": "page-2",
                "more_to_follow": true,
            }))
        } else {
            Json(json!({
                "devices": [
                    {"serial_number": "C02BBB", "color": "space gray"},
                    {"model": "iPhone"},
                ],
                "cursor": "final",
                "more_to_follow": false,
            }))
        }
    }

    async fn incremental(
        State(seen): State<Shared>,
        headers: HeaderMap,
        Json(body): Json<Value>,
    ) -> Response {
        record(&seen, "incremental", &headers, &body);
        if body["cursor"] == "stale" {
            return (
                StatusCode::BAD_REQUEST,
                "{\"code\": \"EXPIRED_CURSOR\"}",
            )
                .into_response();
        }
        Json(json!({
            "devices": [{"serial_number": "C02AAA", "op_type": "deleted"}],
            "cursor": "next",
            "more_to_follow": false,
        }))
        .into_response()
    }

    async fn mock_directory() -> (String, Shared) {
        let seen = Shared::default();
        let app = Router::new()
            .route("/server/devices", post(full))
            .route("/devices/sync", post(incremental))
            .with_state(Arc::clone(&seen));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{addr}"), seen)
    }

    async fn directory(url: &str) -> (DirectorySync, MdmDatabase) {
        let db = MdmDatabase::open_in_memory().await.unwrap();
        let server = DirectoryServerConfig {
            id: "dep-1".into(),
            url: url.to_string(),
            token: "secret".into(),
            page_limit: 2,
        };
        let sync = DirectorySync::new(db.clone(), &[server], Duration::from_secs(5)).unwrap();
        (sync, db)
    }

    #[tokio::test]
    async fn full_fetch_pages_and_reports_item_failures() {
        let (url, seen) = mock_directory().await;
        let (sync, db) = directory(&url).await;

        let err = sync.run("dep-1").await.unwrap_err();
        let SyncError::PartialFailure { summary, detail } = err else {
            panic!("expected partial failure, got {err:?}");
        };
        assert_eq!(summary.processed, 2);
        assert_eq!(summary.failed, 2);
        assert_eq!(summary.mode, Some("full"));
        assert_eq!(
            detail,
            vec![
                "record 1: missing serial number".to_string(),
                "record 3: missing serial number".to_string(),
            ]
        );

        assert_eq!(
            db.get_directory_cursor("dep-1").await.unwrap().as_deref(),
            Some("final")
        );
        assert_eq!(db.list_directory_devices("dep-1").await.unwrap().len(), 2);

        let seen = seen.lock().unwrap();
        assert_eq!(seen.calls.len(), 2);
        assert_eq!(seen.calls[0].1["limit"], 2);
        assert_eq!(seen.calls[1].1["cursor"], "page-2");
        assert!(seen.authorization.iter().all(|a| a == "Bearer secret"));
    }

    #[tokio::test]
    async fn stored_cursor_runs_incremental_sync() {
        let (url, seen) = mock_directory().await;
        let (sync, db) = directory(&url).await;
        db.set_directory_cursor("dep-1", "fresh").await.unwrap();

        let summary = sync.run("dep-1").await.unwrap();
        assert_eq!(summary.mode, Some("incremental"));
        assert_eq!(summary.processed, 1);
        assert!(db.get_directory_device("C02AAA").await.unwrap().unwrap().deleted);
        assert_eq!(
            db.get_directory_cursor("dep-1").await.unwrap().as_deref(),
            Some("next")
        );
        assert_eq!(seen.lock().unwrap().calls[0].0, "incremental");
    }

    #[tokio::test]
    async fn expired_cursor_falls_back_to_full_fetch() {
        let (url, seen) = mock_directory().await;
        let (sync, db) = directory(&url).await;
        db.set_directory_cursor("dep-1", "stale").await.unwrap();

        let err = sync.run("dep-1").await.unwrap_err();
        let SyncError::PartialFailure { summary, .. } = err else {
            panic!("expected partial failure, got {err:?}");
        };
        assert_eq!(summary.mode, Some("full"));

        let paths: Vec<_> = seen
            .lock()
            .unwrap()
            .calls
            .iter()
            .map(|(p, _)| p.clone())
            .collect();
        assert_eq!(paths, vec!["incremental", "full", "full"]);
        assert_eq!(
            db.get_directory_cursor("dep-1").await.unwrap().as_deref(),
            Some("final")
        );
    }

    #[tokio::test]
    async fn unknown_server_is_unknown_target() {
        let (sync, _) = directory("http://127.0.0.1:9").await;
        let err = sync.run("nope").await.unwrap_err();
        assert!(matches!(err, SyncError::UnknownTarget(_)));
    }

    #[tokio::test]
    async fn unreachable_server_is_unavailable() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());
        drop(listener);

        let (sync, db) = directory(&url).await;
        let err = sync.run("dep-1").await.unwrap_err();
        assert!(matches!(err, SyncError::ExternalSourceUnavailable(_)));
        assert!(db.get_directory_cursor("dep-1").await.unwrap().is_none());
    }
}
