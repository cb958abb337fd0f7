//! Software catalog sync.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::AUTHORIZATION;
use serde::Deserialize;
use tracing::{info, instrument, warn};

use super::{SyncError, SyncSource, SyncSummary, http_client};
use crate::storage::{CatalogPackageParams, MdmDatabase, SyncJobKind};
use mdmgate_core::config::CatalogConfig;

#[derive(Deserialize)]
#[serde(untagged)]
enum CatalogDocument {
    List(Vec<PackageInfo>),
    Wrapped { packages: Vec<PackageInfo> },
}

impl CatalogDocument {
    fn into_packages(self) -> Vec<PackageInfo> {
        match self {
            Self::List(packages) | Self::Wrapped { packages } => packages,
        }
    }
}

#[derive(Deserialize)]
struct PackageInfo {
    name: Option<String>,
    version: Option<String>,
    #[serde(default)]
    catalogs: Vec<String>,
    description: Option<String>,
}

/// Pulls package metadata from the configured catalog.
pub struct CatalogSync {
    db: MdmDatabase,
    config: Option<CatalogConfig>,
    http: reqwest::Client,
}

impl CatalogSync {
    pub fn new(
        db: MdmDatabase,
        config: Option<CatalogConfig>,
        timeout: Duration,
    ) -> Result<Self, SyncError> {
        Ok(Self {
            db,
            config,
            http: http_client(timeout)?,
        })
    }

    /// Name of the configured catalog, used as the job target.
    pub fn source_name(&self) -> Option<&str> {
        self.config.as_ref().map(|c| c.name.as_str())
    }

    async fn fetch(&self, config: &CatalogConfig) -> Result<Vec<PackageInfo>, SyncError> {
        let mut request = self.http.get(&config.url);
        if let Some(token) = &config.token {
            request = request.header(AUTHORIZATION, format!("Bearer {token}"));
        }

        let unavailable = |e: reqwest::Error| SyncError::ExternalSourceUnavailable(e.to_string());
        let resp = request.send().await.map_err(unavailable)?;
        let status = resp.status();
        if !status.is_success() {
            return Err(SyncError::ExternalSourceUnavailable(format!(
                "catalog returned {status}"
            )));
        }

        let document: CatalogDocument = resp.json().await.map_err(unavailable)?;
        Ok(document.into_packages())
    }
}

#[async_trait]
impl SyncSource for CatalogSync {
    fn kind(&self) -> SyncJobKind {
        SyncJobKind::CatalogSync
    }

    #[instrument(skip(self))]
    async fn run(&self, target: &str) -> Result<SyncSummary, SyncError> {
        let config = self
            .config
            .as_ref()
            .filter(|c| c.name == target)
            .ok_or_else(|| SyncError::UnknownTarget(target.to_string()))?;

        let packages = self.fetch(config).await?;
        let mut summary = SyncSummary::default();
        let mut failures = Vec::new();

        for (index, package) in packages.iter().enumerate() {
            let (Some(name), Some(version)) = (
                package.name.as_deref().filter(|n| !n.is_empty()),
                package.version.as_deref().filter(|v| !v.is_empty()),
            ) else {
                summary.failed += 1;
                failures.push(format!("package {index}: missing name or version"));
                continue;
            };

            if package.catalogs.is_empty() {
                warn!(name, version, "Package has no catalogs, skipping");
                summary.skipped += 1;
                continue;
            }

            let catalogs = serde_json::to_string(&package.catalogs)
                .map_err(|e| SyncError::ExternalSourceUnavailable(e.to_string()))?;
            self.db
                .upsert_catalog_package(&CatalogPackageParams {
                    source: &config.name,
                    name,
                    version,
                    catalogs: &catalogs,
                    description: package.description.as_deref(),
                })
                .await?;
            summary.processed += 1;
        }

        info!(
            source = %config.name,
            processed = summary.processed,
            skipped = summary.skipped,
            failed = summary.failed,
            "Catalog sync finished"
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

    use axum::http::{HeaderMap, StatusCode};
    use axum::routing::get;
    use axum::{Json, Router};
    use serde_json::{Value, json};

    async fn packages(headers: HeaderMap) -> Result<Json<Value>, StatusCode> {
        if headers.get("authorization").and_then(|v| v.to_str().ok()) != Some("Bearer t0k") {
            return Err(StatusCode::UNAUTHORIZED);
        }
        Ok(Json(json!([
            {"name": "Firefox", "version": "130.0", "catalogs": ["production"], "description": "Browser"},
            {"name": "Slack", "version": "4.40", "catalogs": []},
            {"name": "Zoom", "catalogs": ["testing"]},
            {"name": "Firefox", "version": "131.0", "catalogs": ["testing", "production"]},
        ])))
    }

    async fn wrapped() -> Json<Value> {
        Json(json!({"packages": [
            {"name": "Munki", "version": "6.5", "catalogs": ["production"]},
        ]}))
    }

    async fn mock_catalog() -> String {
        let app = Router::new()
            .route("/catalog.json", get(packages))
            .route("/wrapped.json", get(wrapped));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    async fn catalog(url: String, token: Option<&str>) -> (CatalogSync, MdmDatabase) {
        let db = MdmDatabase::open_in_memory().await.unwrap();
        let config = CatalogConfig {
            name: "munki".into(),
            url,
            token: token.map(str::to_string),
        };
        let sync = CatalogSync::new(db.clone(), Some(config), Duration::from_secs(5)).unwrap();
        (sync, db)
    }

    #[tokio::test]
    async fn packages_are_stored_skipped_or_failed() {
        let base = mock_catalog().await;
        let (sync, db) = catalog(format!("{base}/catalog.json"), Some("t0k")).await;
        assert_eq!(sync.source_name(), Some("munki"));

        let err = sync.run("munki").await.unwrap_err();
        let SyncError::PartialFailure { summary, detail } = err else {
            panic!("expected partial failure, got {err:?}");
        };
        assert_eq!(summary.processed, 2);
        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.failed, 1);
        assert_eq!(detail, vec!["package 2: missing name or version".to_string()]);

        let stored = db.list_catalog_packages("munki").await.unwrap();
        assert_eq!(stored.len(), 2);
        assert_eq!(stored[1].version, "131.0");
        assert_eq!(stored[1].catalogs, r#"["testing","production"]"#);
    }

    #[tokio::test]
    async fn wrapped_document_is_accepted() {
        let base = mock_catalog().await;
        let (sync, db) = catalog(format!("{base}/wrapped.json"), None).await;

        let summary = sync.run("munki").await.unwrap();
        assert_eq!(summary.processed, 1);
        assert_eq!(db.list_catalog_packages("munki").await.unwrap()[0].name, "Munki");
    }

    #[tokio::test]
    async fn rejected_request_is_unavailable() {
        let base = mock_catalog().await;
        let (sync, _) = catalog(format!("{base}/catalog.json"), None).await;

        let err = sync.run("munki").await.unwrap_err();
        assert!(matches!(err, SyncError::ExternalSourceUnavailable(_)));
    }

    #[tokio::test]
    async fn other_name_is_unknown_target() {
        let (sync, _) = catalog("http://127.0.0.1:9/catalog.json".into(), None).await;
        let err = sync.run("other").await.unwrap_err();
        assert!(matches!(err, SyncError::UnknownTarget(_)));
    }
}
