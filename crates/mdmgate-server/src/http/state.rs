use std::sync::Arc;
use std::time::Duration;

use mdmgate_core::config::{AuthConfig, ServerConfig};

use crate::auth::{Authenticator, JwtManager, build_authenticator};
use crate::credentials::CredentialStore;
use crate::push::{BackoffPolicy, PushDispatcher, PushTransport};
use crate::queue::CommandQueue;
use crate::storage::MdmDatabase;
use crate::sync::{CatalogSync, DirectorySync, SyncError, SyncOrchestrator};

/// Shared application state passed to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub db: MdmDatabase,
    pub credentials: Arc<CredentialStore>,
    pub authenticator: Arc<dyn Authenticator>,
    pub queue: Arc<CommandQueue>,
    pub push: Arc<PushDispatcher>,
    pub sync: Arc<SyncOrchestrator>,
    pub jwt: Arc<JwtManager>,
    /// Header names used by the device endpoints.
    pub auth: Arc<AuthConfig>,
    pub public_url: Arc<str>,
    /// Target of catalog sync jobs.
    pub catalog_name: Arc<str>,
}

impl AppState {
    /// Wire the services described by `config` around `db`.
    pub fn build(
        config: &ServerConfig,
        db: MdmDatabase,
        transport: Arc<dyn PushTransport>,
    ) -> Result<Self, SyncError> {
        let credentials = Arc::new(CredentialStore::new(
            db.clone(),
            config.credentials.expiring_window(),
        ));
        let authenticator =
            build_authenticator(&config.auth, Arc::clone(&credentials), db.clone());
        let queue = Arc::new(CommandQueue::new(
            db.clone(),
            config.queue.delivery_timeout(),
            config.queue.max_attempts,
        ));
        let push = Arc::new(PushDispatcher::new(
            db.clone(),
            Arc::clone(&credentials),
            transport,
            BackoffPolicy::from_config(&config.push),
        ));

        let timeout = Duration::from_secs(config.sync.request_timeout_secs);
        let directory = DirectorySync::new(db.clone(), &config.sync.directory_servers, timeout)?;
        let catalog = CatalogSync::new(db.clone(), config.sync.catalog.clone(), timeout)?;
        let catalog_name: Arc<str> = catalog.source_name().unwrap_or("default").into();
        let sync = Arc::new(
            SyncOrchestrator::new(db.clone())
                .with_source(Arc::new(directory))
                .with_source(Arc::new(catalog)),
        );

        Ok(Self {
            db,
            credentials,
            authenticator,
            queue,
            push,
            sync,
            jwt: Arc::new(JwtManager::new(config.api.jwt_secret.as_bytes())),
            auth: Arc::new(config.auth.clone()),
            public_url: config.server.public_url.trim_end_matches('/').into(),
            catalog_name,
        })
    }

    pub fn task_result_url(&self, task_id: &str) -> String {
        format!("{}/api/tasks/{task_id}", self.public_url)
    }
}
