//! Server configuration.
//!
//! Resolution order (lowest to highest priority):
//! 1. Built-in defaults
//! 2. TOML config file (`--config` / `MDMGATE_CONFIG`)
//! 3. `MDMGATE_*` environment variables
//! 4. CLI arguments, applied by the binary

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};

/// Complete mdmgate server configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ServerConfig {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub push: PushConfig,
    #[serde(default)]
    pub credentials: CredentialsConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub api: ApiConfig,
}

/// Listener, storage and logging.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    pub listen_addr: String,
    pub database_path: Option<PathBuf>,
    /// Externally visible base URL, used to build `task_result_url`.
    pub public_url: String,
    pub log_json: bool,
    pub max_body_bytes: usize,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:8443".to_string(),
            database_path: None,
            public_url: "http://localhost:8443".to_string(),
            log_json: false,
            max_body_bytes: 4 * 1024 * 1024,
        }
    }
}

/// How device requests prove their identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum TrustMode {
    /// TLS is terminated upstream; the proxy forwards the client
    /// certificate and its subject DN as headers.
    #[default]
    Mtls,
    /// Devices sign each message body and send the signature in the
    /// `Mdm-Signature` header.
    SignedHeader,
}

/// Device authentication.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    pub trust_mode: TrustMode,
    /// PEM bundle of the CA chain that issues device identity certificates.
    pub trust_chain_path: Option<PathBuf>,
    pub client_cert_header: String,
    pub client_subject_dn_header: String,
    pub signature_header: String,
    /// Accepted distance between a signature's `signingTime` and now.
    pub clock_skew_secs: u64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            trust_mode: TrustMode::default(),
            trust_chain_path: None,
            client_cert_header: "X-Client-Cert".to_string(),
            client_subject_dn_header: "X-Client-Subject-DN".to_string(),
            signature_header: "Mdm-Signature".to_string(),
            clock_skew_secs: 300,
        }
    }
}

impl AuthConfig {
    pub const fn clock_skew(&self) -> Duration {
        Duration::from_secs(self.clock_skew_secs)
    }
}

/// Command delivery.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Time a device has to acknowledge a sent command.
    pub delivery_timeout_secs: u64,
    /// Deliveries allowed before a command is marked failed.
    pub max_attempts: u32,
    /// How often overdue in-flight commands are released.
    pub sweep_interval_secs: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            delivery_timeout_secs: 300,
            max_attempts: 3,
            sweep_interval_secs: 30,
        }
    }
}

impl QueueConfig {
    pub const fn delivery_timeout(&self) -> Duration {
        Duration::from_secs(self.delivery_timeout_secs)
    }

    pub const fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

/// APNs transport and retry policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PushConfig {
    pub apns_url: String,
    pub request_timeout_secs: u64,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
    pub max_attempts: u32,
}

impl Default for PushConfig {
    fn default() -> Self {
        Self {
            apns_url: "https://api.push.apple.com".to_string(),
            request_timeout_secs: 10,
            initial_delay_ms: 1_000,
            max_delay_ms: 60_000,
            multiplier: 2.0,
            max_attempts: 5,
        }
    }
}

/// Push certificate monitoring.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CredentialsConfig {
    /// Certificates expiring within this many days report `expiring`.
    pub expiring_window_days: u32,
    pub monitor_interval_secs: u64,
}

impl Default for CredentialsConfig {
    fn default() -> Self {
        Self {
            expiring_window_days: 30,
            monitor_interval_secs: 3600,
        }
    }
}

impl CredentialsConfig {
    pub fn expiring_window(&self) -> Duration {
        Duration::from_secs(u64::from(self.expiring_window_days) * 24 * 60 * 60)
    }
}

/// External sync sources.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub request_timeout_secs: u64,
    /// Finished jobs older than this are deleted by the hourly sweep.
    pub job_retention_secs: u64,
    pub directory_servers: Vec<DirectoryServerConfig>,
    pub catalog: Option<CatalogConfig>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            request_timeout_secs: 30,
            job_retention_secs: 7 * 24 * 60 * 60,
            directory_servers: Vec::new(),
            catalog: None,
        }
    }
}

/// A device-directory server the directory sync can pull from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirectoryServerConfig {
    pub id: String,
    pub url: String,
    pub token: String,
    #[serde(default = "default_page_limit")]
    pub page_limit: u32,
}

const fn default_page_limit() -> u32 {
    1000
}

/// Software catalog source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogConfig {
    #[serde(default = "default_catalog_name")]
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub token: Option<String>,
}

fn default_catalog_name() -> String {
    "default".to_string()
}

/// Operator API.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ApiConfig {
    /// HS256 secret used to validate operator bearer tokens.
    pub jwt_secret: String,
}

impl ServerConfig {
    /// Load configuration from an optional TOML file, then apply
    /// `MDMGATE_*` environment overrides and validate.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content).map_err(|message| Error::ConfigParse {
            path: path.display().to_string(),
            message,
        })
    }

    pub fn from_toml(content: &str) -> std::result::Result<Self, String> {
        toml::from_str(content).map_err(|e| e.to_string())
    }

    /// Apply overrides from an environment-like lookup.
    pub fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(val) = lookup("MDMGATE_LISTEN_ADDR") {
            self.server.listen_addr = val;
        }
        if let Some(val) = lookup("MDMGATE_DATABASE_PATH") {
            self.server.database_path = Some(PathBuf::from(val));
        }
        if let Some(val) = lookup("MDMGATE_PUBLIC_URL") {
            self.server.public_url = val;
        }
        if let Some(val) = lookup("MDMGATE_TRUST_CHAIN") {
            self.auth.trust_chain_path = Some(PathBuf::from(val));
        }
        if let Some(val) = lookup("MDMGATE_TRUST_MODE") {
            match val.as_str() {
                "mtls" => self.auth.trust_mode = TrustMode::Mtls,
                "signed-header" => self.auth.trust_mode = TrustMode::SignedHeader,
                other => tracing::warn!(value = other, "Ignoring unknown MDMGATE_TRUST_MODE"),
            }
        }
        if let Some(val) = lookup("MDMGATE_JWT_SECRET") {
            self.api.jwt_secret = val;
        }
        if let Some(val) = lookup("MDMGATE_LOG_JSON") {
            self.server.log_json = matches!(val.as_str(), "1" | "true" | "yes");
        }
    }

    /// Reject values that would make the server misbehave at runtime.
    pub fn validate(&self) -> Result<()> {
        if self.queue.max_attempts == 0 {
            return Err(Error::InvalidConfig("queue.max_attempts must be at least 1".into()));
        }
        if self.queue.delivery_timeout_secs == 0 {
            return Err(Error::InvalidConfig(
                "queue.delivery_timeout_secs must be positive".into(),
            ));
        }
        if self.push.multiplier < 1.0 {
            return Err(Error::InvalidConfig("push.multiplier must be >= 1.0".into()));
        }
        if self.api.jwt_secret.is_empty() {
            return Err(Error::InvalidConfig("api.jwt_secret must be set".into()));
        }
        let mut ids: Vec<&str> = self
            .sync
            .directory_servers
            .iter()
            .map(|s| s.id.as_str())
            .collect();
        ids.sort_unstable();
        if ids.windows(2).any(|w| w[0] == w[1]) {
            return Err(Error::InvalidConfig(
                "sync.directory_servers ids must be unique".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults_match_documented_values() {
        let config = ServerConfig::default();
        assert_eq!(config.queue.delivery_timeout(), Duration::from_secs(300));
        assert_eq!(config.queue.max_attempts, 3);
        assert_eq!(config.auth.clock_skew(), Duration::from_secs(300));
        assert_eq!(config.auth.trust_mode, TrustMode::Mtls);
        assert_eq!(config.credentials.expiring_window_days, 30);
    }

    #[test]
    fn parses_partial_toml() {
        let config = ServerConfig::from_toml(
            r#"
            [auth]
            trust_mode = "signed-header"
            clock_skew_secs = 60

            [queue]
            max_attempts = 5

            [[sync.directory_servers]]
            id = "dep-1"
            url = "https://dep.example.com"
            token = "secret"

            [sync.catalog]
            url = "https://catalog.example.com/packages.json"
            "#,
        )
        .unwrap();

        assert_eq!(config.auth.trust_mode, TrustMode::SignedHeader);
        assert_eq!(config.auth.clock_skew_secs, 60);
        assert_eq!(config.auth.signature_header, "Mdm-Signature");
        assert_eq!(config.queue.max_attempts, 5);
        assert_eq!(config.queue.delivery_timeout_secs, 300);
        assert_eq!(config.sync.directory_servers[0].page_limit, 1000);
        assert_eq!(config.sync.catalog.as_ref().unwrap().name, "default");
    }

    #[test]
    fn env_overrides_take_priority() {
        let env: HashMap<&str, &str> = [
            ("MDMGATE_TRUST_MODE", "signed-header"),
            ("MDMGATE_JWT_SECRET", "s3cret"),
            ("MDMGATE_LOG_JSON", "true"),
        ]
        .into_iter()
        .collect();
        let mut config = ServerConfig::default();
        config.apply_env_overrides(|k| env.get(k).map(ToString::to_string));

        assert_eq!(config.auth.trust_mode, TrustMode::SignedHeader);
        assert_eq!(config.api.jwt_secret, "s3cret");
        assert!(config.server.log_json);
    }

    #[test]
    fn validate_rejects_zero_attempt_ceiling() {
        let mut config = ServerConfig::default();
        config.api.jwt_secret = "x".into();
        config.queue.max_attempts = 0;
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn validate_requires_jwt_secret() {
        assert!(ServerConfig::default().validate().is_err());
    }

    #[test]
    fn validate_rejects_duplicate_directory_servers() {
        let mut config = ServerConfig::default();
        config.api.jwt_secret = "x".into();
        let server = DirectoryServerConfig {
            id: "dep".into(),
            url: "https://dep".into(),
            token: "t".into(),
            page_limit: 10,
        };
        config.sync.directory_servers = vec![server.clone(), server];
        assert!(config.validate().is_err());
    }

    #[test]
    fn from_file_reports_path_on_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mdmgate.toml");
        std::fs::write(&path, "[queue\nbroken").unwrap();
        let err = ServerConfig::from_file(&path).unwrap_err();
        assert!(err.to_string().contains("mdmgate.toml"));
    }
}
