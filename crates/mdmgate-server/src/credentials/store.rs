//! Trust chain and push certificate management.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwapOption;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{info, instrument, warn};

use mdmgate_core::db::unix_timestamp;
use mdmgate_crypto::{ChainError, PushCertError, TrustChain, parse_push_certificate};

use crate::storage::{
    DatabaseError, MdmDatabase, NewPushCertificateParams, PushCertificateRecord,
    PushCertificateState,
};

#[derive(Debug, thiserror::Error)]
pub enum CredentialError {
    #[error("malformed trust chain: {0}")]
    MalformedChain(#[from] ChainError),

    #[error("invalid push certificate: {0}")]
    InvalidCertificate(String),

    #[error("invalid private key: {0}")]
    InvalidKey(String),

    #[error("private key does not match the certificate")]
    KeyMismatch,

    #[error("push certificate topic changed from {expected} to {found}")]
    TopicChanged { expected: String, found: String },

    #[error("topic {topic} is already used by push certificate {slot}")]
    TopicInUse { topic: String, slot: String },

    #[error("no active push certificate named {0}")]
    NotFound(String),

    #[error("cannot read {path}: {message}")]
    Io { path: String, message: String },

    #[error("storage error: {0}")]
    Storage(#[from] DatabaseError),
}

impl From<PushCertError> for CredentialError {
    fn from(e: PushCertError) -> Self {
        match e {
            PushCertError::InvalidCertificate(msg) => Self::InvalidCertificate(msg),
            PushCertError::InvalidKey(msg) => Self::InvalidKey(msg),
            PushCertError::KeyMismatch => Self::KeyMismatch,
        }
    }
}

/// Reported status of a push certificate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PushCertificateStatus {
    Active,
    Expiring,
    Expired,
    Revoked,
}

impl PushCertificateStatus {
    pub fn of(record: &PushCertificateRecord, now: i64, expiring_window: Duration) -> Self {
        if record.state == PushCertificateState::Revoked {
            return Self::Revoked;
        }
        if record.not_after <= now {
            return Self::Expired;
        }
        let window = i64::try_from(expiring_window.as_secs()).unwrap_or(i64::MAX);
        if record.not_after.saturating_sub(now) <= window {
            Self::Expiring
        } else {
            Self::Active
        }
    }

    /// Whether push may still be sent with the certificate.
    pub const fn is_usable(self) -> bool {
        matches!(self, Self::Active | Self::Expiring)
    }
}

/// Operator-facing view of a push certificate version.
#[derive(Debug, Clone, Serialize)]
pub struct PushCertificateView {
    pub name: String,
    pub version: i64,
    pub topic: String,
    pub fingerprint: String,
    pub not_before: Option<DateTime<Utc>>,
    pub not_after: Option<DateTime<Utc>>,
    pub status: PushCertificateStatus,
    /// Devices whose push binding was invalidated by this load.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub invalidated_devices: Option<u64>,
}

impl PushCertificateView {
    fn new(record: &PushCertificateRecord, status: PushCertificateStatus) -> Self {
        Self {
            name: record.name.clone(),
            version: record.version,
            topic: record.topic.clone(),
            fingerprint: record.fingerprint.clone(),
            not_before: DateTime::from_timestamp(record.not_before, 0),
            not_after: DateTime::from_timestamp(record.not_after, 0),
            status,
            invalidated_devices: None,
        }
    }
}

/// Holds the device trust chain and manages push certificate versions.
pub struct CredentialStore {
    db: MdmDatabase,
    trust_chain: ArcSwapOption<TrustChain>,
    expiring_window: Duration,
    /// Serializes push certificate loads so topic checks and writes agree.
    load_lock: Mutex<()>,
}

impl CredentialStore {
    pub fn new(db: MdmDatabase, expiring_window: Duration) -> Self {
        Self {
            db,
            trust_chain: ArcSwapOption::empty(),
            expiring_window,
            load_lock: Mutex::new(()),
        }
    }

    // =========================================================================
    // Trust chain
    // =========================================================================

    /// Parse and install a trust chain. On failure the previous chain stays.
    pub fn load_trust_chain(&self, pem: &str) -> Result<Arc<TrustChain>, CredentialError> {
        let chain = Arc::new(TrustChain::from_pem(pem)?);
        self.trust_chain.store(Some(Arc::clone(&chain)));
        info!(
            certificates = chain.len(),
            root = %chain.root_fingerprint(),
            "Trust chain loaded"
        );
        Ok(chain)
    }

    pub fn load_trust_chain_file(&self, path: &Path) -> Result<Arc<TrustChain>, CredentialError> {
        let pem = std::fs::read_to_string(path).map_err(|e| CredentialError::Io {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        self.load_trust_chain(&pem)
    }

    /// The current trust chain, if one was loaded.
    pub fn trust_chain(&self) -> Option<Arc<TrustChain>> {
        self.trust_chain.load_full()
    }

    // =========================================================================
    // Push certificates
    // =========================================================================

    pub const fn expiring_window(&self) -> Duration {
        self.expiring_window
    }

    pub fn status_of(&self, record: &PushCertificateRecord) -> PushCertificateStatus {
        PushCertificateStatus::of(record, unix_timestamp(), self.expiring_window)
    }

    /// Load a new version into the `name` slot.
    ///
    /// Same topic as the slot's latest version: renewal. Different topic:
    /// rejected with `TopicChanged` unless `replace` is set, in which case
    /// devices bound to the old topic lose their push binding.
    #[instrument(skip(self, cert_pem, key_pem, passphrase), fields(slot = %name))]
    pub async fn load_push_certificate(
        &self,
        name: &str,
        cert_pem: &str,
        key_pem: &str,
        passphrase: Option<&str>,
        replace: bool,
    ) -> Result<PushCertificateView, CredentialError> {
        let material = parse_push_certificate(cert_pem, key_pem, passphrase)?;

        let _guard = self.load_lock.lock().await;

        if let Some(other) = self
            .db
            .list_active_push_certificates()
            .await?
            .into_iter()
            .find(|c| c.name != name && c.topic == material.topic)
        {
            return Err(CredentialError::TopicInUse {
                topic: material.topic,
                slot: other.name,
            });
        }

        let invalidate_topic = match self.db.get_latest_push_certificate(name).await? {
            Some(previous) if previous.topic != material.topic => {
                if !replace {
                    return Err(CredentialError::TopicChanged {
                        expected: previous.topic,
                        found: material.topic,
                    });
                }
                Some(previous.topic)
            }
            _ => None,
        };

        let (record, invalidated) = self
            .db
            .insert_push_certificate_version(
                &NewPushCertificateParams {
                    name,
                    topic: &material.topic,
                    fingerprint: &material.fingerprint,
                    not_before: material.not_before,
                    not_after: material.not_after,
                    cert_pem: &material.cert_pem,
                    key_pem: &material.key_pem,
                },
                invalidate_topic.as_deref(),
            )
            .await?;

        if let Some(old_topic) = &invalidate_topic {
            warn!(
                old_topic = %old_topic,
                topic = %record.topic,
                invalidated,
                "Push certificate replaced with a new topic; bound devices must re-enroll"
            );
        } else {
            info!(
                topic = %record.topic,
                version = record.version,
                "Push certificate loaded"
            );
        }

        let mut view = PushCertificateView::new(&record, self.status_of(&record));
        if invalidate_topic.is_some() {
            view.invalidated_devices = Some(invalidated);
        }
        Ok(view)
    }

    pub async fn revoke_push_certificate(&self, name: &str) -> Result<(), CredentialError> {
        if !self.db.revoke_push_certificate(name).await? {
            return Err(CredentialError::NotFound(name.to_string()));
        }
        warn!(slot = %name, "Push certificate revoked");
        Ok(())
    }

    /// Latest version of every slot with its current status.
    pub async fn list_push_certificates(
        &self,
    ) -> Result<Vec<PushCertificateView>, CredentialError> {
        let now = unix_timestamp();
        Ok(self
            .db
            .list_latest_push_certificates()
            .await?
            .iter()
            .map(|r| {
                PushCertificateView::new(r, PushCertificateStatus::of(r, now, self.expiring_window))
            })
            .collect())
    }
}
