//! Push dispatch: resolve a device's push binding and wake it up.

use std::sync::Arc;

use tracing::{info, instrument, warn};

use super::apns::{PushTarget, PushTransport, TransportError};
use super::backoff::BackoffPolicy;
use crate::credentials::CredentialStore;
use crate::storage::{DatabaseError, EnrollmentState, MdmDatabase, PushCertificateRecord};

#[derive(Debug, thiserror::Error)]
pub enum PushError {
    #[error("unknown device {0}")]
    UnknownDevice(String),

    #[error("device {0} has not sent a push token")]
    NotReachable(String),

    #[error("device {udid} is bound to topic {topic}, which no active push certificate serves")]
    DeviceTopicMismatch { udid: String, topic: String },

    #[error("no active push certificate")]
    NoActivePushCertificate,

    #[error("push delivery failed: {0}")]
    ExternalServiceError(String),

    #[error("storage error: {0}")]
    Storage(#[from] DatabaseError),
}

pub struct PushDispatcher {
    db: MdmDatabase,
    credentials: Arc<CredentialStore>,
    transport: Arc<dyn PushTransport>,
    policy: BackoffPolicy,
}

impl PushDispatcher {
    pub fn new(
        db: MdmDatabase,
        credentials: Arc<CredentialStore>,
        transport: Arc<dyn PushTransport>,
        policy: BackoffPolicy,
    ) -> Self {
        Self {
            db,
            credentials,
            transport,
            policy,
        }
    }

    /// Send an MDM wake-up push to a device.
    #[instrument(skip(self), fields(udid = %udid))]
    pub async fn notify(&self, udid: &str) -> Result<(), PushError> {
        let device = self
            .db
            .get_device(udid)
            .await?
            .filter(|d| d.enrollment_state != EnrollmentState::Unenrolled)
            .ok_or_else(|| PushError::UnknownDevice(udid.to_string()))?;

        let (Some(token), Some(push_magic), Some(topic)) =
            (&device.push_token, &device.push_magic, &device.topic)
        else {
            return Err(PushError::NotReachable(udid.to_string()));
        };

        if device.push_invalidated {
            return Err(PushError::DeviceTopicMismatch {
                udid: udid.to_string(),
                topic: topic.clone(),
            });
        }

        let certificate = self.certificate_for(udid, topic).await?;
        let target = PushTarget {
            token,
            push_magic,
            topic,
        };

        let mut attempt = 0;
        loop {
            match self.transport.send(&certificate, &target).await {
                Ok(()) => {
                    info!(topic = %topic, attempt, "Push delivered");
                    return Ok(());
                }
                Err(TransportError::Unregistered) => {
                    self.db.invalidate_device_push(udid).await?;
                    warn!(topic = %topic, "Device token unregistered; push binding invalidated");
                    return Err(PushError::ExternalServiceError(
                        TransportError::Unregistered.to_string(),
                    ));
                }
                Err(e) if e.is_retryable() && self.policy.should_retry(attempt + 1) => {
                    let delay = self.policy.delay_for_attempt(attempt);
                    warn!(
                        error = %e,
                        attempt,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        "Push attempt failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(PushError::ExternalServiceError(e.to_string())),
            }
        }
    }

    /// Spawn [`notify`](Self::notify) and log the outcome.
    pub fn notify_in_background(self: &Arc<Self>, udid: String) -> tokio::task::JoinHandle<()> {
        let dispatcher = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = dispatcher.notify(&udid).await {
                warn!(udid = %udid, error = %e, "Background push failed");
            }
        })
    }

    /// The usable certificate serving `topic`.
    async fn certificate_for(
        &self,
        udid: &str,
        topic: &str,
    ) -> Result<PushCertificateRecord, PushError> {
        if let Some(cert) = self.db.find_active_push_certificate_by_topic(topic).await? {
            if self.credentials.status_of(&cert).is_usable() {
                return Ok(cert);
            }
            return Err(PushError::NoActivePushCertificate);
        }

        let other_usable = self
            .db
            .list_active_push_certificates()
            .await?
            .iter()
            .any(|c| self.credentials.status_of(c).is_usable());
        if other_usable {
            Err(PushError::DeviceTopicMismatch {
                udid: udid.to_string(),
                topic: topic.to_string(),
            })
        } else {
            Err(PushError::NoActivePushCertificate)
        }
    }
}
