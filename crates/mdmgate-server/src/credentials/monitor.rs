//! Push certificate expiry monitoring.

use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};

use super::store::{CredentialStore, PushCertificateStatus};

/// Log the status of every push certificate slot. Returns the number of
/// slots that need operator attention.
pub async fn check_push_certificates(store: &CredentialStore) -> usize {
    let certificates = match store.list_push_certificates().await {
        Ok(certificates) => certificates,
        Err(e) => {
            error!(error = %e, "Push certificate check failed");
            return 0;
        }
    };

    let mut attention = 0;
    for cert in &certificates {
        match cert.status {
            PushCertificateStatus::Active => {}
            PushCertificateStatus::Expiring => {
                attention += 1;
                warn!(
                    slot = %cert.name,
                    topic = %cert.topic,
                    not_after = ?cert.not_after,
                    "Push certificate expires soon; renew it with the same topic"
                );
            }
            PushCertificateStatus::Expired => {
                attention += 1;
                error!(
                    slot = %cert.name,
                    topic = %cert.topic,
                    not_after = ?cert.not_after,
                    "Push certificate expired; devices on this topic cannot be woken"
                );
            }
            PushCertificateStatus::Revoked => {
                attention += 1;
                warn!(slot = %cert.name, topic = %cert.topic, "Push certificate revoked");
            }
        }
    }
    attention
}

/// Spawn a background task that checks push certificate expiry every
/// `interval`.
pub fn spawn_push_cert_monitor(
    store: Arc<CredentialStore>,
    interval: Duration,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        info!(
            interval_secs = interval.as_secs(),
            "Push certificate monitor started"
        );

        let mut timer = tokio::time::interval(interval);

        loop {
            tokio::select! {
                _ = timer.tick() => {
                    check_push_certificates(&store).await;
                }
                _ = shutdown.changed() => {
                    info!("Push certificate monitor shutting down");
                    return;
                }
            }
        }
    })
}
