//! APNs HTTP/2 provider API client.
//!
//! MDM pushes carry no alert: the body is `{"mdm": "<PushMagic>"}` and the
//! device reacts by connecting to the server. The TLS client identity is the
//! push certificate of the device's topic.

use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::storage::PushCertificateRecord;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("push certificate unusable as client identity: {0}")]
    Identity(String),

    #[error("APNs request failed: {0}")]
    Request(String),

    /// 429 or 5xx; worth retrying.
    #[error("APNs unavailable (status {status}): {reason}")]
    Unavailable { status: u16, reason: String },

    #[error("APNs rejected the push (status {status}): {reason}")]
    Rejected { status: u16, reason: String },

    /// 410: the device token is no longer valid for the topic.
    #[error("device token unregistered")]
    Unregistered,
}

impl TransportError {
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Request(_) | Self::Unavailable { .. })
    }
}

/// Where to deliver one push.
#[derive(Debug, Clone, Copy)]
pub struct PushTarget<'a> {
    /// Hex-encoded device token.
    pub token: &'a str,
    pub push_magic: &'a str,
    pub topic: &'a str,
}

#[async_trait]
pub trait PushTransport: Send + Sync {
    async fn send(
        &self,
        certificate: &PushCertificateRecord,
        target: &PushTarget<'_>,
    ) -> Result<(), TransportError>;
}

#[derive(Debug, Deserialize)]
struct ApnsErrorBody {
    #[serde(default)]
    reason: String,
}

/// Sends MDM pushes to APNs.
///
/// One HTTP client is kept per push certificate fingerprint, since the
/// certificate is the TLS client identity.
pub struct ApnsClient {
    base_url: String,
    timeout: Duration,
    clients: DashMap<String, reqwest::Client>,
}

impl ApnsClient {
    pub fn new(base_url: &str, timeout: Duration) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            timeout,
            clients: DashMap::new(),
        }
    }

    /// Create an APNs client for testing purposes only.
    ///
    /// Installs the `ring` crypto provider so that `reqwest::Client` can be
    /// constructed where `rustls-no-provider` is the workspace default.
    #[cfg(test)]
    pub(crate) fn for_testing(base_url: &str) -> Self {
        let _ = rustls::crypto::ring::default_provider().install_default();
        Self::new(base_url, Duration::from_secs(5))
    }

    fn client_for(
        &self,
        certificate: &PushCertificateRecord,
    ) -> Result<reqwest::Client, TransportError> {
        if let Some(client) = self.clients.get(&certificate.fingerprint) {
            return Ok(client.clone());
        }

        let identity_pem = format!("{}\n{}", certificate.cert_pem, certificate.key_pem);
        let identity = reqwest::Identity::from_pem(identity_pem.as_bytes())
            .map_err(|e| TransportError::Identity(e.to_string()))?;
        let client = reqwest::Client::builder()
            .identity(identity)
            .timeout(self.timeout)
            .build()
            .map_err(|e| TransportError::Identity(e.to_string()))?;

        self.clients
            .insert(certificate.fingerprint.clone(), client.clone());
        Ok(client)
    }

    pub fn device_url(&self, token: &str) -> String {
        format!("{}/3/device/{token}", self.base_url)
    }
}

#[async_trait]
impl PushTransport for ApnsClient {
    async fn send(
        &self,
        certificate: &PushCertificateRecord,
        target: &PushTarget<'_>,
    ) -> Result<(), TransportError> {
        let client = self.client_for(certificate)?;

        let response = client
            .post(self.device_url(target.token))
            .header("apns-topic", target.topic)
            .header("apns-push-type", "mdm")
            .header("apns-priority", "10")
            .json(&serde_json::json!({ "mdm": target.push_magic }))
            .send()
            .await
            .map_err(|e| TransportError::Request(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            debug!(topic = %target.topic, "APNs accepted push");
            return Ok(());
        }

        let status_code = status.as_u16();
        let reason = response
            .json::<ApnsErrorBody>()
            .await
            .map(|body| body.reason)
            .unwrap_or_default();
        warn!(status = status_code, reason = %reason, "APNs returned error");

        Err(match status_code {
            410 => TransportError::Unregistered,
            429 | 500..=599 => TransportError::Unavailable {
                status: status_code,
                reason,
            },
            _ => TransportError::Rejected {
                status: status_code,
                reason,
            },
        })
    }
}
