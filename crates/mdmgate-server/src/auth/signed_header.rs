//! `Mdm-Signature` authentication.
//!
//! The header carries a base64 detached CMS `SignedData` over the request
//! body, signed with the device identity key.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use tracing::warn;

use mdmgate_core::db::unix_timestamp;
use mdmgate_crypto::{fingerprint, verify_detached};

use super::replay::ReplayCache;
use super::{AuthError, Authenticator, DeviceIdentity, DeviceRequest, resolve_identity};
use crate::credentials::CredentialStore;
use crate::storage::MdmDatabase;

pub struct SignedHeaderAuthenticator {
    credentials: Arc<CredentialStore>,
    db: MdmDatabase,
    clock_skew_secs: i64,
    replay: ReplayCache,
}

impl SignedHeaderAuthenticator {
    pub fn new(credentials: Arc<CredentialStore>, db: MdmDatabase, clock_skew: Duration) -> Self {
        let clock_skew_secs = i64::try_from(clock_skew.as_secs()).unwrap_or(i64::MAX / 2);
        Self {
            credentials,
            db,
            clock_skew_secs,
            // A signature stays acceptable for `skew` on either side of now.
            replay: ReplayCache::new(clock_skew_secs.saturating_mul(2)),
        }
    }
}

#[async_trait]
impl Authenticator for SignedHeaderAuthenticator {
    async fn authenticate(
        &self,
        request: &DeviceRequest<'_>,
    ) -> Result<DeviceIdentity, AuthError> {
        let encoded = request
            .signature
            .filter(|v| !v.is_empty())
            .ok_or(AuthError::MissingCredentials)?;
        let cms = STANDARD
            .decode(encoded.trim())
            .map_err(|e| AuthError::InvalidSignature(format!("base64: {e}")))?;

        let signature = verify_detached(&cms, request.body)
            .map_err(|e| AuthError::InvalidSignature(e.to_string()))?;

        let now = unix_timestamp();
        let chain = self
            .credentials
            .trust_chain()
            .ok_or_else(|| AuthError::UntrustedCertificate("no trust chain loaded".into()))?;
        let verified = chain
            .verify(&signature.signer_der, now)
            .map_err(|e| AuthError::UntrustedCertificate(e.to_string()))?;

        let signed_at = signature
            .signing_time
            .ok_or_else(|| AuthError::StaleSignature("no signingTime attribute".into()))?;
        if (now - signed_at).abs() > self.clock_skew_secs {
            warn!(udid = %request.udid, signed_at, now, "Signature outside clock skew");
            return Err(AuthError::StaleSignature(format!(
                "signed {}s away from server time",
                now - signed_at
            )));
        }

        if !self.replay.check_and_insert(&fingerprint(&cms), now) {
            warn!(udid = %request.udid, "Replayed device signature");
            return Err(AuthError::Replayed);
        }

        resolve_identity(&self.db, request, verified).await
    }
}
