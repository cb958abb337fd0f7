//! Mutual-TLS authentication terminated by an upstream proxy.
//!
//! The proxy forwards the verified client certificate as URL-escaped PEM and
//! the subject DN it saw; both are re-checked here against the trust chain.

use std::sync::Arc;

use async_trait::async_trait;

use mdmgate_core::db::unix_timestamp;
use mdmgate_crypto::chain::normalize_dn;
use mdmgate_crypto::encoding::certificates_from_pem;

use super::{AuthError, Authenticator, DeviceIdentity, DeviceRequest, resolve_identity};
use crate::credentials::CredentialStore;
use crate::storage::MdmDatabase;

pub struct MutualTlsAuthenticator {
    credentials: Arc<CredentialStore>,
    db: MdmDatabase,
}

impl MutualTlsAuthenticator {
    pub const fn new(credentials: Arc<CredentialStore>, db: MdmDatabase) -> Self {
        Self { credentials, db }
    }
}

#[async_trait]
impl Authenticator for MutualTlsAuthenticator {
    async fn authenticate(
        &self,
        request: &DeviceRequest<'_>,
    ) -> Result<DeviceIdentity, AuthError> {
        let escaped = request
            .client_cert
            .filter(|v| !v.is_empty())
            .ok_or(AuthError::MissingCredentials)?;
        let presented_dn = request
            .subject_dn
            .filter(|v| !v.is_empty())
            .ok_or(AuthError::MissingCredentials)?;

        let pem = percent_decode(escaped)
            .ok_or_else(|| AuthError::UntrustedCertificate("bad URL escaping".into()))?;
        let leaf = certificates_from_pem(&pem)
            .map_err(|e| AuthError::UntrustedCertificate(e.to_string()))?
            .into_iter()
            .next()
            .ok_or_else(|| AuthError::UntrustedCertificate("no certificate".into()))?;

        let chain = self
            .credentials
            .trust_chain()
            .ok_or_else(|| AuthError::UntrustedCertificate("no trust chain loaded".into()))?;
        let verified = chain
            .verify(&leaf, unix_timestamp())
            .map_err(|e| AuthError::UntrustedCertificate(e.to_string()))?;

        if normalize_dn(presented_dn) != normalize_dn(&verified.subject) {
            return Err(AuthError::UntrustedCertificate(
                "subject DN does not match certificate".into(),
            ));
        }

        resolve_identity(&self.db, request, verified).await
    }
}

/// Decode `%XX` escapes. Returns `None` on truncated or non-hex escapes.
fn percent_decode(input: &str) -> Option<String> {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = bytes.get(i + 1..i + 3)?;
            if !hex.iter().all(u8::is_ascii_hexdigit) {
                return None;
            }
            out.push(u8::from_str_radix(std::str::from_utf8(hex).ok()?, 16).ok()?);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).ok()
}
