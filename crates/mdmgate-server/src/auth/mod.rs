//! Authentication for device connections and operator requests.
//!
//! Devices authenticate with either an upstream-terminated mTLS client
//! certificate or the `Mdm-Signature` header; operators with a JWT bearer
//! token carrying permissions.

mod mtls;
pub mod operator;
mod replay;
mod signed_header;

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use mdmgate_core::config::{AuthConfig, TrustMode};
use mdmgate_crypto::VerifiedCertificate;

use crate::credentials::CredentialStore;
use crate::storage::{DatabaseError, EnrollmentState, MdmDatabase};

pub use mtls::MutualTlsAuthenticator;
pub use operator::{JwtManager, OperatorClaims};
pub use replay::ReplayCache;
pub use signed_header::SignedHeaderAuthenticator;

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("missing device credentials")]
    MissingCredentials,

    #[error("untrusted certificate: {0}")]
    UntrustedCertificate(String),

    #[error("invalid signature: {0}")]
    InvalidSignature(String),

    #[error("stale signature: {0}")]
    StaleSignature(String),

    #[error("signature replayed")]
    Replayed,

    #[error("unknown device {0}")]
    UnknownDevice(String),

    #[error("device {0} is enrolled with a different certificate")]
    CertificateMismatch(String),

    #[error("storage error: {0}")]
    Storage(#[from] DatabaseError),
}

/// What a device presented with one request.
#[derive(Debug, Clone, Copy)]
pub struct DeviceRequest<'a> {
    /// UDID claimed in the message body.
    pub udid: &'a str,
    /// `true` for `Authenticate` check-ins, which may introduce a new device.
    pub enrolling: bool,
    pub body: &'a [u8],
    /// URL-escaped PEM client certificate forwarded by the TLS terminator.
    pub client_cert: Option<&'a str>,
    pub subject_dn: Option<&'a str>,
    /// Base64 DER CMS signature from `Mdm-Signature`.
    pub signature: Option<&'a str>,
}

/// An authenticated device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceIdentity {
    pub udid: String,
    /// SHA-256 fingerprint of the presented certificate.
    pub fingerprint: String,
    pub subject_dn: String,
    pub common_name: Option<String>,
}

#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn authenticate(
        &self,
        request: &DeviceRequest<'_>,
    ) -> Result<DeviceIdentity, AuthError>;
}

/// Build the authenticator selected by `trust_mode`.
pub fn build_authenticator(
    config: &AuthConfig,
    credentials: Arc<CredentialStore>,
    db: MdmDatabase,
) -> Arc<dyn Authenticator> {
    match config.trust_mode {
        TrustMode::Mtls => Arc::new(MutualTlsAuthenticator::new(credentials, db)),
        TrustMode::SignedHeader => Arc::new(SignedHeaderAuthenticator::new(
            credentials,
            db,
            config.clock_skew(),
        )),
    }
}

/// Bind a verified certificate to the device registry.
///
/// Any message other than `Authenticate` must come from a known,
/// non-unenrolled device enrolled with the same certificate. `Authenticate`
/// may introduce a new device or re-enroll one that checked out, but never
/// rebinds an active device to another certificate.
async fn resolve_identity(
    db: &MdmDatabase,
    request: &DeviceRequest<'_>,
    verified: VerifiedCertificate,
) -> Result<DeviceIdentity, AuthError> {
    let same_certificate = db
        .get_device(request.udid)
        .await?
        .filter(|device| device.enrollment_state != EnrollmentState::Unenrolled)
        .map(|device| device.cert_fingerprint == verified.fingerprint);

    match (request.enrolling, same_certificate) {
        (true, Some(false)) => {
            warn!(
                udid = %request.udid,
                fingerprint = %verified.fingerprint,
                "Authenticate for an enrolled device with another certificate"
            );
            return Err(AuthError::CertificateMismatch(request.udid.to_string()));
        }
        (false, None | Some(false)) => {
            return Err(AuthError::UnknownDevice(request.udid.to_string()));
        }
        _ => {}
    }

    debug!(udid = %request.udid, fingerprint = %verified.fingerprint, "Device authenticated");
    Ok(DeviceIdentity {
        udid: request.udid.to_string(),
        fingerprint: verified.fingerprint,
        subject_dn: verified.subject,
        common_name: verified.common_name,
    })
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
pub(crate) mod test_support {
    use super::*;
    use crate::storage::EnrollDeviceParams;
    use mdmgate_crypto::certs::{CaBundle, CertBundle, generate_device_cert, generate_root_ca};
    use std::time::Duration;

    pub struct Fixture {
        pub db: MdmDatabase,
        pub credentials: Arc<CredentialStore>,
        pub ca: CaBundle,
        pub device: CertBundle,
    }

    pub async fn fixture() -> Fixture {
        let db = MdmDatabase::open_in_memory().await.unwrap();
        let credentials = Arc::new(CredentialStore::new(
            db.clone(),
            Duration::from_secs(30 * 86_400),
        ));
        let ca = generate_root_ca("Test MDM").unwrap();
        credentials.load_trust_chain(&ca.cert_pem).unwrap();
        let device = generate_device_cert(&ca, "udid-1").unwrap();
        Fixture {
            db,
            credentials,
            ca,
            device,
        }
    }

    pub async fn enroll(fixture: &Fixture, cert: &CertBundle) {
        fixture
            .db
            .enroll_device(&EnrollDeviceParams {
                udid: "udid-1",
                serial_number: None,
                cert_fingerprint: &mdmgate_crypto::fingerprint(&cert.cert_der),
                subject_dn: "CN=udid-1",
                topic: "com.apple.mgmt.test",
            })
            .await
            .unwrap();
    }

    pub fn request<'a>(enrolling: bool, body: &'a [u8]) -> DeviceRequest<'a> {
        DeviceRequest {
            udid: "udid-1",
            enrolling,
            body,
            client_cert: None,
            subject_dn: None,
            signature: None,
        }
    }
}
