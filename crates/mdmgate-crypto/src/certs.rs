//! Certificate generation for development trust roots and test fixtures.
//!
//! Produces device-identity CAs, device certificates and APNs-style push
//! certificates whose subject carries the push topic as a `UID` attribute.
//!
//! Requires the `certs` feature to be enabled.

use rcgen::{
    BasicConstraints, CertificateParams, DnType, ExtendedKeyUsagePurpose, IsCa, Issuer, KeyPair,
    KeyUsagePurpose,
};
use time::{Duration, OffsetDateTime};

use crate::push_cert::TOPIC_OID;

/// CA material able to sign further certificates.
pub struct CaBundle {
    /// CA certificate parameters (needed for signing).
    pub params: CertificateParams,
    /// CA key pair.
    pub key_pair: KeyPair,
    pub cert_pem: String,
    pub cert_der: Vec<u8>,
}

/// A leaf certificate and its PKCS#8 private key.
pub struct CertBundle {
    pub cert_pem: String,
    pub cert_der: Vec<u8>,
    pub key_pem: String,
    /// PKCS#8 DER private key.
    pub key_der: Vec<u8>,
}

/// Certificate generation errors.
#[derive(Debug, thiserror::Error)]
pub enum CertError {
    /// An error occurred during certificate generation or signing.
    #[error("Certificate generation error: {0}")]
    Generation(String),
}

fn generation(e: impl std::fmt::Display) -> CertError {
    CertError::Generation(e.to_string())
}

fn ca_params(common_name: &str, org_name: &str) -> CertificateParams {
    let mut params = CertificateParams::default();
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params
        .distinguished_name
        .push(DnType::CommonName, common_name);
    params
        .distinguished_name
        .push(DnType::OrganizationName, org_name);
    params.key_usages.push(KeyUsagePurpose::KeyCertSign);
    params.key_usages.push(KeyUsagePurpose::CrlSign);
    params
}

/// Generate a self-signed root CA for device identities.
pub fn generate_root_ca(org_name: &str) -> Result<CaBundle, CertError> {
    let params = ca_params(&format!("{org_name} Root CA"), org_name);
    let key_pair = KeyPair::generate().map_err(generation)?;
    let cert = params.self_signed(&key_pair).map_err(generation)?;

    Ok(CaBundle {
        cert_pem: cert.pem(),
        cert_der: cert.der().to_vec(),
        params,
        key_pair,
    })
}

/// Generate an intermediate CA signed by `parent`.
pub fn generate_intermediate_ca(parent: &CaBundle, name: &str) -> Result<CaBundle, CertError> {
    let issuer = Issuer::from_params(&parent.params, &parent.key_pair);
    let params = ca_params(name, name);
    let key_pair = KeyPair::generate().map_err(generation)?;
    let cert = params.signed_by(&key_pair, &issuer).map_err(generation)?;

    Ok(CaBundle {
        cert_pem: cert.pem(),
        cert_der: cert.der().to_vec(),
        params,
        key_pair,
    })
}

/// Generate a device identity certificate (CN = UDID) valid for a year.
pub fn generate_device_cert(ca: &CaBundle, udid: &str) -> Result<CertBundle, CertError> {
    generate_device_cert_expiring_in(ca, udid, 365)
}

/// Generate a device identity certificate whose `notAfter` is
/// `days` from now. Negative values produce an already expired certificate.
pub fn generate_device_cert_expiring_in(
    ca: &CaBundle,
    udid: &str,
    days: i64,
) -> Result<CertBundle, CertError> {
    let issuer = Issuer::from_params(&ca.params, &ca.key_pair);

    let mut params = CertificateParams::default();
    params.distinguished_name.push(DnType::CommonName, udid);
    params
        .distinguished_name
        .push(DnType::OrganizationName, "mdmgate devices");
    params
        .extended_key_usages
        .push(ExtendedKeyUsagePurpose::ClientAuth);
    params.key_usages.push(KeyUsagePurpose::DigitalSignature);
    set_validity(&mut params, days);

    let key = KeyPair::generate().map_err(generation)?;
    let cert = params.signed_by(&key, &issuer).map_err(generation)?;

    Ok(CertBundle {
        cert_pem: cert.pem(),
        cert_der: cert.der().to_vec(),
        key_pem: key.serialize_pem(),
        key_der: key.serialize_der(),
    })
}

/// Generate a self-signed push certificate for `topic` whose `notAfter`
/// is `days` from now.
pub fn generate_push_cert(topic: &str, days: i64) -> Result<CertBundle, CertError> {
    let mut params = CertificateParams::default();
    params
        .distinguished_name
        .push(DnType::CustomDnType(TOPIC_OID.to_vec()), topic);
    params
        .distinguished_name
        .push(DnType::CommonName, format!("APSP:{topic}"));
    params
        .extended_key_usages
        .push(ExtendedKeyUsagePurpose::ClientAuth);
    set_validity(&mut params, days);

    let key = KeyPair::generate().map_err(generation)?;
    let cert = params.self_signed(&key).map_err(generation)?;

    Ok(CertBundle {
        cert_pem: cert.pem(),
        cert_der: cert.der().to_vec(),
        key_pem: key.serialize_pem(),
        key_der: key.serialize_der(),
    })
}

fn set_validity(params: &mut CertificateParams, days: i64) {
    let now = OffsetDateTime::now_utc();
    params.not_before = now - Duration::days(days.abs().max(1) + 30);
    params.not_after = now + Duration::days(days);
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn root_ca_produces_pem_and_der() {
        let ca = generate_root_ca("mdmgate Test").unwrap();
        assert!(ca.cert_pem.contains("BEGIN CERTIFICATE"));
        assert!(!ca.cert_der.is_empty());
    }

    #[test]
    fn device_certs_are_unique_per_device() {
        let ca = generate_root_ca("mdmgate Test").unwrap();
        let a = generate_device_cert(&ca, "UDID-A").unwrap();
        let b = generate_device_cert(&ca, "UDID-B").unwrap();
        assert_ne!(a.cert_der, b.cert_der);
        assert_ne!(a.key_pem, b.key_pem);
        assert!(a.key_pem.contains("BEGIN PRIVATE KEY"));
    }
}
