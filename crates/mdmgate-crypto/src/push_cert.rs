//! APNs push certificate parsing.
//!
//! A push certificate's topic is the `UID` attribute of its subject. The
//! private key must belong to the certificate; encrypted PKCS#8 keys are
//! decrypted with the supplied passphrase and stored unencrypted as PKCS#8.

use ring::rand::SystemRandom;
use ring::signature::{
    ECDSA_P256_SHA256_ASN1_SIGNING, ECDSA_P384_SHA384_ASN1_SIGNING, EcdsaKeyPair, Ed25519KeyPair,
    KeyPair, RsaKeyPair,
};
use x509_parser::prelude::*;

use crate::encoding::{MAX_CERT_SIZE, fingerprint, to_pem};

/// OID arcs of the `UID` attribute (0.9.2342.19200300.100.1.1).
pub const TOPIC_OID: &[u64] = &[0, 9, 2342, 19_200_300, 100, 1, 1];
const TOPIC_OID_STR: &str = "0.9.2342.19200300.100.1.1";

#[derive(Debug, thiserror::Error)]
pub enum PushCertError {
    #[error("invalid certificate: {0}")]
    InvalidCertificate(String),

    #[error("invalid private key: {0}")]
    InvalidKey(String),

    #[error("private key does not match the certificate")]
    KeyMismatch,
}

/// Validated push certificate material ready for storage.
#[derive(Debug, Clone)]
pub struct PushCertificateMaterial {
    pub topic: String,
    pub not_before: i64,
    pub not_after: i64,
    pub fingerprint: String,
    pub cert_pem: String,
    /// Unencrypted private key PEM (`PRIVATE KEY` or `RSA PRIVATE KEY`).
    pub key_pem: String,
}

/// Parse a push certificate and its key, check that they belong together
/// and extract the topic.
pub fn parse_push_certificate(
    cert_pem: &str,
    key_pem: &str,
    passphrase: Option<&str>,
) -> Result<PushCertificateMaterial, PushCertError> {
    let cert_block = ::pem::parse(cert_pem)
        .map_err(|e| PushCertError::InvalidCertificate(format!("PEM: {e}")))?;
    if cert_block.tag() != "CERTIFICATE" {
        return Err(PushCertError::InvalidCertificate(format!(
            "unexpected PEM label {}",
            cert_block.tag()
        )));
    }
    let cert_der = cert_block.contents();
    if cert_der.len() > MAX_CERT_SIZE {
        return Err(PushCertError::InvalidCertificate(format!(
            "certificate too large: {} bytes",
            cert_der.len()
        )));
    }
    let (_, cert) = X509Certificate::from_der(cert_der)
        .map_err(|e| PushCertError::InvalidCertificate(e.to_string()))?;

    let topic = extract_topic(&cert)
        .ok_or_else(|| PushCertError::InvalidCertificate("subject has no UID topic".into()))?;

    let key = decode_private_key(key_pem, passphrase)?;
    if key.public_key != cert.public_key().subject_public_key.data.as_ref() {
        return Err(PushCertError::KeyMismatch);
    }

    Ok(PushCertificateMaterial {
        topic,
        not_before: cert.validity().not_before.timestamp(),
        not_after: cert.validity().not_after.timestamp(),
        fingerprint: fingerprint(cert_der),
        cert_pem: to_pem("CERTIFICATE", cert_der),
        key_pem: key.pem,
    })
}

/// The push topic of a certificate, if its subject carries one.
pub fn extract_topic(cert: &X509Certificate<'_>) -> Option<String> {
    cert.subject()
        .iter_attributes()
        .find(|attr| attr.attr_type().to_id_string() == TOPIC_OID_STR)
        .and_then(|attr| attr.as_str().ok())
        .map(ToString::to_string)
}

struct DecodedKey {
    pem: String,
    public_key: Vec<u8>,
}

fn decode_private_key(
    key_pem: &str,
    passphrase: Option<&str>,
) -> Result<DecodedKey, PushCertError> {
    let block = ::pem::parse(key_pem).map_err(|e| PushCertError::InvalidKey(format!("PEM: {e}")))?;
    match block.tag() {
        "PRIVATE KEY" => pkcs8_key(block.contents()),
        "ENCRYPTED PRIVATE KEY" => {
            let passphrase = passphrase
                .ok_or_else(|| PushCertError::InvalidKey("key is encrypted".into()))?;
            let encrypted = pkcs8::EncryptedPrivateKeyInfo::try_from(block.contents())
                .map_err(|e| PushCertError::InvalidKey(e.to_string()))?;
            let document = encrypted
                .decrypt(passphrase)
                .map_err(|_| PushCertError::InvalidKey("wrong passphrase".into()))?;
            pkcs8_key(document.as_bytes())
        }
        "RSA PRIVATE KEY" => {
            let pair = RsaKeyPair::from_der(block.contents())
                .map_err(|e| PushCertError::InvalidKey(e.to_string()))?;
            Ok(DecodedKey {
                pem: to_pem("RSA PRIVATE KEY", block.contents()),
                public_key: pair.public_key().as_ref().to_vec(),
            })
        }
        other => Err(PushCertError::InvalidKey(format!(
            "unsupported PEM label {other}"
        ))),
    }
}

fn pkcs8_key(der: &[u8]) -> Result<DecodedKey, PushCertError> {
    let public_key = pkcs8_public_key(der)
        .ok_or_else(|| PushCertError::InvalidKey("unsupported PKCS#8 key type".into()))?;
    Ok(DecodedKey {
        pem: to_pem("PRIVATE KEY", der),
        public_key,
    })
}

fn pkcs8_public_key(der: &[u8]) -> Option<Vec<u8>> {
    if let Ok(pair) = RsaKeyPair::from_pkcs8(der) {
        return Some(pair.public_key().as_ref().to_vec());
    }
    let rng = SystemRandom::new();
    for alg in [&ECDSA_P256_SHA256_ASN1_SIGNING, &ECDSA_P384_SHA384_ASN1_SIGNING] {
        if let Ok(pair) = EcdsaKeyPair::from_pkcs8(alg, der, &rng) {
            return Some(pair.public_key().as_ref().to_vec());
        }
    }
    Ed25519KeyPair::from_pkcs8_maybe_unchecked(der)
        .ok()
        .map(|pair| pair.public_key().as_ref().to_vec())
}
