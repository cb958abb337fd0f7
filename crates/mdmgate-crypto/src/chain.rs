//! Device-identity trust chains.
//!
//! A `TrustChain` is an ordered list of CA certificates from the issuing CA
//! up to a self-signed root. It is validated once at load time; device
//! certificates are then accepted only if a chain member issued them.

use x509_parser::prelude::*;

use crate::encoding::{MAX_CERT_SIZE, certificates_from_pem, fingerprint};

#[derive(Debug, thiserror::Error)]
pub enum ChainError {
    #[error("malformed trust chain: {0}")]
    Malformed(String),

    #[error("certificate could not be parsed: {0}")]
    InvalidCertificate(String),

    #[error("certificate is outside its validity period")]
    NotValidNow,

    #[error("certificate was not issued by the trust chain")]
    UnknownIssuer,
}

/// A device certificate that passed chain validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedCertificate {
    pub fingerprint: String,
    /// Subject DN in RFC 4514 form as rendered by `x509-parser`.
    pub subject: String,
    pub common_name: Option<String>,
    pub not_after: i64,
}

/// Ordered CA chain, issuing CA first, self-signed root last.
#[derive(Debug, Clone)]
pub struct TrustChain {
    certificates: Vec<Vec<u8>>,
    fingerprints: Vec<String>,
}

impl TrustChain {
    /// Parse and validate a PEM bundle.
    pub fn from_pem(pem: &str) -> Result<Self, ChainError> {
        let certificates =
            certificates_from_pem(pem).map_err(|e| ChainError::Malformed(e.to_string()))?;
        Self::from_der_chain(certificates)
    }

    pub fn from_der_chain(certificates: Vec<Vec<u8>>) -> Result<Self, ChainError> {
        if certificates.is_empty() {
            return Err(ChainError::Malformed("no certificates".into()));
        }

        let parsed = certificates
            .iter()
            .enumerate()
            .map(|(i, der)| {
                X509Certificate::from_der(der)
                    .map(|(_, cert)| cert)
                    .map_err(|e| ChainError::Malformed(format!("certificate {i}: {e}")))
            })
            .collect::<Result<Vec<_>, _>>()?;

        for (i, cert) in parsed.iter().enumerate() {
            if !cert.is_ca() {
                return Err(ChainError::Malformed(format!(
                    "certificate {i} ({}) is not a CA",
                    cert.subject()
                )));
            }
            let issuer = parsed.get(i + 1).unwrap_or(cert);
            if cert.issuer().as_raw() != issuer.subject().as_raw() {
                return Err(ChainError::Malformed(format!(
                    "certificate {i} ({}) is not issued by its successor",
                    cert.subject()
                )));
            }
            cert.verify_signature(Some(issuer.public_key()))
                .map_err(|e| ChainError::Malformed(format!("certificate {i} signature: {e}")))?;
        }

        let fingerprints = certificates.iter().map(|der| fingerprint(der)).collect();
        Ok(Self {
            certificates,
            fingerprints,
        })
    }

    pub fn len(&self) -> usize {
        self.certificates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.certificates.is_empty()
    }

    /// Fingerprint of the self-signed root.
    pub fn root_fingerprint(&self) -> &str {
        self.fingerprints.last().map_or("", String::as_str)
    }

    /// Validate a device certificate at Unix time `now`.
    pub fn verify(&self, leaf_der: &[u8], now: i64) -> Result<VerifiedCertificate, ChainError> {
        if leaf_der.len() > MAX_CERT_SIZE {
            return Err(ChainError::InvalidCertificate(format!(
                "certificate too large: {} bytes",
                leaf_der.len()
            )));
        }
        let (_, leaf) = X509Certificate::from_der(leaf_der)
            .map_err(|e| ChainError::InvalidCertificate(e.to_string()))?;
        let at =
            ASN1Time::from_timestamp(now).map_err(|e| ChainError::InvalidCertificate(e.to_string()))?;
        if !leaf.validity().is_valid_at(at) {
            return Err(ChainError::NotValidNow);
        }

        let issued_by_chain = self.certificates.iter().any(|der| {
            X509Certificate::from_der(der).is_ok_and(|(_, ca)| {
                ca.subject().as_raw() == leaf.issuer().as_raw()
                    && ca.validity().is_valid_at(at)
                    && leaf.verify_signature(Some(ca.public_key())).is_ok()
            })
        });
        if !issued_by_chain {
            return Err(ChainError::UnknownIssuer);
        }

        Ok(VerifiedCertificate {
            fingerprint: fingerprint(leaf_der),
            subject: leaf.subject().to_string(),
            common_name: leaf
                .subject()
                .iter_common_name()
                .next()
                .and_then(|cn| cn.as_str().ok())
                .map(ToString::to_string),
            not_after: leaf.validity().not_after.timestamp(),
        })
    }
}

/// Split a subject DN into sorted `(TYPE, value)` pairs so that
/// `CN=a,O=b`, `O=b, CN=a` and `/O=b/CN=a` compare equal.
pub fn normalize_dn(dn: &str) -> Vec<(String, String)> {
    let dn = dn.trim();
    let parts: Vec<&str> = if let Some(rest) = dn.strip_prefix('/') {
        rest.split('/').collect()
    } else {
        split_unescaped(dn)
    };
    let mut pairs: Vec<(String, String)> = parts
        .into_iter()
        .filter_map(|part| {
            let (key, value) = part.split_once('=')?;
            Some((
                key.trim().to_ascii_uppercase(),
                value.trim().replace("\\,", ","),
            ))
        })
        .collect();
    pairs.sort();
    pairs
}

fn split_unescaped(dn: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut start = 0;
    let mut escaped = false;
    for (i, c) in dn.char_indices() {
        match c {
            '\\' if !escaped => escaped = true,
            ',' | '+' if !escaped => {
                parts.push(&dn[start..i]);
                start = i + 1;
            }
            _ => escaped = false,
        }
    }
    parts.push(&dn[start..]);
    parts
}

/// Common name from a DN string, if present.
pub fn common_name(dn: &str) -> Option<String> {
    normalize_dn(dn)
        .into_iter()
        .find(|(key, _)| key == "CN")
        .map(|(_, value)| value)
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::certs::{
        generate_device_cert, generate_device_cert_expiring_in, generate_intermediate_ca,
        generate_root_ca,
    };

    fn now() -> i64 {
        chrono::Utc::now().timestamp()
    }

    #[test]
    fn accepts_device_issued_by_intermediate() {
        let root = generate_root_ca("Acme").unwrap();
        let issuing = generate_intermediate_ca(&root, "Acme Device CA").unwrap();
        let chain =
            TrustChain::from_pem(&format!("{}{}", issuing.cert_pem, root.cert_pem)).unwrap();
        assert_eq!(chain.len(), 2);

        let device = generate_device_cert(&issuing, "UDID-1").unwrap();
        let verified = chain.verify(&device.cert_der, now()).unwrap();
        assert_eq!(verified.common_name.as_deref(), Some("UDID-1"));
        assert_eq!(verified.fingerprint, fingerprint(&device.cert_der));
    }

    #[test]
    fn rejects_device_from_foreign_ca() {
        let root = generate_root_ca("Acme").unwrap();
        let other = generate_root_ca("Evil").unwrap();
        let chain = TrustChain::from_pem(&root.cert_pem).unwrap();
        let device = generate_device_cert(&other, "UDID-1").unwrap();
        assert!(matches!(
            chain.verify(&device.cert_der, now()),
            Err(ChainError::UnknownIssuer)
        ));
    }

    #[test]
    fn rejects_expired_device_certificate() {
        let root = generate_root_ca("Acme").unwrap();
        let chain = TrustChain::from_pem(&root.cert_pem).unwrap();
        let device = generate_device_cert_expiring_in(&root, "UDID-1", -2).unwrap();
        assert!(matches!(
            chain.verify(&device.cert_der, now()),
            Err(ChainError::NotValidNow)
        ));
    }

    #[test]
    fn rejects_empty_and_out_of_order_chains() {
        assert!(matches!(
            TrustChain::from_pem(""),
            Err(ChainError::Malformed(_))
        ));

        let root = generate_root_ca("Acme").unwrap();
        let issuing = generate_intermediate_ca(&root, "Acme Device CA").unwrap();
        // Root first: the root is not issued by the intermediate.
        let reversed = format!("{}{}", root.cert_pem, issuing.cert_pem);
        assert!(matches!(
            TrustChain::from_pem(&reversed),
            Err(ChainError::Malformed(_))
        ));
    }

    #[test]
    fn rejects_chain_without_root() {
        let root = generate_root_ca("Acme").unwrap();
        let issuing = generate_intermediate_ca(&root, "Acme Device CA").unwrap();
        assert!(matches!(
            TrustChain::from_pem(&issuing.cert_pem),
            Err(ChainError::Malformed(_))
        ));
    }

    #[test]
    fn rejects_leaf_certificate_in_chain() {
        let root = generate_root_ca("Acme").unwrap();
        let device = generate_device_cert(&root, "UDID-1").unwrap();
        let bundle = format!("{}{}", device.cert_pem, root.cert_pem);
        assert!(matches!(
            TrustChain::from_pem(&bundle),
            Err(ChainError::Malformed(_))
        ));
    }

    #[test]
    fn dn_normalization_ignores_order_and_format() {
        assert_eq!(
            normalize_dn("CN=UDID-1,O=Acme"),
            normalize_dn("/O=Acme/CN=UDID-1")
        );
        assert_eq!(normalize_dn("O=Acme, CN=UDID-1"), normalize_dn("cn=UDID-1,o=Acme"));
        assert_eq!(common_name("O=A\\, Inc.,CN=dev"), Some("dev".to_string()));
    }
}
