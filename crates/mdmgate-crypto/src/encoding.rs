//! PEM helpers and certificate fingerprints.

use sha2::{Digest, Sha256};

/// Largest DER certificate accepted anywhere in mdmgate.
pub const MAX_CERT_SIZE: usize = 16 * 1024;

/// Decode every `CERTIFICATE` block of a PEM bundle, in order.
///
/// Blocks with other labels are skipped.
pub fn certificates_from_pem(input: &str) -> Result<Vec<Vec<u8>>, pem::PemError> {
    Ok(pem::parse_many(input)?
        .into_iter()
        .filter(|block| block.tag() == "CERTIFICATE")
        .map(pem::Pem::into_contents)
        .collect())
}

/// Encode DER bytes as a PEM block with the given label.
pub fn to_pem(tag: &str, der: &[u8]) -> String {
    pem::encode(&pem::Pem::new(tag, der.to_vec()))
}

/// Lowercase hex SHA-256 of a DER certificate.
pub fn fingerprint(der: &[u8]) -> String {
    hex::encode(Sha256::digest(der))
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn skips_non_certificate_blocks() {
        let bundle = format!(
            "{}{}",
            to_pem("PRIVATE KEY", b"key"),
            to_pem("CERTIFICATE", b"cert")
        );
        let certs = certificates_from_pem(&bundle).unwrap();
        assert_eq!(certs, vec![b"cert".to_vec()]);
    }

    #[test]
    fn empty_input_yields_no_certificates() {
        assert!(certificates_from_pem("").unwrap().is_empty());
    }

    #[test]
    fn fingerprint_is_64_hex_chars() {
        let fp = fingerprint(b"abc");
        assert_eq!(fp.len(), 64);
        assert!(fp.starts_with("ba7816bf"));
    }
}
