//! Detached CMS `SignedData` verification for the `Mdm-Signature` header.
//!
//! Devices sign each request body with their identity key and send the
//! base64 DER `ContentInfo` in a header. The signed attributes carry the
//! body digest and the signing time; the signature covers the DER `SET OF`
//! encoding of those attributes.

use ring::digest;
use ring::signature::{self, UnparsedPublicKey, VerificationAlgorithm};
use x509_parser::der_parser::asn1_rs::{Header, Length, Tag, ToDer, UtcTime};
use x509_parser::der_parser::ber::{BerObject, BerObjectContent, Class};
use x509_parser::der_parser::der::parse_der;
use x509_parser::der_parser::error::BerError;
use x509_parser::der_parser::nom;
use x509_parser::extensions::ParsedExtension;
use x509_parser::prelude::*;

/// DER-encoded object identifier contents.
pub(crate) mod oid {
    pub const SIGNED_DATA: &[u8] = &[0x2A, 0x86, 0x48, 0x86, 0xF7, 0x0D, 0x01, 0x07, 0x02];
    pub const DATA: &[u8] = &[0x2A, 0x86, 0x48, 0x86, 0xF7, 0x0D, 0x01, 0x07, 0x01];
    pub const CONTENT_TYPE: &[u8] = &[0x2A, 0x86, 0x48, 0x86, 0xF7, 0x0D, 0x01, 0x09, 0x03];
    pub const MESSAGE_DIGEST: &[u8] = &[0x2A, 0x86, 0x48, 0x86, 0xF7, 0x0D, 0x01, 0x09, 0x04];
    pub const SIGNING_TIME: &[u8] = &[0x2A, 0x86, 0x48, 0x86, 0xF7, 0x0D, 0x01, 0x09, 0x05];

    pub const SHA1: &[u8] = &[0x2B, 0x0E, 0x03, 0x02, 0x1A];
    pub const SHA256: &[u8] = &[0x60, 0x86, 0x48, 0x01, 0x65, 0x03, 0x04, 0x02, 0x01];
    pub const SHA384: &[u8] = &[0x60, 0x86, 0x48, 0x01, 0x65, 0x03, 0x04, 0x02, 0x02];
    pub const SHA512: &[u8] = &[0x60, 0x86, 0x48, 0x01, 0x65, 0x03, 0x04, 0x02, 0x03];

    pub const RSA_ENCRYPTION: &[u8] = &[0x2A, 0x86, 0x48, 0x86, 0xF7, 0x0D, 0x01, 0x01, 0x01];
    pub const SHA1_WITH_RSA: &[u8] = &[0x2A, 0x86, 0x48, 0x86, 0xF7, 0x0D, 0x01, 0x01, 0x05];
    pub const SHA256_WITH_RSA: &[u8] = &[0x2A, 0x86, 0x48, 0x86, 0xF7, 0x0D, 0x01, 0x01, 0x0B];
    pub const SHA384_WITH_RSA: &[u8] = &[0x2A, 0x86, 0x48, 0x86, 0xF7, 0x0D, 0x01, 0x01, 0x0C];
    pub const SHA512_WITH_RSA: &[u8] = &[0x2A, 0x86, 0x48, 0x86, 0xF7, 0x0D, 0x01, 0x01, 0x0D];

    pub const EC_PUBLIC_KEY: &[u8] = &[0x2A, 0x86, 0x48, 0xCE, 0x3D, 0x02, 0x01];
    pub const ECDSA_SHA256: &[u8] = &[0x2A, 0x86, 0x48, 0xCE, 0x3D, 0x04, 0x03, 0x02];
    pub const ECDSA_SHA384: &[u8] = &[0x2A, 0x86, 0x48, 0xCE, 0x3D, 0x04, 0x03, 0x03];
    pub const P256: &[u8] = &[0x2A, 0x86, 0x48, 0xCE, 0x3D, 0x03, 0x01, 0x07];
    pub const P384: &[u8] = &[0x2B, 0x81, 0x04, 0x00, 0x22];
}

#[derive(Debug, thiserror::Error)]
pub enum CmsError {
    #[error("malformed CMS structure: {0}")]
    Malformed(String),

    #[error("unsupported algorithm: {0}")]
    UnsupportedAlgorithm(String),

    #[error("signer certificate not found in message")]
    MissingSigner,

    #[error("message digest does not match the body")]
    DigestMismatch,

    #[error("signature verification failed")]
    BadSignature,
}

impl From<BerError> for CmsError {
    fn from(e: BerError) -> Self {
        Self::Malformed(e.to_string())
    }
}

impl From<nom::Err<BerError>> for CmsError {
    fn from(e: nom::Err<BerError>) -> Self {
        Self::Malformed(e.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DigestAlgorithm {
    Sha1,
    Sha256,
    Sha384,
    Sha512,
}

impl DigestAlgorithm {
    fn from_oid(bytes: &[u8]) -> Option<Self> {
        match bytes {
            oid::SHA1 => Some(Self::Sha1),
            oid::SHA256 => Some(Self::Sha256),
            oid::SHA384 => Some(Self::Sha384),
            oid::SHA512 => Some(Self::Sha512),
            _ => None,
        }
    }

    pub fn digest(self, data: &[u8]) -> Vec<u8> {
        let alg = match self {
            Self::Sha1 => &digest::SHA1_FOR_LEGACY_USE_ONLY,
            Self::Sha256 => &digest::SHA256,
            Self::Sha384 => &digest::SHA384,
            Self::Sha512 => &digest::SHA512,
        };
        digest::digest(alg, data).as_ref().to_vec()
    }
}

/// Outcome of a successful verification.
#[derive(Debug, Clone)]
pub struct VerifiedSignature {
    /// DER of the certificate whose key produced the signature.
    pub signer_der: Vec<u8>,
    /// `signingTime` attribute as a Unix timestamp, if present.
    pub signing_time: Option<i64>,
    pub digest_algorithm: DigestAlgorithm,
}

enum SignerId<'a> {
    IssuerSerial {
        issuer: BerObject<'a>,
        serial: &'a [u8],
    },
    KeyId(&'a [u8]),
}

struct SignerInfo<'a> {
    sid: SignerId<'a>,
    digest_oid: Vec<u8>,
    /// Content of the `[0] IMPLICIT` signed attributes.
    signed_attrs: Option<&'a [u8]>,
    signature_oid: Vec<u8>,
    signature: &'a [u8],
}

struct SignedData<'a> {
    certificates: Vec<&'a [u8]>,
    signers: Vec<SignerInfo<'a>>,
}

/// Verify a detached CMS signature over `body`.
///
/// Checks the message digest, the signature and returns the signer
/// certificate. Trust in that certificate is the caller's business.
pub fn verify_detached(cms_der: &[u8], body: &[u8]) -> Result<VerifiedSignature, CmsError> {
    let signed_data = parse_content_info(cms_der)?;
    let signer = signed_data
        .signers
        .first()
        .ok_or_else(|| CmsError::Malformed("no signer infos".into()))?;

    let digest_algorithm = DigestAlgorithm::from_oid(&signer.digest_oid)
        .ok_or_else(|| CmsError::UnsupportedAlgorithm("digest".into()))?;

    let signer_der = find_signer_certificate(&signed_data.certificates, &signer.sid)?;
    let (_, signer_cert) = X509Certificate::from_der(signer_der)
        .map_err(|e| CmsError::Malformed(format!("signer certificate: {e}")))?;

    let (message, signing_time) = match signer.signed_attrs {
        Some(attrs) => {
            let parsed = parse_signed_attributes(attrs)?;
            let expected = digest_algorithm.digest(body);
            if parsed.message_digest != expected.as_slice() {
                return Err(CmsError::DigestMismatch);
            }
            // The signature covers the attributes re-tagged as a SET OF.
            let mut encoded =
                Header::new(Class::Universal, true, Tag::Set, Length::Definite(attrs.len()))
                    .to_der_vec()
                    .map_err(|e| CmsError::Malformed(e.to_string()))?;
            encoded.extend_from_slice(attrs);
            (encoded, parsed.signing_time)
        }
        None => (body.to_vec(), None),
    };

    let algorithm = verification_algorithm(
        &signer.signature_oid,
        digest_algorithm,
        signer_cert.public_key(),
    )?;
    UnparsedPublicKey::new(
        algorithm,
        signer_cert.public_key().subject_public_key.data.as_ref(),
    )
    .verify(&message, signer.signature)
    .map_err(|_| CmsError::BadSignature)?;

    Ok(VerifiedSignature {
        signer_der: signer_der.to_vec(),
        signing_time,
        digest_algorithm,
    })
}

/// Content bytes of a context-specific `[n]` element.
fn context_content<'a>(object: &BerObject<'a>, n: u32) -> Option<&'a [u8]> {
    if object.class() != Class::ContextSpecific || object.tag() != Tag(n) {
        return None;
    }
    object.as_slice().ok()
}

/// Parse the concatenated DER elements of an implicitly tagged `SET OF`.
fn der_elements(mut input: &[u8]) -> Result<Vec<BerObject<'_>>, CmsError> {
    let mut elements = Vec::new();
    while !input.is_empty() {
        let (rem, object) = parse_der(input)?;
        elements.push(object);
        input = rem;
    }
    Ok(elements)
}

fn oid_bytes(object: &BerObject<'_>) -> Result<Vec<u8>, CmsError> {
    Ok(object.as_oid()?.as_bytes().to_vec())
}

/// `AlgorithmIdentifier` OID.
fn algorithm_oid(object: &BerObject<'_>) -> Result<Vec<u8>, CmsError> {
    let fields = object.as_sequence()?;
    let algorithm = fields
        .first()
        .ok_or_else(|| CmsError::Malformed("empty AlgorithmIdentifier".into()))?;
    oid_bytes(algorithm)
}

fn parse_content_info(der: &[u8]) -> Result<SignedData<'_>, CmsError> {
    let (_, content_info) = parse_der(der)?;
    let [content_type, content, ..] = content_info.as_sequence()?.as_slice() else {
        return Err(CmsError::Malformed("truncated ContentInfo".into()));
    };
    if oid_bytes(content_type)? != oid::SIGNED_DATA {
        return Err(CmsError::Malformed("content type is not signedData".into()));
    }
    let explicit = context_content(content, 0)
        .ok_or_else(|| CmsError::Malformed("missing [0] content".into()))?;
    let (_, signed_data) = parse_der(explicit)?;
    parse_signed_data(&signed_data)
}

fn parse_signed_data<'a>(signed_data: &BerObject<'a>) -> Result<SignedData<'a>, CmsError> {
    let fields = signed_data.as_sequence()?;
    let [_version, _digest_algorithms, encap, rest @ ..] = fields.as_slice() else {
        return Err(CmsError::Malformed("truncated SignedData".into()));
    };

    let encap_type = encap
        .as_sequence()?
        .first()
        .ok_or_else(|| CmsError::Malformed("empty encapsulated content".into()))?;
    if oid_bytes(encap_type)? != oid::DATA {
        return Err(CmsError::Malformed("encapsulated content is not data".into()));
    }

    let (signer_set, optional) = rest
        .split_last()
        .ok_or_else(|| CmsError::Malformed("missing signer infos".into()))?;

    let mut certificates = Vec::new();
    if let Some(mut certs) = optional.iter().find_map(|field| context_content(field, 0)) {
        while !certs.is_empty() {
            let (rem, _) = X509Certificate::from_der(certs)
                .map_err(|e| CmsError::Malformed(format!("embedded certificate: {e}")))?;
            certificates.push(&certs[..certs.len() - rem.len()]);
            certs = rem;
        }
    }

    let signers: Vec<SignerInfo<'a>> = signer_set
        .as_set()?
        .iter()
        .map(parse_signer_info)
        .collect::<Result<_, _>>()?;

    Ok(SignedData {
        certificates,
        signers,
    })
}

fn parse_signer_info<'a>(info: &BerObject<'a>) -> Result<SignerInfo<'a>, CmsError> {
    let fields = info.as_sequence()?;
    let [_version, sid, digest, rest @ ..] = fields.as_slice() else {
        return Err(CmsError::Malformed("truncated SignerInfo".into()));
    };

    let sid = match sid.class() {
        Class::Universal => {
            let [issuer, serial] = sid.as_sequence()?.as_slice() else {
                return Err(CmsError::Malformed("bad IssuerAndSerialNumber".into()));
            };
            SignerId::IssuerSerial {
                issuer: issuer.clone(),
                serial: serial.as_slice()?,
            }
        }
        _ => SignerId::KeyId(context_content(sid, 0).ok_or_else(|| {
            CmsError::Malformed(format!("unexpected signer identifier tag {:?}", sid.tag()))
        })?),
    };

    let (signed_attrs, rest) = match rest.split_first() {
        Some((first, tail)) if first.class() == Class::ContextSpecific => {
            (context_content(first, 0), tail)
        }
        _ => (None, rest),
    };
    let [signature_algorithm, signature, ..] = rest else {
        return Err(CmsError::Malformed("missing signature".into()));
    };

    Ok(SignerInfo {
        sid,
        digest_oid: algorithm_oid(digest)?,
        signed_attrs,
        signature_oid: algorithm_oid(signature_algorithm)?,
        signature: signature.as_slice()?,
    })
}

struct SignedAttributes<'a> {
    message_digest: &'a [u8],
    signing_time: Option<i64>,
}

fn parse_signed_attributes(attrs: &[u8]) -> Result<SignedAttributes<'_>, CmsError> {
    let mut message_digest = None;
    let mut signing_time = None;

    for attr in der_elements(attrs)? {
        let [attr_type, values] = attr.as_sequence()?.as_slice() else {
            return Err(CmsError::Malformed("bad Attribute".into()));
        };
        let value = values
            .as_set()?
            .first()
            .ok_or_else(|| CmsError::Malformed("attribute without value".into()))?;
        match oid_bytes(attr_type)?.as_slice() {
            oid::MESSAGE_DIGEST => message_digest = Some(value.as_slice()?),
            oid::SIGNING_TIME => signing_time = Some(parse_time(value)?),
            oid::CONTENT_TYPE => {
                if oid_bytes(value)? != oid::DATA {
                    return Err(CmsError::Malformed("signed content type is not data".into()));
                }
            }
            _ => {}
        }
    }

    Ok(SignedAttributes {
        message_digest: message_digest
            .ok_or_else(|| CmsError::Malformed("missing messageDigest attribute".into()))?,
        signing_time,
    })
}

fn parse_time(value: &BerObject<'_>) -> Result<i64, CmsError> {
    let datetime = match &value.content {
        BerObjectContent::UTCTime(dt) => UtcTime::new(dt.clone()).utc_adjusted_datetime(),
        BerObjectContent::GeneralizedTime(dt) => dt.to_datetime(),
        _ => {
            return Err(CmsError::Malformed(format!(
                "unexpected signingTime tag {:?}",
                value.tag()
            )));
        }
    };
    datetime
        .map(|t| t.unix_timestamp())
        .map_err(|e| CmsError::Malformed(format!("signingTime: {e}")))
}

fn find_signer_certificate<'a>(
    certificates: &[&'a [u8]],
    sid: &SignerId<'_>,
) -> Result<&'a [u8], CmsError> {
    certificates
        .iter()
        .copied()
        .find(|der| {
            X509Certificate::from_der(der).is_ok_and(|(_, cert)| match sid {
                SignerId::IssuerSerial { issuer, serial } => {
                    trim_integer(cert.raw_serial()) == trim_integer(serial)
                        && parse_der(cert.issuer().as_raw()).is_ok_and(|(_, name)| name == *issuer)
                }
                SignerId::KeyId(key_id) => cert.extensions().iter().any(|ext| {
                    matches!(
                        ext.parsed_extension(),
                        ParsedExtension::SubjectKeyIdentifier(kid) if kid.0 == *key_id
                    )
                }),
            })
        })
        .ok_or(CmsError::MissingSigner)
}

fn trim_integer(bytes: &[u8]) -> &[u8] {
    let start = bytes
        .iter()
        .position(|b| *b != 0)
        .unwrap_or(bytes.len());
    &bytes[start..]
}

fn verification_algorithm(
    signature_oid: &[u8],
    digest_algorithm: DigestAlgorithm,
    spki: &SubjectPublicKeyInfo<'_>,
) -> Result<&'static dyn VerificationAlgorithm, CmsError> {
    let key_oid = spki.algorithm.algorithm.as_bytes();
    if key_oid == oid::RSA_ENCRYPTION {
        let digest = match signature_oid {
            oid::RSA_ENCRYPTION => digest_algorithm,
            oid::SHA1_WITH_RSA => DigestAlgorithm::Sha1,
            oid::SHA256_WITH_RSA => DigestAlgorithm::Sha256,
            oid::SHA384_WITH_RSA => DigestAlgorithm::Sha384,
            oid::SHA512_WITH_RSA => DigestAlgorithm::Sha512,
            _ => return Err(CmsError::UnsupportedAlgorithm("RSA signature".into())),
        };
        return Ok(match digest {
            DigestAlgorithm::Sha1 => &signature::RSA_PKCS1_2048_8192_SHA1_FOR_LEGACY_USE_ONLY,
            DigestAlgorithm::Sha256 => &signature::RSA_PKCS1_2048_8192_SHA256,
            DigestAlgorithm::Sha384 => &signature::RSA_PKCS1_2048_8192_SHA384,
            DigestAlgorithm::Sha512 => &signature::RSA_PKCS1_2048_8192_SHA512,
        });
    }

    if key_oid == oid::EC_PUBLIC_KEY {
        let curve = spki
            .algorithm
            .parameters
            .as_ref()
            .and_then(|p| p.as_oid().ok())
            .ok_or_else(|| CmsError::UnsupportedAlgorithm("EC key without curve".into()))?;
        let digest = match signature_oid {
            oid::EC_PUBLIC_KEY => digest_algorithm,
            oid::ECDSA_SHA256 => DigestAlgorithm::Sha256,
            oid::ECDSA_SHA384 => DigestAlgorithm::Sha384,
            _ => return Err(CmsError::UnsupportedAlgorithm("ECDSA signature".into())),
        };
        return match (curve.as_bytes(), digest) {
            (oid::P256, DigestAlgorithm::Sha256) => Ok(&signature::ECDSA_P256_SHA256_ASN1),
            (oid::P256, DigestAlgorithm::Sha384) => Ok(&signature::ECDSA_P256_SHA384_ASN1),
            (oid::P384, DigestAlgorithm::Sha256) => Ok(&signature::ECDSA_P384_SHA256_ASN1),
            (oid::P384, DigestAlgorithm::Sha384) => Ok(&signature::ECDSA_P384_SHA384_ASN1),
            _ => Err(CmsError::UnsupportedAlgorithm("EC curve/digest".into())),
        };
    }

    Err(CmsError::UnsupportedAlgorithm("public key type".into()))
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::certs::{generate_device_cert, generate_root_ca};
    use crate::testing::{SignOptions, sign_detached, sign_detached_with};

    const BODY: &[u8] = b"<?xml version=\"1.0\"?><plist><dict/></plist>";

    #[test]
    fn verifies_signature_and_returns_signer() {
        let ca = generate_root_ca("CMS").unwrap();
        let device = generate_device_cert(&ca, "UDID-1").unwrap();
        let cms = sign_detached(BODY, &device, 1_700_000_000).unwrap();

        let verified = verify_detached(&cms, BODY).unwrap();
        assert_eq!(verified.signer_der, device.cert_der);
        assert_eq!(verified.signing_time, Some(1_700_000_000));
        assert_eq!(verified.digest_algorithm, DigestAlgorithm::Sha256);
    }

    #[test]
    fn rejects_modified_body() {
        let ca = generate_root_ca("CMS").unwrap();
        let device = generate_device_cert(&ca, "UDID-1").unwrap();
        let cms = sign_detached(BODY, &device, 1_700_000_000).unwrap();

        let err = verify_detached(&cms, b"<plist>tampered</plist>").unwrap_err();
        assert!(matches!(err, CmsError::DigestMismatch));
    }

    #[test]
    fn rejects_signature_from_other_key() {
        let ca = generate_root_ca("CMS").unwrap();
        let device = generate_device_cert(&ca, "UDID-1").unwrap();
        let other = generate_device_cert(&ca, "UDID-2").unwrap();
        let cms = sign_detached_with(
            BODY,
            &device,
            &SignOptions {
                signing_time: Some(1_700_000_000),
                signing_key: Some(other.key_der.as_slice()),
            },
        )
        .unwrap();

        let err = verify_detached(&cms, BODY).unwrap_err();
        assert!(matches!(err, CmsError::BadSignature));
    }

    #[test]
    fn signing_time_is_optional() {
        let ca = generate_root_ca("CMS").unwrap();
        let device = generate_device_cert(&ca, "UDID-1").unwrap();
        let cms = sign_detached_with(BODY, &device, &SignOptions::default()).unwrap();

        let verified = verify_detached(&cms, BODY).unwrap();
        assert_eq!(verified.signing_time, None);
    }

    #[test]
    fn rejects_garbage() {
        assert!(matches!(
            verify_detached(b"\x30\x03\x02\x01\x01", BODY),
            Err(CmsError::Malformed(_))
        ));
        assert!(matches!(
            verify_detached(b"", BODY),
            Err(CmsError::Malformed(_))
        ));
    }

    #[test]
    fn parses_utc_and_generalized_time() {
        let (_, generalized) = parse_der(b"\x18\x0f20240102030405Z").unwrap();
        assert_eq!(parse_time(&generalized).unwrap(), 1_704_164_645);

        let (_, utc) = parse_der(b"\x17\x0d240102030405Z").unwrap();
        assert_eq!(parse_time(&utc).unwrap(), 1_704_164_645);

        let (_, octets) = parse_der(b"\x04\x01\x00").unwrap();
        assert!(matches!(parse_time(&octets), Err(CmsError::Malformed(_))));
    }
}
