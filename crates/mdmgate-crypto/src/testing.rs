//! Builders for signed device messages, used by tests across the workspace.
//!
//! Requires the `test-utils` feature.

use chrono::DateTime;
use ring::rand::SystemRandom;
use ring::signature::{ECDSA_P256_SHA256_ASN1_SIGNING, EcdsaKeyPair};
use sha2::{Digest, Sha256};
use x509_parser::prelude::*;

use crate::certs::{CertBundle, CertError};
use crate::cms::oid;

mod tag {
    pub const INTEGER: u8 = 0x02;
    pub const OCTET_STRING: u8 = 0x04;
    pub const OID: u8 = 0x06;
    pub const UTC_TIME: u8 = 0x17;
    pub const SEQUENCE: u8 = 0x30;
    pub const SET: u8 = 0x31;
    pub const CONTEXT_0: u8 = 0xA0;
}

/// Knobs for [`sign_detached_with`].
#[derive(Debug, Default, Clone, Copy)]
pub struct SignOptions<'a> {
    /// Unix timestamp placed in the `signingTime` attribute.
    pub signing_time: Option<i64>,
    /// PKCS#8 key used instead of the signer's own key.
    pub signing_key: Option<&'a [u8]>,
}

/// Sign `body` with the device's P-256 key, producing the DER `ContentInfo`
/// a device sends (base64) in `Mdm-Signature`.
pub fn sign_detached(
    body: &[u8],
    signer: &CertBundle,
    signing_time: i64,
) -> Result<Vec<u8>, CertError> {
    sign_detached_with(
        body,
        signer,
        &SignOptions {
            signing_time: Some(signing_time),
            signing_key: None,
        },
    )
}

pub fn sign_detached_with(
    body: &[u8],
    signer: &CertBundle,
    options: &SignOptions<'_>,
) -> Result<Vec<u8>, CertError> {
    let (_, cert) = X509Certificate::from_der(&signer.cert_der)
        .map_err(|e| CertError::Generation(e.to_string()))?;

    let mut attrs = attribute(oid::CONTENT_TYPE, &tlv(tag::OID, oid::DATA));
    if let Some(ts) = options.signing_time {
        let time = DateTime::from_timestamp(ts, 0)
            .ok_or_else(|| CertError::Generation("signing time out of range".into()))?
            .format("%y%m%d%H%M%SZ")
            .to_string();
        attrs.extend(attribute(oid::SIGNING_TIME, &tlv(tag::UTC_TIME, time.as_bytes())));
    }
    attrs.extend(attribute(
        oid::MESSAGE_DIGEST,
        &tlv(tag::OCTET_STRING, &Sha256::digest(body)),
    ));

    let rng = SystemRandom::new();
    let key_der = options.signing_key.unwrap_or(&signer.key_der);
    let key = EcdsaKeyPair::from_pkcs8(&ECDSA_P256_SHA256_ASN1_SIGNING, key_der, &rng)
        .map_err(|e| CertError::Generation(e.to_string()))?;
    let signature = key
        .sign(&rng, &tlv(tag::SET, &attrs))
        .map_err(|e| CertError::Generation(e.to_string()))?;

    let sid = seq(&[cert.issuer().as_raw(), &integer(cert.raw_serial())]);
    let signer_info = seq(&[
        &integer(&[1]),
        &sid,
        &algorithm(oid::SHA256),
        &tlv(tag::CONTEXT_0, &attrs),
        &algorithm(oid::ECDSA_SHA256),
        &tlv(tag::OCTET_STRING, signature.as_ref()),
    ]);
    let signed_data = seq(&[
        &integer(&[1]),
        &tlv(tag::SET, &algorithm(oid::SHA256)),
        &seq(&[&tlv(tag::OID, oid::DATA)]),
        &tlv(tag::CONTEXT_0, &signer.cert_der),
        &tlv(tag::SET, &signer_info),
    ]);

    Ok(seq(&[
        &tlv(tag::OID, oid::SIGNED_DATA),
        &tlv(tag::CONTEXT_0, &signed_data),
    ]))
}

fn attribute(attr_type: &[u8], value: &[u8]) -> Vec<u8> {
    seq(&[&tlv(tag::OID, attr_type), &tlv(tag::SET, value)])
}

fn algorithm(alg: &[u8]) -> Vec<u8> {
    seq(&[&tlv(tag::OID, alg)])
}

fn integer(bytes: &[u8]) -> Vec<u8> {
    if bytes.first().is_some_and(|b| b & 0x80 != 0) {
        let mut padded = vec![0];
        padded.extend_from_slice(bytes);
        tlv(tag::INTEGER, &padded)
    } else {
        tlv(tag::INTEGER, bytes)
    }
}

fn seq(parts: &[&[u8]]) -> Vec<u8> {
    tlv(tag::SEQUENCE, &parts.concat())
}

#[allow(clippy::cast_possible_truncation)]
fn tlv(tag: u8, content: &[u8]) -> Vec<u8> {
    let mut out = vec![tag];
    let len = content.len();
    if len < 0x80 {
        out.push(len as u8);
    } else {
        let bytes = len.to_be_bytes();
        let skip = bytes.iter().take_while(|b| **b == 0).count();
        out.push(0x80 | (bytes.len() - skip) as u8);
        out.extend_from_slice(&bytes[skip..]);
    }
    out.extend_from_slice(content);
    out
}
