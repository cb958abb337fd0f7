//! mdmgate certificate library
//!
//! - **Trust chains**: CA bundles that issue device identity certificates
//! - **Push certificates**: topic extraction and key pair checks for APNs
//! - **CMS**: detached `SignedData` verification for signed device messages
//! - **certs** (feature): rcgen-based CA, device and push certificates

#[cfg(any(test, feature = "certs"))]
pub mod certs;
pub mod chain;
pub mod cms;
pub mod encoding;
pub mod push_cert;
#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

pub use chain::{ChainError, TrustChain, VerifiedCertificate};
pub use cms::{CmsError, VerifiedSignature, verify_detached};
pub use encoding::fingerprint;
pub use push_cert::{PushCertError, PushCertificateMaterial, parse_push_certificate};
