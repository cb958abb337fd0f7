//! Credential store: device trust chain and APNs push certificates.

mod monitor;
mod store;

pub use monitor::{check_push_certificates, spawn_push_cert_monitor};
pub use store::{CredentialError, CredentialStore, PushCertificateStatus, PushCertificateView};
