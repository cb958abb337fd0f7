//! Data models for mdmgate storage.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum EnrollmentState {
    Enrolling,
    Enrolled,
    Unenrolled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum CommandStatus {
    Queued,
    Sent,
    Acknowledged,
    Failed,
}

/// Stored lifecycle state of a push certificate version. The reported
/// status (active/expiring/expired/revoked) also depends on the clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum PushCertificateState {
    Active,
    Superseded,
    Revoked,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "kebab-case")]
#[serde(rename_all = "kebab-case")]
pub enum SyncJobKind {
    DirectorySync,
    CatalogSync,
}

impl SyncJobKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::DirectorySync => "directory-sync",
            Self::CatalogSync => "catalog-sync",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum SyncJobStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl SyncJobStatus {
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Device {
    pub udid: String,
    pub serial_number: Option<String>,
    pub enrollment_state: EnrollmentState,
    pub cert_fingerprint: String,
    pub subject_dn: String,
    pub topic: Option<String>,
    /// Hex-encoded APNs device token.
    pub push_token: Option<String>,
    pub push_magic: Option<String>,
    pub push_invalidated: bool,
    pub last_checkin_at: Option<i64>,
    pub enrolled_at: i64,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct PushCertificateRecord {
    pub id: i64,
    pub name: String,
    pub version: i64,
    pub topic: String,
    pub fingerprint: String,
    pub not_before: i64,
    pub not_after: i64,
    #[serde(skip)]
    pub cert_pem: String,
    #[serde(skip)]
    pub key_pem: String,
    pub state: PushCertificateState,
    pub created_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Command {
    pub id: i64,
    pub uuid: String,
    pub device_udid: String,
    pub ordinal: i64,
    pub request_type: String,
    /// XML plist of the `Command` dictionary.
    #[serde(skip)]
    pub payload: Vec<u8>,
    pub status: CommandStatus,
    pub attempts: i64,
    pub sent_at: Option<i64>,
    pub deadline_at: Option<i64>,
    pub result_status: Option<String>,
    #[serde(skip)]
    pub result_payload: Option<Vec<u8>>,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct SyncJob {
    pub id: String,
    pub kind: SyncJobKind,
    pub target: String,
    pub status: SyncJobStatus,
    /// JSON document written when the job finishes.
    pub result: Option<String>,
    pub error: Option<String>,
    pub created_at: i64,
    pub started_at: Option<i64>,
    pub finished_at: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct DirectoryDevice {
    pub serial_number: String,
    pub server_id: String,
    pub model: Option<String>,
    pub description: Option<String>,
    pub color: Option<String>,
    pub profile_status: Option<String>,
    pub op_type: Option<String>,
    pub op_date: Option<String>,
    pub deleted: bool,
    pub updated_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct CatalogPackage {
    pub source: String,
    pub name: String,
    pub version: String,
    /// JSON array of catalog names.
    pub catalogs: String,
    pub description: Option<String>,
    pub updated_at: i64,
}
