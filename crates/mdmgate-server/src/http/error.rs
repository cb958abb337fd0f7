use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use tracing::error;

use crate::auth::AuthError;
use crate::credentials::CredentialError;
use crate::protocol::ProtocolError;
use crate::push::PushError;
use crate::queue::QueueError;
use crate::storage::DatabaseError;
use crate::sync::SyncError;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("missing permission {0}")]
    Forbidden(&'static str),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("service unavailable: {0}")]
    Unavailable(String),

    #[error("upstream error: {0}")]
    BadGateway(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::BadGateway(_) => StatusCode::BAD_GATEWAY,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let message = if let Self::Internal(detail) = &self {
            error!(error = %detail, "Request failed");
            "internal error".to_string()
        } else {
            self.to_string()
        };

        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}

impl From<DatabaseError> for ApiError {
    fn from(e: DatabaseError) -> Self {
        match e {
            DatabaseError::NotFound(what) => Self::NotFound(what),
            DatabaseError::Conflict(what) => Self::Conflict(what),
            other => Self::Internal(other.to_string()),
        }
    }
}

impl From<AuthError> for ApiError {
    fn from(e: AuthError) -> Self {
        match e {
            AuthError::Storage(e) => e.into(),
            other => Self::Unauthorized(other.to_string()),
        }
    }
}

impl From<ProtocolError> for ApiError {
    fn from(e: ProtocolError) -> Self {
        Self::BadRequest(e.to_string())
    }
}

impl From<QueueError> for ApiError {
    fn from(e: QueueError) -> Self {
        match e {
            QueueError::UnknownDevice(_) => Self::NotFound(e.to_string()),
            QueueError::UnknownCommand(_) | QueueError::StaleAck { .. } => {
                Self::Conflict(e.to_string())
            }
            QueueError::Storage(e) => e.into(),
        }
    }
}

impl From<PushError> for ApiError {
    fn from(e: PushError) -> Self {
        match e {
            PushError::UnknownDevice(_) => Self::NotFound(e.to_string()),
            PushError::NotReachable(_) | PushError::DeviceTopicMismatch { .. } => {
                Self::Conflict(e.to_string())
            }
            PushError::NoActivePushCertificate => Self::Unavailable(e.to_string()),
            PushError::ExternalServiceError(_) => Self::BadGateway(e.to_string()),
            PushError::Storage(e) => e.into(),
        }
    }
}

impl From<SyncError> for ApiError {
    fn from(e: SyncError) -> Self {
        match e {
            SyncError::UnknownJob(_) | SyncError::UnknownTarget(_) => {
                Self::NotFound(e.to_string())
            }
            SyncError::ExternalSourceUnavailable(_) => Self::BadGateway(e.to_string()),
            SyncError::PartialFailure { .. } => Self::Internal(e.to_string()),
            SyncError::Storage(e) => e.into(),
        }
    }
}

impl From<CredentialError> for ApiError {
    fn from(e: CredentialError) -> Self {
        match e {
            CredentialError::TopicChanged { .. } | CredentialError::TopicInUse { .. } => {
                Self::Conflict(e.to_string())
            }
            CredentialError::NotFound(_) => Self::NotFound(e.to_string()),
            CredentialError::Io { .. } => Self::Internal(e.to_string()),
            CredentialError::Storage(e) => e.into(),
            other => Self::BadRequest(other.to_string()),
        }
    }
}
