//! Device endpoints: check-in and command delivery.

use axum::body::Bytes;
use axum::extract::State;
use axum::http::header::CONTENT_TYPE;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::put;
use axum::Router;
use tracing::{info, instrument};

use super::error::ApiError;
use super::state::AppState;
use crate::auth::{DeviceIdentity, DeviceRequest};
use crate::protocol::{
    CheckinMessage, ConnectReport, ConnectStatus, PLIST_CONTENT_TYPE, command_envelope,
};
use crate::queue::ResultStatus;
use crate::storage::EnrollDeviceParams;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/mdm/checkin", put(checkin))
        .route("/mdm/connect", put(connect))
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

async fn authenticate(
    state: &AppState,
    headers: &HeaderMap,
    udid: &str,
    enrolling: bool,
    body: &[u8],
) -> Result<DeviceIdentity, ApiError> {
    let request = DeviceRequest {
        udid,
        enrolling,
        body,
        client_cert: header(headers, &state.auth.client_cert_header),
        subject_dn: header(headers, &state.auth.client_subject_dn_header),
        signature: header(headers, &state.auth.signature_header),
    };
    Ok(state.authenticator.authenticate(&request).await?)
}

fn empty() -> Response {
    StatusCode::OK.into_response()
}

fn plist(body: Vec<u8>) -> Response {
    ([(CONTENT_TYPE, PLIST_CONTENT_TYPE)], body).into_response()
}

/// `PUT /mdm/checkin`
#[instrument(skip_all)]
async fn checkin(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let message = CheckinMessage::parse(&body)?;
    let identity = authenticate(
        &state,
        &headers,
        message.udid(),
        message.is_authenticate(),
        &body,
    )
    .await?;

    match message {
        CheckinMessage::Authenticate {
            udid,
            topic,
            serial_number,
        } => {
            state
                .db
                .enroll_device(&EnrollDeviceParams {
                    udid: &udid,
                    serial_number: serial_number.as_deref(),
                    cert_fingerprint: &identity.fingerprint,
                    subject_dn: &identity.subject_dn,
                    topic: &topic,
                })
                .await?;
            info!(udid = %udid, topic = %topic, "Device enrolling");
        }
        CheckinMessage::TokenUpdate {
            udid,
            topic,
            token,
            push_magic,
        } => {
            state
                .db
                .update_push_token(&udid, &hex::encode(&token), &push_magic, topic.as_deref())
                .await?;
            info!(udid = %udid, "Push token updated");
        }
        CheckinMessage::CheckOut { udid } => {
            state.db.mark_device_unenrolled(&udid).await?;
            info!(udid = %udid, "Device checked out");
        }
    }

    Ok(empty())
}

/// `PUT /mdm/connect`
#[instrument(skip_all)]
async fn connect(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let report = ConnectReport::parse(&body)?;
    let identity = authenticate(&state, &headers, &report.udid, false, &body).await?;
    let udid = identity.udid.as_str();
    state.db.touch_device(udid).await?;

    let result = match report.status {
        ConnectStatus::Idle => None,
        ConnectStatus::Acknowledged => Some(ResultStatus::Acknowledged),
        ConnectStatus::Error => Some(ResultStatus::Error),
        ConnectStatus::CommandFormatError => Some(ResultStatus::CommandFormatError),
        ConnectStatus::NotNow => {
            if let Some(uuid) = &report.command_uuid {
                let ordinal = state.queue.ordinal_for_uuid(udid, uuid).await?;
                state.queue.defer(udid, ordinal).await?;
            }
            return Ok(empty());
        }
    };

    if let (Some(result), Some(uuid)) = (result, &report.command_uuid) {
        let ordinal = state.queue.ordinal_for_uuid(udid, uuid).await?;
        state
            .queue
            .acknowledge(udid, ordinal, result, Some(&body))
            .await?;
    }

    match state.queue.next_for_device(udid).await? {
        Some(command) => Ok(plist(command_envelope(&command.uuid, &command.payload)?)),
        None => Ok(empty()),
    }
}
