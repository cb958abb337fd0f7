//! Operator API: sync jobs, commands, push and push certificates.

use axum::extract::{FromRequestParts, Path, State};
use axum::http::StatusCode;
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;
use axum::routing::{get, post, put};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tracing::info;

use super::error::ApiError;
use super::state::AppState;
use crate::auth::OperatorClaims;
use crate::auth::operator::permission;
use crate::credentials::PushCertificateView;
use crate::protocol::command_from_json;
use crate::storage::{Command, SyncJobKind};
use crate::sync::SyncJobView;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/sync/directory/{server_id}", post(sync_directory))
        .route("/sync/catalog", post(sync_catalog))
        .route("/tasks/{task_id}", get(task_result))
        .route(
            "/devices/{udid}/commands",
            post(add_command).get(list_commands),
        )
        .route("/devices/{udid}/notify", post(notify_device))
        .route("/push_certificates", get(list_push_certificates))
        .route(
            "/push_certificates/{name}",
            put(load_push_certificate).delete(revoke_push_certificate),
        )
}

/// An operator authenticated by bearer token.
pub struct Operator(pub OperatorClaims);

impl Operator {
    fn require(&self, permission: &'static str) -> Result<(), ApiError> {
        if self.0.has_permission(permission) {
            Ok(())
        } else {
            Err(ApiError::Forbidden(permission))
        }
    }
}

impl FromRequestParts<AppState> for Operator {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let token = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .ok_or_else(|| ApiError::Unauthorized("missing bearer token".into()))?;

        let claims = state
            .jwt
            .validate(token)
            .map_err(|e| ApiError::Unauthorized(e.to_string()))?;
        Ok(Self(claims))
    }
}

#[derive(Debug, Serialize)]
struct TaskAccepted {
    task_id: String,
    task_result_url: String,
}

#[derive(Debug, Deserialize)]
struct NewCommandRequest {
    request_type: String,
    #[serde(default)]
    payload: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct LoadPushCertificateRequest {
    certificate: String,
    private_key: String,
    passphrase: Option<String>,
    /// Allow a topic change; devices on the old topic lose push.
    #[serde(default)]
    replace: bool,
}

async fn trigger(
    state: &AppState,
    kind: SyncJobKind,
    target: &str,
) -> Result<(StatusCode, Json<TaskAccepted>), ApiError> {
    let job = state.sync.trigger(kind, target).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(TaskAccepted {
            task_result_url: state.task_result_url(&job.id),
            task_id: job.id,
        }),
    ))
}

async fn sync_directory(
    State(state): State<AppState>,
    operator: Operator,
    Path(server_id): Path<String>,
) -> Result<(StatusCode, Json<TaskAccepted>), ApiError> {
    operator.require(permission::SYNC_DIRECTORY)?;
    trigger(&state, SyncJobKind::DirectorySync, &server_id).await
}

async fn sync_catalog(
    State(state): State<AppState>,
    operator: Operator,
) -> Result<(StatusCode, Json<TaskAccepted>), ApiError> {
    operator.require(permission::SYNC_CATALOG)?;
    let target = state.catalog_name.clone();
    trigger(&state, SyncJobKind::CatalogSync, &target).await
}

async fn task_result(
    State(state): State<AppState>,
    operator: Operator,
    Path(task_id): Path<String>,
) -> Result<Json<SyncJobView>, ApiError> {
    operator.require(permission::VIEW_TASKS)?;
    let job = state.sync.poll_result(&task_id).await?;
    Ok(Json(job.into()))
}

async fn add_command(
    State(state): State<AppState>,
    operator: Operator,
    Path(udid): Path<String>,
    Json(request): Json<NewCommandRequest>,
) -> Result<(StatusCode, Json<Command>), ApiError> {
    operator.require(permission::ADD_COMMAND)?;

    let payload = command_from_json(&request.request_type, &request.payload)?;
    let command = state
        .queue
        .enqueue(&udid, &request.request_type, &payload)
        .await?;
    info!(
        udid = %udid,
        operator = %operator.0.sub,
        request_type = %command.request_type,
        "Command added"
    );

    state.push.notify_in_background(udid);
    Ok((StatusCode::CREATED, Json(command)))
}

async fn list_commands(
    State(state): State<AppState>,
    operator: Operator,
    Path(udid): Path<String>,
) -> Result<Json<Vec<Command>>, ApiError> {
    operator.require(permission::VIEW_COMMANDS)?;
    Ok(Json(state.queue.list_for_device(&udid).await?))
}

async fn notify_device(
    State(state): State<AppState>,
    operator: Operator,
    Path(udid): Path<String>,
) -> Result<StatusCode, ApiError> {
    operator.require(permission::SEND_NOTIFICATION)?;
    state.push.notify(&udid).await?;
    Ok(StatusCode::ACCEPTED)
}

async fn list_push_certificates(
    State(state): State<AppState>,
    operator: Operator,
) -> Result<Json<Vec<PushCertificateView>>, ApiError> {
    operator.require(permission::VIEW_PUSH_CERTIFICATES)?;
    Ok(Json(state.credentials.list_push_certificates().await?))
}

async fn load_push_certificate(
    State(state): State<AppState>,
    operator: Operator,
    Path(name): Path<String>,
    Json(request): Json<LoadPushCertificateRequest>,
) -> Result<Json<PushCertificateView>, ApiError> {
    operator.require(permission::CHANGE_PUSH_CERTIFICATE)?;
    let view = state
        .credentials
        .load_push_certificate(
            &name,
            &request.certificate,
            &request.private_key,
            request.passphrase.as_deref(),
            request.replace,
        )
        .await?;
    Ok(Json(view))
}

async fn revoke_push_certificate(
    State(state): State<AppState>,
    operator: Operator,
    Path(name): Path<String>,
) -> Result<StatusCode, ApiError> {
    operator.require(permission::CHANGE_PUSH_CERTIFICATE)?;
    state.credentials.revoke_push_certificate(&name).await?;
    Ok(StatusCode::NO_CONTENT)
}
