//! Update Routes
//!
//! Active updates, direct applies, confirmation, rollback and backups.

use crate::backup::ConfigBackup;
use crate::engine::ConfigUpdate;
use crate::error::{validation_error, AppError};
use crate::models::SuccessResponse;
use crate::proposal::ChangeSetInput;
use crate::routes::proposals::DecisionRequest;
use crate::state::SharedState;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

// =============================================================================
// REQUEST/RESPONSE TYPES
// =============================================================================

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct DirectUpdateRequest {
    #[validate(length(min = 1, max = 255))]
    pub target_resource: String,
    /// Typed ops, or the legacy `{"a.b": value}` map
    pub changes: ChangeSetInput,
    #[validate(range(min = 1, max = 10_080))]
    pub rollback_timeout_minutes: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct UpdatesQuery {
    pub limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct BackupQuery {
    pub resource: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateListResponse {
    pub active: Vec<ConfigUpdate>,
    pub recent: Vec<ConfigUpdate>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateResponse {
    pub update: ConfigUpdate,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupListResponse {
    pub backups: Vec<ConfigBackup>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupResponse {
    pub backup: ConfigBackup,
}

// =============================================================================
// UPDATES
// =============================================================================

/// Active updates plus recently finished ones
pub async fn list_updates(
    State(state): State<SharedState>,
    Query(query): Query<UpdatesQuery>,
) -> Result<Json<SuccessResponse<UpdateListResponse>>, AppError> {
    let active = state.controller.active_updates().await;
    let recent = state
        .controller
        .finished_updates(query.limit.unwrap_or(20).min(1000))
        .await;
    Ok(Json(SuccessResponse::with_data(
        format!("{} active updates", active.len()),
        UpdateListResponse { active, recent },
    )))
}

/// Apply a change set directly, bypassing the approval gate
pub async fn apply_update(
    State(state): State<SharedState>,
    Json(payload): Json<DirectUpdateRequest>,
) -> Result<(StatusCode, Json<SuccessResponse<UpdateResponse>>), AppError> {
    payload.validate().map_err(|e| validation_error(e.to_string()))?;
    let ops = payload.changes.into_ops()?;

    let update = state
        .controller
        .apply_direct(payload.target_resource, ops, payload.rollback_timeout_minutes)
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(SuccessResponse::with_data(
            format!("Update applied to {}", update.target_resource),
            UpdateResponse { update },
        )),
    ))
}

/// Mark an applied update healthy
pub async fn confirm_update(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
) -> Result<Json<SuccessResponse<UpdateResponse>>, AppError> {
    let update = state.controller.confirm(id).await?;
    Ok(Json(SuccessResponse::with_data("Update confirmed", UpdateResponse { update })))
}

/// Restore the backup taken before an update
pub async fn rollback_update(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
    payload: Option<Json<DecisionRequest>>,
) -> Result<Json<SuccessResponse<UpdateResponse>>, AppError> {
    let reason = DecisionRequest::reason(payload)?.unwrap_or_else(|| "manual".to_string());
    let update = state.controller.rollback(id, &reason).await?;
    Ok(Json(SuccessResponse::with_data(
        format!("Update rolled back, {} restored", update.target_resource),
        UpdateResponse { update },
    )))
}

// =============================================================================
// BACKUPS
// =============================================================================

/// Backup history, newest first
pub async fn list_backups(
    State(state): State<SharedState>,
    Query(query): Query<BackupQuery>,
) -> Result<Json<SuccessResponse<BackupListResponse>>, AppError> {
    let backups = state.controller.backups(query.resource.as_deref()).await;
    Ok(Json(SuccessResponse::with_data(
        format!("Found {} backups", backups.len()),
        BackupListResponse { backups },
    )))
}

/// Metadata of a single backup
pub async fn get_backup(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<Json<SuccessResponse<BackupResponse>>, AppError> {
    let backup = state.controller.backup(&id).await?;
    Ok(Json(SuccessResponse::with_data("Backup retrieved", BackupResponse { backup })))
}
