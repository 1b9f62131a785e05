//! Operational Routes
//!
//! Audit trail and controller statistics.

use crate::audit::{AuditAction, AuditEntry};
use crate::controller::ControllerStats;
use crate::error::AppError;
use crate::models::SuccessResponse;
use crate::state::SharedState;
use axum::{
    extract::{Query, State},
    Json,
};
use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize)]
pub struct AuditQuery {
    pub limit: Option<usize>,
    pub action: Option<AuditAction>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditResponse {
    pub entries: Vec<AuditEntry>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsResponse {
    pub stats: ControllerStats,
}

/// Recent audit entries, newest first
pub async fn list_audit(
    State(state): State<SharedState>,
    Query(query): Query<AuditQuery>,
) -> Result<Json<SuccessResponse<AuditResponse>>, AppError> {
    let limit = query.limit.unwrap_or(100).min(1000);
    let entries = state.controller.audit(limit, query.action).await;
    Ok(Json(SuccessResponse::with_data(
        format!("Found {} audit entries", entries.len()),
        AuditResponse { entries },
    )))
}

pub async fn get_stats(
    State(state): State<SharedState>,
) -> Result<Json<SuccessResponse<StatsResponse>>, AppError> {
    let stats = state.controller.stats().await;
    Ok(Json(SuccessResponse::with_data("Controller statistics", StatsResponse { stats })))
}
