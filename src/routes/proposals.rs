//! Proposal Routes
//!
//! Signal intake, the approval queue and decision history.

use crate::approval::{HistoryEntry, RuleInfo};
use crate::controller::{DecisionOutcome, ProposalDetail, ProposeOutcome};
use crate::error::{validation_error, AppError};
use crate::models::SuccessResponse;
use crate::proposal::{ImprovementSignal, ProposalSummary};
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

/// Optional body for approve/reject/defer/rollback
#[derive(Debug, Default, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct DecisionRequest {
    #[validate(length(min = 1, max = 500))]
    #[serde(default)]
    pub reason: Option<String>,
}

impl DecisionRequest {
    pub fn reason(payload: Option<Json<DecisionRequest>>) -> Result<Option<String>, AppError> {
        let Some(Json(req)) = payload else {
            return Ok(None);
        };
        req.validate().map_err(|e| validation_error(e.to_string()))?;
        Ok(req.reason)
    }
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProposeResponse {
    #[serde(flatten)]
    pub outcome: ProposeOutcome,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingListResponse {
    pub proposals: Vec<ProposalSummary>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProposalDetailResponse {
    pub proposal: ProposalDetail,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryResponse {
    pub entries: Vec<HistoryEntry>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RulesResponse {
    pub rules: Vec<RuleInfo>,
}

// =============================================================================
// SIGNAL INTAKE
// =============================================================================

/// Submit an improvement signal
pub async fn submit_signal(
    State(state): State<SharedState>,
    Json(signal): Json<ImprovementSignal>,
) -> Result<(StatusCode, Json<SuccessResponse<ProposeResponse>>), AppError> {
    let outcome = state.controller.propose(signal).await?;

    let (status, response) = match &outcome {
        ProposeOutcome::Duplicate { dedup_hash } => {
            return Err(AppError::DuplicateProposal(format!(
                "An identical proposal is already pending or was auto-approved this hour ({})",
                dedup_hash
            )));
        }
        ProposeOutcome::NoChange => (
            StatusCode::OK,
            SuccessResponse::with_data("Signal did not warrant a change", ProposeResponse { outcome }),
        ),
        ProposeOutcome::AutoApplied { rule, .. } => {
            let message = format!("Proposal auto-approved by {} and applied", rule);
            (StatusCode::CREATED, SuccessResponse::with_data(message, ProposeResponse { outcome }))
        }
        ProposeOutcome::AutoApprovedApplyFailed { error, .. } => {
            let message = format!("Proposal auto-approved but apply failed: {}", error);
            (StatusCode::CREATED, SuccessResponse::declined(message, ProposeResponse { outcome }))
        }
        ProposeOutcome::Queued { .. } => (
            StatusCode::CREATED,
            SuccessResponse::with_data("Proposal queued for review", ProposeResponse { outcome }),
        ),
        ProposeOutcome::Dropped { reason, .. } => {
            let message = format!("Proposal dropped: {}", reason);
            (StatusCode::OK, SuccessResponse::declined(message, ProposeResponse { outcome }))
        }
    };
    Ok((status, Json(response)))
}

// =============================================================================
// APPROVAL QUEUE
// =============================================================================

/// List pending proposals
pub async fn list_pending(
    State(state): State<SharedState>,
) -> Result<Json<SuccessResponse<PendingListResponse>>, AppError> {
    let proposals = state.controller.list_pending().await;
    Ok(Json(SuccessResponse::with_data(
        format!("{} pending proposals", proposals.len()),
        PendingListResponse { proposals },
    )))
}

/// Full detail of a pending proposal
pub async fn get_proposal(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
) -> Result<Json<SuccessResponse<ProposalDetailResponse>>, AppError> {
    let proposal = state.controller.info(id).await?;
    Ok(Json(SuccessResponse::with_data(
        "Proposal retrieved",
        ProposalDetailResponse { proposal },
    )))
}

pub async fn approve_proposal(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
    payload: Option<Json<DecisionRequest>>,
) -> Result<Json<DecisionOutcome>, AppError> {
    let reason = DecisionRequest::reason(payload)?;
    Ok(Json(state.controller.approve(id, reason).await?))
}

pub async fn reject_proposal(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
    payload: Option<Json<DecisionRequest>>,
) -> Result<Json<DecisionOutcome>, AppError> {
    let reason = DecisionRequest::reason(payload)?;
    Ok(Json(state.controller.reject(id, reason).await?))
}

pub async fn defer_proposal(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
    payload: Option<Json<DecisionRequest>>,
) -> Result<Json<DecisionOutcome>, AppError> {
    let reason = DecisionRequest::reason(payload)?;
    Ok(Json(state.controller.defer(id, reason).await?))
}

// =============================================================================
// HISTORY & RULES
// =============================================================================

/// Decision history, newest first
pub async fn list_history(
    State(state): State<SharedState>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<SuccessResponse<HistoryResponse>>, AppError> {
    let limit = query.limit.unwrap_or(50).min(1000);
    let entries = state.controller.history(limit).await;
    Ok(Json(SuccessResponse::with_data(
        format!("Found {} decisions", entries.len()),
        HistoryResponse { entries },
    )))
}

/// Auto-approval rules with this hour's usage
pub async fn list_rules(
    State(state): State<SharedState>,
) -> Result<Json<SuccessResponse<RulesResponse>>, AppError> {
    let rules = state.controller.rules().await;
    Ok(Json(SuccessResponse::with_data(
        format!("{} auto-approval rules", rules.len()),
        RulesResponse { rules },
    )))
}
