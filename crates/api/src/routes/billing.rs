//! Subscription lifecycle endpoints.

use axum::extract::{Path, State};
use axum::Json;
use cauntr_billing::{CancellationOutcome, PlanChangeOutcome, ReactivationOutcome};
use cauntr_shared::{BillingCycle, SubscriptionTier};
use serde::Deserialize;
use uuid::Uuid;

use crate::error::ApiError;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct PlanRequest {
    pub tier: SubscriptionTier,
    pub cycle: BillingCycle,
}

/// POST /companies/{company_id}/billing/plan
pub async fn update_plan(
    State(state): State<AppState>,
    Path(company_id): Path<Uuid>,
    Json(req): Json<PlanRequest>,
) -> Result<Json<PlanChangeOutcome>, ApiError> {
    let outcome = state
        .billing
        .lifecycle
        .update_plan(company_id, req.tier, req.cycle)
        .await?;
    Ok(Json(outcome))
}

/// POST /companies/{company_id}/billing/cancel
pub async fn cancel_subscription(
    State(state): State<AppState>,
    Path(company_id): Path<Uuid>,
) -> Result<Json<CancellationOutcome>, ApiError> {
    let outcome = state
        .billing
        .lifecycle
        .cancel_subscription(company_id)
        .await?;
    Ok(Json(outcome))
}

/// POST /companies/{company_id}/billing/reactivate
pub async fn reactivate_subscription(
    State(state): State<AppState>,
    Path(company_id): Path<Uuid>,
    Json(req): Json<PlanRequest>,
) -> Result<Json<ReactivationOutcome>, ApiError> {
    let outcome = state
        .billing
        .lifecycle
        .reactivate_subscription(company_id, req.tier, req.cycle)
        .await?;
    Ok(Json(outcome))
}
