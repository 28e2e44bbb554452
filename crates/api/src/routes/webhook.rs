//! Paystack webhook endpoint.
//!
//! Signature verification runs against the raw body before any parsing.
//! Duplicates and unrecognized event types both return 200 so the provider
//! stops retrying; only signature failures, malformed payloads, and
//! processing errors surface as non-200.

use axum::extract::State;
use axum::http::HeaderMap;
use axum::Json;
use cauntr_billing::{BillingError, WebhookOutcome};
use serde_json::{json, Value};

use crate::error::ApiError;
use crate::state::AppState;

const SIGNATURE_HEADER: &str = "x-paystack-signature";

/// POST /webhook
pub async fn receive(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> Result<Json<Value>, ApiError> {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or(ApiError(BillingError::WebhookSignatureInvalid))?;

    state
        .billing
        .webhooks
        .verify_signature(body.as_bytes(), signature)?;

    let outcome = state.billing.webhooks.handle_event(&body).await?;
    let status = match outcome {
        WebhookOutcome::Processed => "processed",
        WebhookOutcome::Duplicate => "duplicate",
        WebhookOutcome::Unhandled => "unhandled",
    };
    Ok(Json(json!({ "status": status })))
}
