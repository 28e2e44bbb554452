//! Route table.

pub mod billing;
pub mod webhook;

use axum::routing::{get, post};
use axum::Router;

use crate::state::AppState;

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route(
            "/companies/{company_id}/billing/plan",
            post(billing::update_plan),
        )
        .route(
            "/companies/{company_id}/billing/cancel",
            post(billing::cancel_subscription),
        )
        .route(
            "/companies/{company_id}/billing/reactivate",
            post(billing::reactivate_subscription),
        )
        .route("/webhook", post(webhook::receive))
        .with_state(state)
}

async fn health() -> &'static str {
    "ok"
}
