//! HTTP error mapping for the billing surface.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use cauntr_billing::BillingError;
use serde_json::json;

/// Billing errors carried to the HTTP boundary.
#[derive(Debug, thiserror::Error)]
#[error(transparent)]
pub struct ApiError(#[from] pub BillingError);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match &self.0 {
            BillingError::Validation(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            BillingError::WebhookPayloadInvalid(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            BillingError::WebhookSignatureInvalid => {
                (StatusCode::UNAUTHORIZED, "invalid signature".to_string())
            }
            BillingError::NotFound(what) => (StatusCode::NOT_FOUND, format!("{what} not found")),
            BillingError::Conflict(msg) => (StatusCode::CONFLICT, msg.clone()),
            BillingError::Provider(_) => (
                StatusCode::BAD_GATEWAY,
                "payment provider error".to_string(),
            ),
            BillingError::Scheduler(_) | BillingError::Database(_) => {
                tracing::error!(error = %self.0, "Internal error on billing endpoint");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal server error".to_string(),
                )
            }
        };

        let body = Json(json!({
            "error": message,
            "code": status.as_u16()
        }));

        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status_of(error: BillingError) -> StatusCode {
        ApiError(error).into_response().status()
    }

    #[test]
    fn error_variants_map_to_expected_statuses() {
        assert_eq!(
            status_of(BillingError::Validation("bad".into())),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status_of(BillingError::WebhookSignatureInvalid),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            status_of(BillingError::NotFound("company")),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            status_of(BillingError::Conflict("busy".into())),
            StatusCode::CONFLICT
        );
        assert_eq!(
            status_of(BillingError::Provider("down".into())),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            status_of(BillingError::Database("boom".into())),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn internal_errors_do_not_leak_details() {
        let response = ApiError(BillingError::Database("password=hunter2".into())).into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
