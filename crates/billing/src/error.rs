//! Billing error taxonomy.
//!
//! Provider failures are carried as values across the gateway boundary so
//! the lifecycle controller handles them uniformly; nothing in this crate
//! panics on a remote failure.

use thiserror::Error;

/// Errors produced by the billing core.
#[derive(Debug, Error)]
pub enum BillingError {
    /// Caller-fixable input problem (missing billing fields, malformed
    /// request). Maps to 400.
    #[error("validation error: {0}")]
    Validation(String),

    /// The payment provider rejected the operation or was unreachable.
    /// The fault is upstream, not the caller's. Maps to 502.
    #[error("payment provider error: {0}")]
    Provider(String),

    /// Company, subscription, or provider customer absent. Maps to 404.
    #[error("{0} not found")]
    NotFound(&'static str),

    /// Another subscription operation on the same company is in flight
    /// (capability flag already claimed). Maps to 409.
    #[error("operation conflict: {0}")]
    Conflict(String),

    /// Inbound webhook signature did not verify. Maps to 401.
    #[error("webhook signature verification failed")]
    WebhookSignatureInvalid,

    /// Inbound webhook payload missing required shape. Maps to 400.
    #[error("malformed webhook payload: {0}")]
    WebhookPayloadInvalid(String),

    #[error("scheduler error: {0}")]
    Scheduler(String),

    #[error("database error: {0}")]
    Database(String),
}

impl From<sqlx::Error> for BillingError {
    fn from(e: sqlx::Error) -> Self {
        BillingError::Database(e.to_string())
    }
}

impl From<cauntr_shared::TypeParseError> for BillingError {
    fn from(e: cauntr_shared::TypeParseError) -> Self {
        BillingError::Validation(e.to_string())
    }
}

pub type BillingResult<T> = Result<T, BillingError>;
