//! Paystack configuration.

use crate::error::{BillingError, BillingResult};

pub const PAYSTACK_API_BASE: &str = "https://api.paystack.co";

/// Credentials and endpoints for the Paystack API.
#[derive(Debug, Clone)]
pub struct PaystackConfig {
    /// Secret key used as bearer token for API calls and as the HMAC key
    /// for webhook signatures.
    pub secret_key: String,
    /// API base URL; overridable for tests.
    pub base_url: String,
    /// Callback URL passed on transaction initialization.
    pub callback_url: Option<String>,
}

impl PaystackConfig {
    pub fn from_env() -> BillingResult<Self> {
        let secret_key = std::env::var("PAYSTACK_SECRET_KEY").map_err(|_| {
            BillingError::Validation("PAYSTACK_SECRET_KEY must be set".to_string())
        })?;

        Ok(Self {
            secret_key,
            base_url: std::env::var("PAYSTACK_API_BASE")
                .unwrap_or_else(|_| PAYSTACK_API_BASE.to_string()),
            callback_url: std::env::var("PAYSTACK_CALLBACK_URL").ok(),
        })
    }
}
