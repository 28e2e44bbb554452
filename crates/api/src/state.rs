//! Application state

use std::sync::Arc;

use cauntr_billing::BillingService;
use sqlx::PgPool;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub billing: Arc<BillingService>,
}

impl AppState {
    pub fn new(pool: PgPool, billing: BillingService) -> Self {
        Self {
            pool,
            billing: Arc::new(billing),
        }
    }
}
