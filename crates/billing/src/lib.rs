// Billing crate clippy configuration
// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Cauntr Billing Module
//!
//! Subscription lifecycle and billing reconciliation over Paystack.
//!
//! ## Features
//!
//! - **Plan Changes**: Immediate or cycle-boundary plan updates
//! - **Cancellation**: Provider teardown now, deactivation after the cycle
//! - **Reactivation**: Fresh subscriptions after cancellation or expiry
//! - **Deferred Execution**: One-shot scheduled callbacks with restart recovery
//! - **Webhooks**: Signature-verified, deduplicated Paystack event handling
//! - **Sweeps**: Daily catch-up and hourly stale-state cleanup

pub mod config;
pub mod error;
pub mod gateway;
pub mod lifecycle;
pub mod plans;
pub mod scheduler;
pub mod store;
pub mod sweep;
pub mod webhooks;

pub use config::PaystackConfig;
pub use error::{BillingError, BillingResult};
pub use gateway::PaystackGateway;
pub use lifecycle::{
    ApplyOutcome, CancellationOutcome, LifecycleService, PlanChangeOutcome, ReactivationOutcome,
};
pub use plans::{plan_for, Plan, PLANS};
pub use scheduler::DeferredScheduler;
pub use store::{CompanyRecord, CompanyStore};
pub use sweep::{SweepReport, SweepService};
pub use webhooks::{WebhookHandler, WebhookOutcome};

use sqlx::PgPool;

/// One wired-up billing backend: gateway, store, scheduler, lifecycle,
/// webhook handler and sweeps over a shared pool. The api and worker
/// binaries both construct this.
#[derive(Clone)]
pub struct BillingService {
    pub store: CompanyStore,
    pub lifecycle: LifecycleService,
    pub webhooks: WebhookHandler,
    pub sweep: SweepService,
    pub scheduler: DeferredScheduler,
}

impl BillingService {
    /// Construct from environment configuration. Fails when the provider
    /// secret is missing or the scheduler cannot start.
    pub async fn from_env(pool: PgPool) -> BillingResult<Self> {
        let config = PaystackConfig::from_env()?;
        let secret = config.secret_key.clone();

        let gateway = PaystackGateway::new(config)?;
        let store = CompanyStore::new(pool.clone());
        let scheduler = DeferredScheduler::new().await?;
        let lifecycle = LifecycleService::new(gateway, store.clone(), scheduler.clone());
        let webhooks = WebhookHandler::new(pool, lifecycle.clone(), secret);
        let sweep = SweepService::new(store.clone(), lifecycle.clone());

        Ok(Self {
            store,
            lifecycle,
            webhooks,
            sweep,
            scheduler,
        })
    }
}
