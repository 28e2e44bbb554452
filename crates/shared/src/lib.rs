#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Shared domain vocabulary for the Cauntr backend.
//!
//! Every crate in the workspace speaks in these types: subscription tiers,
//! billing cycles, subscription status, and the encoded pending-plan change.

pub mod db;
pub mod types;

pub use db::{create_pool, run_migrations};
pub use types::{
    BillingCycle, PendingPlan, TypeParseError, SubscriptionStatus, SubscriptionTier,
};
