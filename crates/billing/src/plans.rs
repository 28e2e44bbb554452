//! Plan catalog.
//!
//! Maps tier x billing cycle to the Paystack plan code and charge amount.
//! The plan-code set doubles as the filter the gateway applies when
//! resolving which of a customer's provider-side subscriptions belong to
//! this system.

use cauntr_shared::{BillingCycle, SubscriptionTier};

use crate::error::{BillingError, BillingResult};

/// One subscribable plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Plan {
    pub tier: SubscriptionTier,
    pub cycle: BillingCycle,
    /// Paystack plan code.
    pub code: &'static str,
    /// Charge amount in kobo.
    pub amount: u64,
}

/// Every paid plan the system sells. Free has no provider-side plan.
pub const PLANS: &[Plan] = &[
    Plan {
        tier: SubscriptionTier::Basic,
        cycle: BillingCycle::Monthly,
        code: "PLN_cauntr_basic_m",
        amount: 500_000,
    },
    Plan {
        tier: SubscriptionTier::Basic,
        cycle: BillingCycle::Yearly,
        code: "PLN_cauntr_basic_y",
        amount: 5_000_000,
    },
    Plan {
        tier: SubscriptionTier::Team,
        cycle: BillingCycle::Monthly,
        code: "PLN_cauntr_team_m",
        amount: 1_500_000,
    },
    Plan {
        tier: SubscriptionTier::Team,
        cycle: BillingCycle::Yearly,
        code: "PLN_cauntr_team_y",
        amount: 15_000_000,
    },
    Plan {
        tier: SubscriptionTier::Enterprise,
        cycle: BillingCycle::Monthly,
        code: "PLN_cauntr_ent_m",
        amount: 5_000_000,
    },
    Plan {
        tier: SubscriptionTier::Enterprise,
        cycle: BillingCycle::Yearly,
        code: "PLN_cauntr_ent_y",
        amount: 50_000_000,
    },
];

/// Look up the plan for a tier/cycle pair. Free is not purchasable.
pub fn plan_for(tier: SubscriptionTier, cycle: BillingCycle) -> BillingResult<&'static Plan> {
    PLANS
        .iter()
        .find(|p| p.tier == tier && p.cycle == cycle)
        .ok_or_else(|| {
            BillingError::Validation(format!("no purchasable plan for {tier} {cycle}"))
        })
}

/// Whether a provider plan code belongs to this system.
pub fn is_known_plan_code(code: &str) -> bool {
    PLANS.iter().any(|p| p.code == code)
}
