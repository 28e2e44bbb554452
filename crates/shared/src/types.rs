//! Core subscription domain types.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Stored as plain TEXT columns; these enums encode/decode through their
/// canonical lowercase string forms.
macro_rules! impl_text_column {
    ($ty:ty) => {
        impl sqlx::Type<sqlx::Postgres> for $ty {
            fn type_info() -> sqlx::postgres::PgTypeInfo {
                <&str as sqlx::Type<sqlx::Postgres>>::type_info()
            }

            fn compatible(ty: &sqlx::postgres::PgTypeInfo) -> bool {
                <&str as sqlx::Type<sqlx::Postgres>>::compatible(ty)
            }
        }

        impl<'q> sqlx::Encode<'q, sqlx::Postgres> for $ty {
            fn encode_by_ref(
                &self,
                buf: &mut sqlx::postgres::PgArgumentBuffer,
            ) -> Result<sqlx::encode::IsNull, sqlx::error::BoxDynError> {
                <&str as sqlx::Encode<'q, sqlx::Postgres>>::encode_by_ref(&self.as_str(), buf)
            }
        }

        impl<'r> sqlx::Decode<'r, sqlx::Postgres> for $ty {
            fn decode(
                value: sqlx::postgres::PgValueRef<'r>,
            ) -> Result<Self, sqlx::error::BoxDynError> {
                let s = <&str as sqlx::Decode<'r, sqlx::Postgres>>::decode(value)?;
                s.parse().map_err(Into::into)
            }
        }
    };
}

impl_text_column!(SubscriptionTier);
impl_text_column!(BillingCycle);
impl_text_column!(SubscriptionStatus);

/// Subscription tier for a company.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionTier {
    Free,
    Basic,
    Team,
    Enterprise,
}

impl SubscriptionTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionTier::Free => "free",
            SubscriptionTier::Basic => "basic",
            SubscriptionTier::Team => "team",
            SubscriptionTier::Enterprise => "enterprise",
        }
    }

    /// Tiers that carry a provider-side subscription (everything but Free).
    pub fn is_paid(&self) -> bool {
        !matches!(self, SubscriptionTier::Free)
    }
}

impl fmt::Display for SubscriptionTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for SubscriptionTier {
    type Err = TypeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "free" => Ok(SubscriptionTier::Free),
            "basic" => Ok(SubscriptionTier::Basic),
            "team" => Ok(SubscriptionTier::Team),
            "enterprise" => Ok(SubscriptionTier::Enterprise),
            other => Err(TypeParseError::UnknownTier(other.to_string())),
        }
    }
}

/// Billing cycle length.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BillingCycle {
    Monthly,
    Yearly,
}

impl BillingCycle {
    pub fn as_str(&self) -> &'static str {
        match self {
            BillingCycle::Monthly => "monthly",
            BillingCycle::Yearly => "yearly",
        }
    }
}

impl fmt::Display for BillingCycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for BillingCycle {
    type Err = TypeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "monthly" => Ok(BillingCycle::Monthly),
            "yearly" => Ok(BillingCycle::Yearly),
            other => Err(TypeParseError::UnknownCycle(other.to_string())),
        }
    }
}

/// Current subscription status of a company.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionStatus {
    Trial,
    Active,
    Cancelled,
    Expired,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::Trial => "trial",
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::Cancelled => "cancelled",
            SubscriptionStatus::Expired => "expired",
        }
    }
}

impl fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for SubscriptionStatus {
    type Err = TypeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "trial" => Ok(SubscriptionStatus::Trial),
            "active" => Ok(SubscriptionStatus::Active),
            "cancelled" => Ok(SubscriptionStatus::Cancelled),
            "expired" => Ok(SubscriptionStatus::Expired),
            other => Err(TypeParseError::UnknownStatus(other.to_string())),
        }
    }
}

/// Error decoding a persisted pending-plan string.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TypeParseError {
    #[error("pending plan '{0}' is not in '<tier>_<cycle>' form")]
    Malformed(String),
    #[error("unknown subscription tier '{0}'")]
    UnknownTier(String),
    #[error("unknown billing cycle '{0}'")]
    UnknownCycle(String),
    #[error("unknown subscription status '{0}'")]
    UnknownStatus(String),
}

/// A scheduled plan change: the target tier and cycle a company moves to at
/// its next billing date.
///
/// Persisted as a single `"<tier>_<cycle>"` column (e.g. `"team_yearly"`),
/// but code only ever sees this struct; the string form exists at the
/// storage boundary alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingPlan {
    pub tier: SubscriptionTier,
    pub cycle: BillingCycle,
}

impl PendingPlan {
    pub fn new(tier: SubscriptionTier, cycle: BillingCycle) -> Self {
        Self { tier, cycle }
    }

    /// Storage encoding, `"<tier>_<cycle>"`.
    pub fn encode(&self) -> String {
        format!("{}_{}", self.tier.as_str(), self.cycle.as_str())
    }

    /// Decode the storage encoding. Splits on the first underscore only;
    /// tier names never contain underscores.
    pub fn parse(s: &str) -> Result<Self, TypeParseError> {
        let (tier, cycle) = s
            .split_once('_')
            .ok_or_else(|| TypeParseError::Malformed(s.to_string()))?;
        Ok(Self {
            tier: tier.parse()?,
            cycle: cycle.parse()?,
        })
    }
}

impl fmt::Display for PendingPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.encode())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pending_plan_encodes_tier_then_cycle() {
        let plan = PendingPlan::new(SubscriptionTier::Team, BillingCycle::Yearly);
        assert_eq!(plan.encode(), "team_yearly");
    }

    #[test]
    fn pending_plan_parses_known_encoding() {
        let plan = PendingPlan::parse("basic_monthly").unwrap();
        assert_eq!(plan.tier, SubscriptionTier::Basic);
        assert_eq!(plan.cycle, BillingCycle::Monthly);
    }

    #[test]
    fn pending_plan_rejects_missing_separator() {
        assert_eq!(
            PendingPlan::parse("teamyearly"),
            Err(TypeParseError::Malformed("teamyearly".to_string()))
        );
    }

    #[test]
    fn pending_plan_rejects_unknown_tier() {
        assert!(matches!(
            PendingPlan::parse("platinum_monthly"),
            Err(TypeParseError::UnknownTier(_))
        ));
    }

    #[test]
    fn pending_plan_rejects_unknown_cycle() {
        assert!(matches!(
            PendingPlan::parse("team_weekly"),
            Err(TypeParseError::UnknownCycle(_))
        ));
    }

    #[test]
    fn tier_round_trips_through_str() {
        for tier in [
            SubscriptionTier::Free,
            SubscriptionTier::Basic,
            SubscriptionTier::Team,
            SubscriptionTier::Enterprise,
        ] {
            assert_eq!(tier.as_str().parse::<SubscriptionTier>().unwrap(), tier);
        }
    }

    #[test]
    fn only_free_is_unpaid() {
        assert!(!SubscriptionTier::Free.is_paid());
        assert!(SubscriptionTier::Basic.is_paid());
        assert!(SubscriptionTier::Team.is_paid());
        assert!(SubscriptionTier::Enterprise.is_paid());
    }
}
