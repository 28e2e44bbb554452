//! Company subscription record store.
//!
//! Point lookups and the pending-operation queries the scheduler and sweep
//! jobs run. Multi-step mutations live in the lifecycle controller inside
//! `pool.begin()` transactions; this module is read-side plus row types.

use cauntr_shared::{BillingCycle, SubscriptionStatus, SubscriptionTier};
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};

/// One company row with its embedded subscription state.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct CompanyRecord {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub name: String,
    pub email: String,
    pub subscription_tier: SubscriptionTier,
    pub billing_cycle: BillingCycle,
    pub subscription_status: SubscriptionStatus,
    pub provider_customer_code: Option<String>,
    pub provider_subscription_code: Option<String>,
    pub provider_authorization_code: Option<String>,
    pub provider_transaction_reference: Option<String>,
    pub cycle_started_at: Option<OffsetDateTime>,
    pub cycle_ends_at: Option<OffsetDateTime>,
    pub pending_plan_update: Option<String>,
    pub next_billing_date: Option<OffsetDateTime>,
    pub scheduled_deactivation: Option<OffsetDateTime>,
    pub can_update: bool,
    pub can_cancel: bool,
}

const COMPANY_COLUMNS: &str = r#"
    id, tenant_id, name, email,
    subscription_tier, billing_cycle, subscription_status,
    provider_customer_code, provider_subscription_code,
    provider_authorization_code, provider_transaction_reference,
    cycle_started_at, cycle_ends_at,
    pending_plan_update, next_billing_date, scheduled_deactivation,
    can_update, can_cancel
"#;

#[derive(Clone)]
pub struct CompanyStore {
    pool: PgPool,
}

impl CompanyStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn find_by_id(&self, id: Uuid) -> BillingResult<CompanyRecord> {
        let query = format!("SELECT {COMPANY_COLUMNS} FROM companies WHERE id = $1");
        sqlx::query_as::<_, CompanyRecord>(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(BillingError::NotFound("company"))
    }

    pub async fn find_by_email(&self, email: &str) -> BillingResult<CompanyRecord> {
        let query = format!("SELECT {COMPANY_COLUMNS} FROM companies WHERE LOWER(email) = LOWER($1)");
        sqlx::query_as::<_, CompanyRecord>(&query)
            .bind(email)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(BillingError::NotFound("company"))
    }

    /// Companies with any deferred operation outstanding. Drives restart
    /// recovery of scheduled jobs.
    pub async fn find_with_pending_operations(&self) -> BillingResult<Vec<CompanyRecord>> {
        let query = format!(
            "SELECT {COMPANY_COLUMNS} FROM companies \
             WHERE pending_plan_update IS NOT NULL OR scheduled_deactivation IS NOT NULL"
        );
        Ok(sqlx::query_as::<_, CompanyRecord>(&query)
            .fetch_all(&self.pool)
            .await?)
    }

    /// Companies whose pending plan update is due. Drives the daily
    /// catch-up sweep.
    pub async fn find_due_pending(
        &self,
        now: OffsetDateTime,
    ) -> BillingResult<Vec<CompanyRecord>> {
        let query = format!(
            "SELECT {COMPANY_COLUMNS} FROM companies \
             WHERE pending_plan_update IS NOT NULL AND next_billing_date <= $1"
        );
        Ok(sqlx::query_as::<_, CompanyRecord>(&query)
            .bind(now)
            .fetch_all(&self.pool)
            .await?)
    }

    /// Companies whose scheduled deactivation instant has passed.
    pub async fn find_overdue_deactivations(
        &self,
        now: OffsetDateTime,
    ) -> BillingResult<Vec<CompanyRecord>> {
        let query = format!(
            "SELECT {COMPANY_COLUMNS} FROM companies WHERE scheduled_deactivation <= $1"
        );
        Ok(sqlx::query_as::<_, CompanyRecord>(&query)
            .bind(now)
            .fetch_all(&self.pool)
            .await?)
    }

    /// Clear pending updates whose target billing date is further in the
    /// past than `retention`. Defensive bound against permanently stuck
    /// pending state. Returns the number of rows cleared.
    pub async fn clear_stale_pending(
        &self,
        now: OffsetDateTime,
        retention: time::Duration,
    ) -> BillingResult<u64> {
        let cutoff = now - retention;
        let result = sqlx::query(
            r#"
            UPDATE companies
            SET pending_plan_update = NULL,
                next_billing_date = NULL,
                updated_at = NOW()
            WHERE pending_plan_update IS NOT NULL
              AND next_billing_date < $1
            "#,
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}
