//! Subscription lifecycle controller.
//!
//! Orchestrates the three user-facing operations (update plan, cancel,
//! reactivate) plus the two deferred transition functions
//! (`apply_pending_subscription`, `deactivate_company`) they schedule.
//!
//! Ordering rule: the provider call always precedes local writes, so local
//! state never claims a change the provider rejected. Every multi-step
//! local mutation runs inside one transaction.

use cauntr_shared::{BillingCycle, PendingPlan, SubscriptionStatus, SubscriptionTier};
use sqlx::PgPool;
use time::{Duration, OffsetDateTime, UtcOffset};
use tracing::{error, info};
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::gateway::PaystackGateway;
use crate::plans;
use crate::scheduler::{plan_recovery, DeferredScheduler, PendingOperation};
use crate::store::CompanyStore;

/// Grace window between the cycle boundary and final deactivation, giving
/// in-flight requests time to observe the cancellation.
pub const DEACTIVATION_GRACE: Duration = Duration::minutes(10);

/// When a cancelled subscription actually deactivates.
pub fn deactivation_date(cycle_end: OffsetDateTime) -> OffsetDateTime {
    cycle_end + DEACTIVATION_GRACE
}

/// Whether two instants fall on the same UTC calendar day.
pub fn is_same_utc_day(a: OffsetDateTime, b: OffsetDateTime) -> bool {
    a.to_offset(UtcOffset::UTC).date() == b.to_offset(UtcOffset::UTC).date()
}

/// How a plan change executes relative to the current cycle boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeTiming {
    /// Billing date is today: charge now and switch immediately.
    Immediate,
    /// Billing date is in the future: provider subscription starts then,
    /// local switch is deferred.
    Deferred,
}

/// Decide between the immediate and deferred paths for a plan change.
pub fn change_timing(next_billing_date: OffsetDateTime, now: OffsetDateTime) -> ChangeTiming {
    if is_same_utc_day(next_billing_date, now) {
        ChangeTiming::Immediate
    } else {
        ChangeTiming::Deferred
    }
}

/// The end of a billing cycle that starts at `start`.
pub fn advance_cycle(start: OffsetDateTime, cycle: BillingCycle) -> OffsetDateTime {
    let date = start.date();
    let (year, month) = match cycle {
        BillingCycle::Yearly => (date.year() + 1, date.month()),
        BillingCycle::Monthly => {
            let next = date.month().next();
            let year = if next == time::Month::January {
                date.year() + 1
            } else {
                date.year()
            };
            (year, next)
        }
    };
    // Clamp the day for short months (Jan 31 -> Feb 28, Feb 29 -> Feb 28).
    let day = date.day().min(time::util::days_in_year_month(year, month));
    match time::Date::from_calendar_date(year, month, day) {
        Ok(d) => start.replace_date(d),
        // Unreachable with a clamped day; keep the old instant over panicking.
        Err(_) => start,
    }
}

/// Result of a plan-change request.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum PlanChangeOutcome {
    /// Charged now; the caller completes payment at the authorization URL.
    Active { authorization_url: String },
    /// Provider subscription created; the local switch applies at
    /// `effective_date`.
    Scheduled {
        #[serde(with = "time::serde::rfc3339")]
        effective_date: OffsetDateTime,
    },
}

/// Result of a cancellation request.
#[derive(Debug, Clone, serde::Serialize)]
pub struct CancellationOutcome {
    #[serde(with = "time::serde::rfc3339")]
    pub deactivation_date: OffsetDateTime,
}

/// Result of a reactivation request.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ReactivationOutcome {
    pub authorization_url: String,
}

/// Result of applying a pending plan update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied(PendingPlan),
    /// Nothing pending: already applied or superseded.
    Noop,
}

/// Lifecycle controller. Cheap to clone; scheduled callbacks capture
/// clones of this service.
#[derive(Clone)]
pub struct LifecycleService {
    gateway: PaystackGateway,
    store: CompanyStore,
    scheduler: DeferredScheduler,
}

impl LifecycleService {
    pub fn new(gateway: PaystackGateway, store: CompanyStore, scheduler: DeferredScheduler) -> Self {
        Self {
            gateway,
            store,
            scheduler,
        }
    }

    fn pool(&self) -> &PgPool {
        self.store.pool()
    }

    /// Atomically claim the `can_update` capability. The conditional update
    /// closes the check-then-act race between concurrent requests.
    async fn claim_can_update(&self, company_id: Uuid) -> BillingResult<()> {
        let result = sqlx::query(
            "UPDATE companies SET can_update = FALSE, updated_at = NOW() \
             WHERE id = $1 AND can_update = TRUE",
        )
        .bind(company_id)
        .execute(self.pool())
        .await?;

        if result.rows_affected() == 0 {
            return Err(BillingError::Conflict(
                "another subscription operation is in progress".to_string(),
            ));
        }
        Ok(())
    }

    async fn claim_can_cancel(&self, company_id: Uuid) -> BillingResult<()> {
        let result = sqlx::query(
            "UPDATE companies SET can_cancel = FALSE, updated_at = NOW() \
             WHERE id = $1 AND can_cancel = TRUE",
        )
        .bind(company_id)
        .execute(self.pool())
        .await?;

        if result.rows_affected() == 0 {
            return Err(BillingError::Conflict(
                "a cancellation is already in progress".to_string(),
            ));
        }
        Ok(())
    }

    async fn release_capability(&self, company_id: Uuid, column: Capability) {
        let query = match column {
            Capability::Update => {
                "UPDATE companies SET can_update = TRUE, updated_at = NOW() WHERE id = $1"
            }
            Capability::Cancel => {
                "UPDATE companies SET can_cancel = TRUE, updated_at = NOW() WHERE id = $1"
            }
        };
        if let Err(e) = sqlx::query(query).bind(company_id).execute(self.pool()).await {
            error!(company_id = %company_id, error = %e, "Failed to release capability flag");
        }
    }

    /// Change a company's plan, immediately or at the next cycle boundary.
    ///
    /// The current provider subscription is always torn down first and a
    /// new one created (cancel-then-recreate): simpler to reason about than
    /// provider-side proration. A provider rejection aborts before any
    /// local plan state changes.
    pub async fn update_plan(
        &self,
        company_id: Uuid,
        tier: SubscriptionTier,
        cycle: BillingCycle,
    ) -> BillingResult<PlanChangeOutcome> {
        let company = self.store.find_by_id(company_id).await?;

        if company.subscription_status != SubscriptionStatus::Active {
            return Err(BillingError::Validation(
                "only an active subscription can change plans".to_string(),
            ));
        }
        let next_billing_date = company.cycle_ends_at.ok_or_else(|| {
            BillingError::Validation("company has no billing cycle end date".to_string())
        })?;
        let plan = plans::plan_for(tier, cycle)?;

        self.claim_can_update(company_id).await?;

        if let Err(e) = self.gateway.cancel_subscription(&company.email).await {
            self.release_capability(company_id, Capability::Update).await;
            return Err(e);
        }

        let now = OffsetDateTime::now_utc();
        match change_timing(next_billing_date, now) {
            ChangeTiming::Immediate => {
                let transaction = match self
                    .gateway
                    .initialize_transaction(&company.email, plan.amount, Some(plan.code))
                    .await
                {
                    Ok(t) => t,
                    Err(e) => {
                        self.release_capability(company_id, Capability::Update).await;
                        return Err(e);
                    }
                };

                let mut tx = self.pool().begin().await?;
                sqlx::query(
                    r#"
                    UPDATE companies
                    SET subscription_tier = $2,
                        billing_cycle = $3,
                        subscription_status = 'active',
                        pending_plan_update = NULL,
                        next_billing_date = NULL,
                        scheduled_deactivation = NULL,
                        cycle_started_at = $4,
                        cycle_ends_at = $5,
                        provider_transaction_reference = $6,
                        can_update = TRUE,
                        can_cancel = TRUE,
                        updated_at = NOW()
                    WHERE id = $1
                    "#,
                )
                .bind(company_id)
                .bind(tier)
                .bind(cycle)
                .bind(now)
                .bind(advance_cycle(now, cycle))
                .bind(&transaction.reference)
                .execute(&mut *tx)
                .await?;
                tx.commit().await?;

                info!(
                    company_id = %company_id,
                    tier = %tier,
                    cycle = %cycle,
                    "Plan changed immediately"
                );
                Ok(PlanChangeOutcome::Active {
                    authorization_url: transaction.authorization_url,
                })
            }
            ChangeTiming::Deferred => {
                let customer = match company
                    .provider_customer_code
                    .as_deref()
                    .ok_or(BillingError::NotFound("provider customer"))
                {
                    Ok(c) => c,
                    Err(e) => {
                        self.release_capability(company_id, Capability::Update).await;
                        return Err(e);
                    }
                };

                let created = match self
                    .gateway
                    .create_subscription(
                        plan.code,
                        customer,
                        next_billing_date,
                        company.provider_authorization_code.as_deref(),
                    )
                    .await
                {
                    Ok(s) => s,
                    Err(e) => {
                        self.release_capability(company_id, Capability::Update).await;
                        return Err(e);
                    }
                };

                let pending = PendingPlan::new(tier, cycle);
                let mut tx = self.pool().begin().await?;
                sqlx::query(
                    r#"
                    UPDATE companies
                    SET pending_plan_update = $2,
                        next_billing_date = $3,
                        provider_subscription_code = $4,
                        can_update = TRUE,
                        updated_at = NOW()
                    WHERE id = $1
                    "#,
                )
                .bind(company_id)
                .bind(pending.encode())
                .bind(next_billing_date)
                .bind(&created.subscription_code)
                .execute(&mut *tx)
                .await?;
                tx.commit().await?;

                let svc = self.clone();
                self.scheduler
                    .schedule_at(next_billing_date, move || {
                        let svc = svc.clone();
                        async move {
                            if let Err(e) = svc.apply_pending_subscription(company_id).await {
                                error!(
                                    company_id = %company_id,
                                    error = %e,
                                    "Deferred plan update failed"
                                );
                            }
                        }
                    })
                    .await?;

                info!(
                    company_id = %company_id,
                    pending = %pending,
                    effective_date = %next_billing_date,
                    "Plan change scheduled"
                );
                Ok(PlanChangeOutcome::Scheduled {
                    effective_date: next_billing_date,
                })
            }
        }
    }

    /// Apply a previously scheduled plan change. Idempotent: a null pending
    /// field (already applied or superseded) is a harmless no-op, so a
    /// stale scheduled callback firing late does nothing.
    pub async fn apply_pending_subscription(&self, company_id: Uuid) -> BillingResult<ApplyOutcome> {
        let mut tx = self.pool().begin().await?;

        let row: Option<(Option<String>, Option<OffsetDateTime>)> = sqlx::query_as(
            "SELECT pending_plan_update, next_billing_date FROM companies WHERE id = $1 FOR UPDATE",
        )
        .bind(company_id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some((pending, next_billing_date)) = row else {
            return Err(BillingError::NotFound("company"));
        };
        let Some(encoded) = pending else {
            info!(company_id = %company_id, "No pending plan update to apply");
            return Ok(ApplyOutcome::Noop);
        };

        let plan = PendingPlan::parse(&encoded)?;
        let cycle_start = next_billing_date.unwrap_or_else(OffsetDateTime::now_utc);

        sqlx::query(
            r#"
            UPDATE companies
            SET subscription_tier = $2,
                billing_cycle = $3,
                subscription_status = 'active',
                pending_plan_update = NULL,
                next_billing_date = NULL,
                scheduled_deactivation = NULL,
                cycle_started_at = $4,
                cycle_ends_at = $5,
                can_update = TRUE,
                can_cancel = TRUE,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(company_id)
        .bind(plan.tier)
        .bind(plan.cycle)
        .bind(cycle_start)
        .bind(advance_cycle(cycle_start, plan.cycle))
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        info!(
            company_id = %company_id,
            tier = %plan.tier,
            cycle = %plan.cycle,
            "Applied pending plan update"
        );
        Ok(ApplyOutcome::Applied(plan))
    }

    /// Cancel the subscription at the provider now; the company deactivates
    /// ten minutes after its current cycle ends.
    pub async fn cancel_subscription(&self, company_id: Uuid) -> BillingResult<CancellationOutcome> {
        let company = self.store.find_by_id(company_id).await?;

        if company.subscription_status != SubscriptionStatus::Active {
            return Err(BillingError::Validation(
                "only an active subscription can be cancelled".to_string(),
            ));
        }
        let cycle_end = company.cycle_ends_at.ok_or_else(|| {
            BillingError::Validation("company has no billing cycle end date".to_string())
        })?;

        self.claim_can_cancel(company_id).await?;

        if let Err(e) = self.gateway.cancel_subscription(&company.email).await {
            self.release_capability(company_id, Capability::Cancel).await;
            return Err(e);
        }

        let deactivation = deactivation_date(cycle_end);

        // Both capability flags drop atomically with the deactivation date:
        // no further plan operations while an irreversible cancellation is
        // pending.
        let mut tx = self.pool().begin().await?;
        sqlx::query(
            r#"
            UPDATE companies
            SET can_cancel = FALSE,
                can_update = FALSE,
                scheduled_deactivation = $2,
                cycle_ends_at = $2,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(company_id)
        .bind(deactivation)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        self.schedule_deactivation_job(company_id, deactivation)
            .await?;

        info!(
            company_id = %company_id,
            deactivation_date = %deactivation,
            "Subscription cancelled; deactivation scheduled"
        );
        Ok(CancellationOutcome {
            deactivation_date: deactivation,
        })
    }

    /// Register the deferred callback that finalizes a deactivation. Also
    /// used by the webhook handler when the provider reports a
    /// non-renewal.
    pub async fn schedule_deactivation_job(
        &self,
        company_id: Uuid,
        at: OffsetDateTime,
    ) -> BillingResult<()> {
        let svc = self.clone();
        self.scheduler
            .schedule_at(at, move || {
                let svc = svc.clone();
                async move {
                    if let Err(e) = svc.deactivate_company(company_id).await {
                        error!(
                            company_id = %company_id,
                            error = %e,
                            "Scheduled deactivation failed"
                        );
                    }
                }
            })
            .await?;
        Ok(())
    }

    /// Final effect of a cancellation: back to the free tier, provider
    /// identifiers cleared. Runs only while a deactivation is actually
    /// scheduled; a stale callback firing after the deactivation already
    /// ran, or after the company reactivated, is a no-op.
    pub async fn deactivate_company(&self, company_id: Uuid) -> BillingResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE companies
            SET subscription_status = 'cancelled',
                subscription_tier = 'free',
                billing_cycle = 'monthly',
                scheduled_deactivation = NULL,
                pending_plan_update = NULL,
                next_billing_date = NULL,
                provider_subscription_code = NULL,
                provider_authorization_code = NULL,
                cycle_ends_at = NULL,
                can_update = TRUE,
                can_cancel = TRUE,
                updated_at = NOW()
            WHERE id = $1 AND scheduled_deactivation IS NOT NULL
            "#,
        )
        .bind(company_id)
        .execute(self.pool())
        .await?;

        if result.rows_affected() == 0 {
            info!(company_id = %company_id, "No scheduled deactivation to finalize");
            return Ok(());
        }

        info!(company_id = %company_id, "Company deactivated");
        Ok(())
    }

    /// Start a fresh subscription after cancellation or expiry. Always
    /// immediate: there is no existing cycle to respect.
    pub async fn reactivate_subscription(
        &self,
        company_id: Uuid,
        tier: SubscriptionTier,
        cycle: BillingCycle,
    ) -> BillingResult<ReactivationOutcome> {
        let company = self.store.find_by_id(company_id).await?;

        if company.subscription_status == SubscriptionStatus::Active {
            return Err(BillingError::Conflict(
                "subscription is already active".to_string(),
            ));
        }
        let plan = plans::plan_for(tier, cycle)?;

        let transaction = self
            .gateway
            .initialize_transaction(&company.email, plan.amount, Some(plan.code))
            .await?;

        let now = OffsetDateTime::now_utc();
        let mut tx = self.pool().begin().await?;
        sqlx::query(
            r#"
            UPDATE companies
            SET subscription_tier = $2,
                billing_cycle = $3,
                subscription_status = 'active',
                pending_plan_update = NULL,
                next_billing_date = NULL,
                scheduled_deactivation = NULL,
                cycle_started_at = $4,
                cycle_ends_at = $5,
                provider_customer_code = COALESCE($6, provider_customer_code),
                provider_transaction_reference = $7,
                can_update = TRUE,
                can_cancel = TRUE,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(company_id)
        .bind(tier)
        .bind(cycle)
        .bind(now)
        .bind(advance_cycle(now, cycle))
        .bind(transaction.customer.customer_code.as_deref())
        .bind(&transaction.reference)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        info!(
            company_id = %company_id,
            tier = %tier,
            cycle = %cycle,
            "Subscription reactivated"
        );
        Ok(ReactivationOutcome {
            authorization_url: transaction.authorization_url,
        })
    }

    /// Restart recovery: re-derive scheduled jobs from the pending fields
    /// on company rows. Returns how many jobs were registered; overdue
    /// instants are left to the catch-up sweep.
    pub async fn restore_scheduled_jobs(&self) -> BillingResult<usize> {
        let companies = self.store.find_with_pending_operations().await?;
        let operations = plan_recovery(&companies);

        let mut registered = 0;
        let mut overdue = 0;
        for operation in operations {
            let job = match operation {
                PendingOperation::ApplyPlanUpdate { company_id, at } => {
                    let svc = self.clone();
                    self.scheduler
                        .schedule_at(at, move || {
                            let svc = svc.clone();
                            async move {
                                if let Err(e) = svc.apply_pending_subscription(company_id).await {
                                    error!(
                                        company_id = %company_id,
                                        error = %e,
                                        "Recovered plan-update job failed"
                                    );
                                }
                            }
                        })
                        .await?
                }
                PendingOperation::Deactivate { company_id, at } => {
                    let svc = self.clone();
                    self.scheduler
                        .schedule_at(at, move || {
                            let svc = svc.clone();
                            async move {
                                if let Err(e) = svc.deactivate_company(company_id).await {
                                    error!(
                                        company_id = %company_id,
                                        error = %e,
                                        "Recovered deactivation job failed"
                                    );
                                }
                            }
                        })
                        .await?
                }
            };
            match job {
                Some(_) => registered += 1,
                None => overdue += 1,
            }
        }

        info!(
            registered = registered,
            overdue = overdue,
            "Restored scheduled jobs from durable state"
        );
        Ok(registered)
    }
}

#[derive(Debug, Clone, Copy)]
enum Capability {
    Update,
    Cancel,
}
