//! Deferred execution scheduler.
//!
//! One-shot callbacks at an absolute instant, expressed as cron triggers:
//! an expression pinning minute, hour, day and month matches exactly one
//! calendar instant per year, which functions as a one-shot. Scheduler
//! state is never durable on its own; it is re-derived from the pending
//! fields on company rows at process start, and anything overdue is left
//! to the catch-up sweep.

use std::future::Future;
use std::sync::{Arc, Mutex};

use time::{OffsetDateTime, UtcOffset};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::store::CompanyRecord;

/// Five-field cron expression (`minute hour day month *`) matching the
/// given instant's UTC calendar components. The weekday field is always
/// wildcarded.
pub fn cron_expression(at: OffsetDateTime) -> String {
    let utc = at.to_offset(UtcOffset::UTC);
    format!(
        "{} {} {} {} *",
        utc.minute(),
        utc.hour(),
        utc.day(),
        u8::from(utc.month())
    )
}

/// A deferred obligation recovered from durable company state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingOperation {
    ApplyPlanUpdate { company_id: Uuid, at: OffsetDateTime },
    Deactivate { company_id: Uuid, at: OffsetDateTime },
}

impl PendingOperation {
    pub fn at(&self) -> OffsetDateTime {
        match self {
            PendingOperation::ApplyPlanUpdate { at, .. } => *at,
            PendingOperation::Deactivate { at, .. } => *at,
        }
    }
}

/// Map company rows to the deferred operations they imply. A row with both
/// a pending plan update and a scheduled deactivation yields one operation
/// per pending field.
pub fn plan_recovery(companies: &[CompanyRecord]) -> Vec<PendingOperation> {
    let mut ops = Vec::new();
    for company in companies {
        if company.pending_plan_update.is_some() {
            if let Some(at) = company.next_billing_date {
                ops.push(PendingOperation::ApplyPlanUpdate {
                    company_id: company.id,
                    at,
                });
            }
        }
        if let Some(at) = company.scheduled_deactivation {
            ops.push(PendingOperation::Deactivate {
                company_id: company.id,
                at,
            });
        }
    }
    ops
}

/// In-process one-shot scheduler over `tokio-cron-scheduler`.
///
/// Callbacks deregister themselves after their first firing. A superseded
/// callback that fires before its state changes land is still made
/// harmless by the re-check inside the transition functions it invokes.
#[derive(Clone)]
pub struct DeferredScheduler {
    inner: JobScheduler,
    jobs: Arc<Mutex<Vec<Uuid>>>,
}

impl DeferredScheduler {
    pub async fn new() -> BillingResult<Self> {
        let inner = JobScheduler::new()
            .await
            .map_err(|e| BillingError::Scheduler(e.to_string()))?;
        Ok(Self {
            inner,
            jobs: Arc::new(Mutex::new(Vec::new())),
        })
    }

    pub async fn start(&self) -> BillingResult<()> {
        self.inner
            .start()
            .await
            .map_err(|e| BillingError::Scheduler(e.to_string()))
    }

    /// Register a one-shot callback at `at`. Instants already in the past
    /// are not registered (the sweep catches them); returns the job id when
    /// a job was created.
    pub async fn schedule_at<F, Fut>(
        &self,
        at: OffsetDateTime,
        task: F,
    ) -> BillingResult<Option<Uuid>>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        if at <= OffsetDateTime::now_utc() {
            debug!(at = %at, "Instant already past, deferring to sweep");
            return Ok(None);
        }

        // Six-field form for the underlying scheduler: fire at second 0.
        let expression = format!("0 {}", cron_expression(at));
        let task = Arc::new(task);
        let sched = self.clone();
        let job = Job::new_async(expression.as_str(), move |uuid, _l| {
            let task = task.clone();
            let sched = sched.clone();
            Box::pin(async move {
                task().await;
                // The single-date expression matches again next year; drop
                // the job after its first firing.
                sched.deregister(uuid).await;
            })
        })
        .map_err(|e| BillingError::Scheduler(e.to_string()))?;

        let id = self
            .inner
            .add(job)
            .await
            .map_err(|e| BillingError::Scheduler(e.to_string()))?;

        let mut jobs = self.jobs.lock().unwrap_or_else(|p| p.into_inner());
        jobs.push(id);

        debug!(job_id = %id, at = %at, "Registered deferred callback");
        Ok(Some(id))
    }

    /// Remove a registered job. Fired one-shot callbacks call this on
    /// themselves so they never re-fire.
    pub async fn deregister(&self, id: Uuid) {
        let mut inner = self.inner.clone();
        if let Err(e) = inner.remove(&id).await {
            warn!(job_id = %id, error = %e, "Failed to remove fired job");
        }
        let mut jobs = self.jobs.lock().unwrap_or_else(|p| p.into_inner());
        jobs.retain(|j| *j != id);
        debug!(job_id = %id, "Deregistered one-shot job");
    }

    /// Number of live registered one-shot jobs.
    pub fn job_count(&self) -> usize {
        self.jobs.lock().unwrap_or_else(|p| p.into_inner()).len()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use cauntr_shared::{BillingCycle, SubscriptionStatus, SubscriptionTier};
    use time::macros::datetime;

    fn company(
        pending: Option<&str>,
        next_billing: Option<OffsetDateTime>,
        deactivation: Option<OffsetDateTime>,
    ) -> CompanyRecord {
        CompanyRecord {
            id: Uuid::new_v4(),
            tenant_id: Uuid::new_v4(),
            name: "Acme Stores".to_string(),
            email: "acme@example.com".to_string(),
            subscription_tier: SubscriptionTier::Basic,
            billing_cycle: BillingCycle::Monthly,
            subscription_status: SubscriptionStatus::Active,
            provider_customer_code: Some("CUS_1".to_string()),
            provider_subscription_code: Some("SUB_1".to_string()),
            provider_authorization_code: None,
            provider_transaction_reference: None,
            cycle_started_at: None,
            cycle_ends_at: next_billing,
            pending_plan_update: pending.map(str::to_string),
            next_billing_date: next_billing,
            scheduled_deactivation: deactivation,
            can_update: true,
            can_cancel: true,
        }
    }

    #[test]
    fn cron_expression_for_known_instant() {
        assert_eq!(
            cron_expression(datetime!(2023-10-01 15:30:00 UTC)),
            "30 15 1 10 *"
        );
    }

    #[test]
    fn cron_expression_at_year_boundary() {
        assert_eq!(
            cron_expression(datetime!(2023-12-31 23:59:00 UTC)),
            "59 23 31 12 *"
        );
    }

    #[test]
    fn cron_expression_normalizes_to_utc() {
        // 01:30+02:00 is 23:30 UTC the previous day.
        assert_eq!(
            cron_expression(datetime!(2024-06-15 01:30:00 +02:00)),
            "30 23 14 6 *"
        );
    }

    #[test]
    fn recovery_yields_one_operation_per_pending_field() {
        let due = datetime!(2030-01-15 00:00:00 UTC);
        let companies = vec![
            company(Some("team_yearly"), Some(due), None),
            company(None, None, Some(due)),
            company(Some("basic_monthly"), Some(due), Some(due)),
            company(None, None, None),
        ];

        let ops = plan_recovery(&companies);
        assert_eq!(ops.len(), 4);
        let updates = ops
            .iter()
            .filter(|o| matches!(o, PendingOperation::ApplyPlanUpdate { .. }))
            .count();
        let deactivations = ops
            .iter()
            .filter(|o| matches!(o, PendingOperation::Deactivate { .. }))
            .count();
        assert_eq!(updates, 2);
        assert_eq!(deactivations, 2);
    }

    #[test]
    fn recovery_skips_pending_update_without_billing_date() {
        let companies = vec![company(Some("team_yearly"), None, None)];
        assert!(plan_recovery(&companies).is_empty());
    }

    #[tokio::test]
    async fn registers_one_job_per_future_operation() {
        let scheduler = DeferredScheduler::new().await.unwrap();
        let future = OffsetDateTime::now_utc() + time::Duration::days(2);

        for _ in 0..3 {
            let id = scheduler.schedule_at(future, || async {}).await.unwrap();
            assert!(id.is_some());
        }
        assert_eq!(scheduler.job_count(), 3);
    }

    #[tokio::test]
    async fn deregistered_jobs_leave_the_live_count() {
        let scheduler = DeferredScheduler::new().await.unwrap();
        let future = OffsetDateTime::now_utc() + time::Duration::days(2);

        let id = scheduler
            .schedule_at(future, || async {})
            .await
            .unwrap()
            .unwrap();
        assert_eq!(scheduler.job_count(), 1);

        scheduler.deregister(id).await;
        assert_eq!(scheduler.job_count(), 0);
    }

    #[tokio::test]
    async fn past_instants_are_not_registered() {
        let scheduler = DeferredScheduler::new().await.unwrap();
        let past = OffsetDateTime::now_utc() - time::Duration::minutes(5);

        let id = scheduler.schedule_at(past, || async {}).await.unwrap();
        assert!(id.is_none());
        assert_eq!(scheduler.job_count(), 0);
    }
}
