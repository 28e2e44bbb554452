//! Catch-up and cleanup sweeps.
//!
//! In-process scheduled jobs are lost on restart and skipped when their
//! instant passes while the process is down. The daily catch-up sweep is
//! the safety net: it applies every due pending plan update and finalizes
//! every overdue deactivation straight from durable state. The hourly
//! cleanup clears pending updates stuck far past their target date.

use time::{Duration, OffsetDateTime};
use tracing::{error, info};

use crate::error::BillingResult;
use crate::lifecycle::{ApplyOutcome, LifecycleService};
use crate::store::CompanyStore;

/// Pending updates older than this past their billing date are considered
/// stuck and cleared rather than applied.
pub const STALE_PENDING_RETENTION: Duration = Duration::days(180);

/// Per-category tallies from one catch-up pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub updates_applied: usize,
    pub updates_noop: usize,
    pub deactivations: usize,
    pub errors: usize,
}

#[derive(Clone)]
pub struct SweepService {
    store: CompanyStore,
    lifecycle: LifecycleService,
}

impl SweepService {
    pub fn new(store: CompanyStore, lifecycle: LifecycleService) -> Self {
        Self { store, lifecycle }
    }

    /// Daily catch-up: apply due pending plan updates, then finalize
    /// overdue deactivations. One company failing never stops the pass;
    /// its row is untouched and retried on the next sweep.
    pub async fn run_catch_up(&self) -> BillingResult<SweepReport> {
        let now = OffsetDateTime::now_utc();
        let mut report = SweepReport::default();

        let due = self.store.find_due_pending(now).await?;
        info!(count = due.len(), "Catch-up sweep: due pending plan updates");
        for company in &due {
            match self.lifecycle.apply_pending_subscription(company.id).await {
                Ok(ApplyOutcome::Applied(plan)) => {
                    info!(company_id = %company.id, plan = %plan, "Sweep applied pending plan update");
                    report.updates_applied += 1;
                }
                Ok(ApplyOutcome::Noop) => report.updates_noop += 1,
                Err(e) => {
                    error!(
                        company_id = %company.id,
                        error = %e,
                        "Sweep failed to apply pending plan update"
                    );
                    report.errors += 1;
                }
            }
        }

        let overdue = self.store.find_overdue_deactivations(now).await?;
        info!(count = overdue.len(), "Catch-up sweep: overdue deactivations");
        for company in &overdue {
            match self.lifecycle.deactivate_company(company.id).await {
                Ok(()) => report.deactivations += 1,
                Err(e) => {
                    error!(
                        company_id = %company.id,
                        error = %e,
                        "Sweep failed to deactivate company"
                    );
                    report.errors += 1;
                }
            }
        }

        info!(
            updates_applied = report.updates_applied,
            updates_noop = report.updates_noop,
            deactivations = report.deactivations,
            errors = report.errors,
            "Catch-up sweep finished"
        );
        Ok(report)
    }

    /// Hourly cleanup: drop pending plan updates stuck long past their
    /// billing date.
    pub async fn run_stale_cleanup(&self) -> BillingResult<u64> {
        let cleared = self
            .store
            .clear_stale_pending(OffsetDateTime::now_utc(), STALE_PENDING_RETENTION)
            .await?;
        if cleared > 0 {
            info!(cleared = cleared, "Cleared stale pending plan updates");
        }
        Ok(cleared)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn report_starts_empty() {
        let report = SweepReport::default();
        assert_eq!(report.updates_applied, 0);
        assert_eq!(report.updates_noop, 0);
        assert_eq!(report.deactivations, 0);
        assert_eq!(report.errors, 0);
    }

    #[test]
    fn stale_retention_is_six_months() {
        assert_eq!(STALE_PENDING_RETENTION, Duration::days(180));
    }
}
