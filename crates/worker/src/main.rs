//! Cauntr Background Worker
//!
//! Handles scheduled jobs including:
//! - Restart recovery of deferred plan updates and deactivations (on boot)
//! - Daily catch-up sweep over due pending operations (00:30 UTC)
//! - Hourly stale pending-state cleanup
//! - Health check heartbeat (every 5 minutes)

use std::sync::Arc;
use std::time::Duration;

use cauntr_billing::BillingService;
use cauntr_shared::create_pool;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    // Load environment
    dotenvy::dotenv().ok();

    info!("Starting Cauntr Worker");

    let database_url = std::env::var("DATABASE_URL")
        .map_err(|_| anyhow::anyhow!("DATABASE_URL must be set"))?;
    let pool = create_pool(&database_url).await?;
    info!("Database pool created");

    let billing = BillingService::from_env(pool)
        .await
        .map(Arc::new)
        .map_err(|e| anyhow::anyhow!("failed to create billing service: {e}"))?;

    // The one-shot scheduler must be live before recovery re-registers jobs
    billing
        .scheduler
        .start()
        .await
        .map_err(|e| anyhow::anyhow!("failed to start scheduler: {e}"))?;

    match billing.lifecycle.restore_scheduled_jobs().await {
        Ok(count) => info!(count = count, "Scheduled jobs restored from durable state"),
        Err(e) => error!(error = %e, "Failed to restore scheduled jobs"),
    }

    // Create scheduler for the recurring sweeps
    let scheduler = JobScheduler::new().await?;

    // Job 1: Daily catch-up sweep at 00:30 UTC.
    // Offset from midnight so cycle-boundary one-shot jobs get first pass.
    let catch_up_billing = billing.clone();
    scheduler
        .add(Job::new_async("0 30 0 * * *", move |_uuid, _l| {
            let billing = catch_up_billing.clone();
            Box::pin(async move {
                info!("Running daily catch-up sweep");
                match billing.sweep.run_catch_up().await {
                    Ok(report) => info!(
                        updates_applied = report.updates_applied,
                        deactivations = report.deactivations,
                        errors = report.errors,
                        "Catch-up sweep complete"
                    ),
                    Err(e) => error!(error = %e, "Catch-up sweep failed"),
                }
            })
        })?)
        .await?;
    info!("Scheduled: Daily catch-up sweep (00:30 UTC)");

    // Job 2: Stale pending-state cleanup (hourly)
    let cleanup_billing = billing.clone();
    scheduler
        .add(Job::new_async("0 0 * * * *", move |_uuid, _l| {
            let billing = cleanup_billing.clone();
            Box::pin(async move {
                if let Err(e) = billing.sweep.run_stale_cleanup().await {
                    error!(error = %e, "Stale pending cleanup failed");
                }
            })
        })?)
        .await?;
    info!("Scheduled: Stale pending cleanup (hourly)");

    // Job 3: Health check heartbeat (every 5 minutes)
    scheduler
        .add(Job::new_async("0 */5 * * * *", |_uuid, _l| {
            Box::pin(async move {
                info!("Worker heartbeat - all systems operational");
            })
        })?)
        .await?;
    info!("Scheduled: Health check heartbeat (every 5 minutes)");

    // Start the scheduler
    info!("Starting job scheduler");
    scheduler.start().await?;

    info!("Cauntr Worker started successfully with {} scheduled jobs", 3);

    // Keep the main task running
    // The scheduler runs jobs in background tasks
    loop {
        tokio::time::sleep(Duration::from_secs(3600)).await;
    }
}
