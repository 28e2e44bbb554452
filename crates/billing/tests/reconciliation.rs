//! Database-backed reconciliation tests.
//!
//! Exercise the transition functions and the webhook dedup against a real
//! Postgres schema: idempotent re-application, duplicate deliveries,
//! crashed-claim recovery, and per-company sweep isolation. The gateway is
//! never reached here; these flows are local-state only.

#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

use sqlx::PgPool;
use uuid::Uuid;

use cauntr_billing::{
    ApplyOutcome, CompanyStore, DeferredScheduler, LifecycleService, PaystackConfig,
    PaystackGateway, SweepService, WebhookHandler, WebhookOutcome,
};

async fn services(pool: PgPool) -> (LifecycleService, WebhookHandler, SweepService) {
    // Unroutable base URL: these tests must never hit the provider.
    let gateway = PaystackGateway::new(PaystackConfig {
        secret_key: "sk_test_secret".to_string(),
        base_url: "http://127.0.0.1:1".to_string(),
        callback_url: None,
    })
    .unwrap();
    let store = CompanyStore::new(pool.clone());
    let scheduler = DeferredScheduler::new().await.unwrap();
    let lifecycle = LifecycleService::new(gateway, store.clone(), scheduler);
    let webhooks = WebhookHandler::new(pool, lifecycle.clone(), "sk_test_secret".to_string());
    let sweep = SweepService::new(store, lifecycle.clone());
    (lifecycle, webhooks, sweep)
}

async fn insert_company(pool: &PgPool, email: &str) -> Uuid {
    let id = Uuid::new_v4();
    sqlx::query(
        r#"
        INSERT INTO companies
            (id, tenant_id, name, email,
             subscription_tier, billing_cycle, subscription_status,
             cycle_started_at, cycle_ends_at)
        VALUES ($1, $2, 'Acme Stores', $3,
                'basic', 'monthly', 'active',
                NOW(), NOW() + INTERVAL '10 days')
        "#,
    )
    .bind(id)
    .bind(Uuid::new_v4())
    .bind(email)
    .execute(pool)
    .await
    .unwrap();
    id
}

#[sqlx::test(migrations = "../../migrations")]
async fn applying_a_pending_update_twice_is_a_noop(pool: PgPool) {
    let (lifecycle, _, _) = services(pool.clone()).await;
    let id = insert_company(&pool, "acme@example.com").await;
    sqlx::query(
        "UPDATE companies SET pending_plan_update = 'team_yearly', \
         next_billing_date = NOW() - INTERVAL '1 hour' WHERE id = $1",
    )
    .bind(id)
    .execute(&pool)
    .await
    .unwrap();

    let first = lifecycle.apply_pending_subscription(id).await.unwrap();
    assert!(matches!(first, ApplyOutcome::Applied(_)));

    let second = lifecycle.apply_pending_subscription(id).await.unwrap();
    assert_eq!(second, ApplyOutcome::Noop);

    let (tier, cycle, pending): (String, String, Option<String>) = sqlx::query_as(
        "SELECT subscription_tier, billing_cycle, pending_plan_update \
         FROM companies WHERE id = $1",
    )
    .bind(id)
    .fetch_one(&pool)
    .await
    .unwrap();
    assert_eq!(tier, "team");
    assert_eq!(cycle, "yearly");
    assert!(pending.is_none());
}

#[sqlx::test(migrations = "../../migrations")]
async fn duplicate_webhook_delivery_runs_side_effects_once(pool: PgPool) {
    let (_, webhooks, _) = services(pool.clone()).await;
    let id = insert_company(&pool, "shop@example.com").await;

    let payload = r#"{"event":"subscription.create","data":{
        "id":9001,
        "subscription_code":"SUB_44",
        "customer":{"email":"shop@example.com"},
        "next_payment_date":"2030-01-01T00:00:00Z"}}"#;

    assert_eq!(
        webhooks.handle_event(payload).await.unwrap(),
        WebhookOutcome::Processed
    );
    assert_eq!(
        webhooks.handle_event(payload).await.unwrap(),
        WebhookOutcome::Duplicate
    );

    let (status, attempts): (String, i32) = sqlx::query_as(
        "SELECT status, attempts FROM webhook_events WHERE provider_event_id = '9001'",
    )
    .fetch_one(&pool)
    .await
    .unwrap();
    assert_eq!(status, "processed");
    assert_eq!(attempts, 1);

    let (sub_code,): (Option<String>,) =
        sqlx::query_as("SELECT provider_subscription_code FROM companies WHERE id = $1")
            .bind(id)
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(sub_code.as_deref(), Some("SUB_44"));
}

#[sqlx::test(migrations = "../../migrations")]
async fn stale_processing_claims_are_reclaimed(pool: PgPool) {
    let (_, webhooks, _) = services(pool.clone()).await;
    insert_company(&pool, "shop@example.com").await;

    let payload = r#"{"event":"charge.success","data":{
        "id":777,
        "reference":"ref_77",
        "customer":{"email":"shop@example.com"}}}"#;

    // A claim whose handler died an hour ago without marking the row
    sqlx::query(
        "INSERT INTO webhook_events \
             (provider_event_id, event_type, payload, status, attempts, claimed_at) \
         VALUES ('777', 'charge.success', $1::jsonb, 'processing', 1, \
                 NOW() - INTERVAL '1 hour')",
    )
    .bind(payload)
    .execute(&pool)
    .await
    .unwrap();

    assert_eq!(
        webhooks.handle_event(payload).await.unwrap(),
        WebhookOutcome::Processed
    );

    let (status, attempts): (String, i32) = sqlx::query_as(
        "SELECT status, attempts FROM webhook_events WHERE provider_event_id = '777'",
    )
    .fetch_one(&pool)
    .await
    .unwrap();
    assert_eq!(status, "processed");
    assert_eq!(attempts, 2);
}

#[sqlx::test(migrations = "../../migrations")]
async fn fresh_processing_claims_stay_exclusive(pool: PgPool) {
    let (_, webhooks, _) = services(pool.clone()).await;
    insert_company(&pool, "shop@example.com").await;

    let payload = r#"{"event":"charge.success","data":{
        "id":778,
        "reference":"ref_78",
        "customer":{"email":"shop@example.com"}}}"#;

    // An in-flight claim from moments ago must not be stolen
    sqlx::query(
        "INSERT INTO webhook_events \
             (provider_event_id, event_type, payload, status, attempts) \
         VALUES ('778', 'charge.success', $1::jsonb, 'processing', 1)",
    )
    .bind(payload)
    .execute(&pool)
    .await
    .unwrap();

    assert_eq!(
        webhooks.handle_event(payload).await.unwrap(),
        WebhookOutcome::Duplicate
    );
}

#[sqlx::test(migrations = "../../migrations")]
async fn stale_deactivation_callback_spares_live_subscription(pool: PgPool) {
    let (lifecycle, _, _) = services(pool.clone()).await;
    let id = insert_company(&pool, "acme@example.com").await;

    // No deactivation is scheduled (as after a reactivation); a leftover
    // callback firing now must not touch the row.
    lifecycle.deactivate_company(id).await.unwrap();

    let (status, tier): (String, String) = sqlx::query_as(
        "SELECT subscription_status, subscription_tier FROM companies WHERE id = $1",
    )
    .bind(id)
    .fetch_one(&pool)
    .await
    .unwrap();
    assert_eq!(status, "active");
    assert_eq!(tier, "basic");
}

#[sqlx::test(migrations = "../../migrations")]
async fn scheduled_deactivation_finalizes_exactly_once(pool: PgPool) {
    let (lifecycle, _, _) = services(pool.clone()).await;
    let id = insert_company(&pool, "acme@example.com").await;
    sqlx::query(
        "UPDATE companies SET scheduled_deactivation = NOW() - INTERVAL '1 minute', \
         provider_subscription_code = 'SUB_9' WHERE id = $1",
    )
    .bind(id)
    .execute(&pool)
    .await
    .unwrap();

    lifecycle.deactivate_company(id).await.unwrap();

    let (status, tier, sub_code): (String, String, Option<String>) = sqlx::query_as(
        "SELECT subscription_status, subscription_tier, provider_subscription_code \
         FROM companies WHERE id = $1",
    )
    .bind(id)
    .fetch_one(&pool)
    .await
    .unwrap();
    assert_eq!(status, "cancelled");
    assert_eq!(tier, "free");
    assert!(sub_code.is_none());

    // The company pays again; a duplicate callback fires afterwards.
    sqlx::query(
        "UPDATE companies SET subscription_status = 'active', subscription_tier = 'team', \
         provider_subscription_code = 'SUB_10' WHERE id = $1",
    )
    .bind(id)
    .execute(&pool)
    .await
    .unwrap();

    lifecycle.deactivate_company(id).await.unwrap();

    let (status, tier, sub_code): (String, String, Option<String>) = sqlx::query_as(
        "SELECT subscription_status, subscription_tier, provider_subscription_code \
         FROM companies WHERE id = $1",
    )
    .bind(id)
    .fetch_one(&pool)
    .await
    .unwrap();
    assert_eq!(status, "active");
    assert_eq!(tier, "team");
    assert_eq!(sub_code.as_deref(), Some("SUB_10"));
}

#[sqlx::test(migrations = "../../migrations")]
async fn sweep_isolates_per_company_failures(pool: PgPool) {
    let (_, _, sweep) = services(pool.clone()).await;
    let bad = insert_company(&pool, "bad@example.com").await;
    let good = insert_company(&pool, "good@example.com").await;

    // An unparseable pending value must not block the sibling's update.
    sqlx::query(
        "UPDATE companies SET pending_plan_update = 'platinum_weekly', \
         next_billing_date = NOW() - INTERVAL '1 day' WHERE id = $1",
    )
    .bind(bad)
    .execute(&pool)
    .await
    .unwrap();
    sqlx::query(
        "UPDATE companies SET pending_plan_update = 'team_monthly', \
         next_billing_date = NOW() - INTERVAL '1 day' WHERE id = $1",
    )
    .bind(good)
    .execute(&pool)
    .await
    .unwrap();

    let report = sweep.run_catch_up().await.unwrap();
    assert_eq!(report.updates_applied, 1);
    assert_eq!(report.errors, 1);

    let (tier,): (String,) =
        sqlx::query_as("SELECT subscription_tier FROM companies WHERE id = $1")
            .bind(good)
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(tier, "team");

    // The failed row is untouched and will be retried next pass
    let (pending,): (Option<String>,) =
        sqlx::query_as("SELECT pending_plan_update FROM companies WHERE id = $1")
            .bind(bad)
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(pending.as_deref(), Some("platinum_weekly"));
}
