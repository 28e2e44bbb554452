//! Paystack webhook reconciliation.
//!
//! One event at a time, but the sequence must tolerate arbitrary order and
//! at-least-once delivery. Deduplication is an atomic claim insert on the
//! audit log keyed by the provider's event id: exactly one delivery of a
//! given event runs side effects. Failed events stay in the log as
//! `failed` and may be re-claimed on provider retry; processed, unhandled
//! and in-flight events short-circuit as duplicates. A claim stuck at
//! `processing` for more than 30 minutes counts as a crashed handler and
//! is re-claimable, so a crash mid-dispatch never wedges the event.
//!
//! Events are correlated to companies by billing email. A company that
//! changes its registered email between event emission and delivery will
//! fail reconciliation; that edge is accepted, not defended against.

use hmac::{Hmac, Mac};
use serde::Deserialize;
use serde_json::Value;
use sha2::Sha512;
use sqlx::PgPool;
use time::OffsetDateTime;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::lifecycle::{deactivation_date, LifecycleService};

type HmacSha512 = Hmac<Sha512>;

/// Terminal disposition of one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebhookOutcome {
    Processed,
    /// Event id already claimed or processed; no side effects ran.
    Duplicate,
    /// Recognized delivery, unrecognized event type. Reported as success
    /// so the provider stops retrying.
    Unhandled,
}

#[derive(Debug, Deserialize)]
struct RawEnvelope {
    event: Option<String>,
    data: Option<Value>,
}

/// A validated inbound event: type string, provider event id, raw data.
#[derive(Debug, Clone)]
pub struct InboundEvent {
    pub provider_event_id: String,
    pub event_type: String,
    pub data: Value,
}

/// Validate payload shape: `event` and `data.id` must be present.
pub fn parse_inbound(payload: &str) -> BillingResult<InboundEvent> {
    let envelope: RawEnvelope = serde_json::from_str(payload)
        .map_err(|e| BillingError::WebhookPayloadInvalid(e.to_string()))?;

    let event_type = envelope
        .event
        .ok_or_else(|| BillingError::WebhookPayloadInvalid("missing 'event' field".to_string()))?;
    let data = envelope
        .data
        .ok_or_else(|| BillingError::WebhookPayloadInvalid("missing 'data' field".to_string()))?;

    let provider_event_id = match data.get("id") {
        Some(Value::Number(n)) => n.to_string(),
        Some(Value::String(s)) if !s.is_empty() => s.clone(),
        _ => {
            return Err(BillingError::WebhookPayloadInvalid(
                "missing 'data.id' field".to_string(),
            ))
        }
    };

    Ok(InboundEvent {
        provider_event_id,
        event_type,
        data,
    })
}

#[derive(Debug, Deserialize)]
struct CustomerField {
    email: String,
}

#[derive(Debug, Deserialize)]
struct AuthorizationField {
    #[serde(default)]
    authorization_code: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChargeSucceededData {
    reference: String,
    customer: CustomerField,
    #[serde(default)]
    authorization: Option<AuthorizationField>,
}

#[derive(Debug, Deserialize)]
struct SubscriptionCreatedData {
    subscription_code: String,
    customer: CustomerField,
    #[serde(default)]
    authorization: Option<AuthorizationField>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    next_payment_date: Option<OffsetDateTime>,
}

#[derive(Debug, Deserialize)]
struct SubscriptionStatusData {
    customer: CustomerField,
    #[serde(default, with = "time::serde::rfc3339::option")]
    next_payment_date: Option<OffsetDateTime>,
}

/// Tagged view of the event types this system reconciles. Each variant
/// re-validates the fields it requires; a payload that does not match its
/// declared type is a `WebhookPayloadInvalid` error (marked `failed`,
/// never a crash).
#[derive(Debug)]
pub enum ProviderEvent {
    ChargeSucceeded(ChargeSucceeded),
    SubscriptionCreated(SubscriptionCreated),
    SubscriptionNotRenewing(SubscriptionStatusChange),
    SubscriptionDisabled(SubscriptionStatusChange),
    Unknown,
}

#[derive(Debug)]
pub struct ChargeSucceeded {
    pub email: String,
    pub reference: String,
    pub authorization_code: Option<String>,
}

#[derive(Debug)]
pub struct SubscriptionCreated {
    pub email: String,
    pub subscription_code: String,
    pub authorization_code: Option<String>,
    pub next_payment_date: Option<OffsetDateTime>,
}

#[derive(Debug)]
pub struct SubscriptionStatusChange {
    pub email: String,
    pub next_payment_date: Option<OffsetDateTime>,
}

/// Dispatch-boundary validation: raw data to the typed variant.
pub fn classify(event: &InboundEvent) -> BillingResult<ProviderEvent> {
    let invalid = |e: serde_json::Error| {
        BillingError::WebhookPayloadInvalid(format!("{}: {e}", event.event_type))
    };

    match event.event_type.as_str() {
        "charge.success" => {
            let data: ChargeSucceededData =
                serde_json::from_value(event.data.clone()).map_err(invalid)?;
            Ok(ProviderEvent::ChargeSucceeded(ChargeSucceeded {
                email: data.customer.email,
                reference: data.reference,
                authorization_code: data.authorization.and_then(|a| a.authorization_code),
            }))
        }
        "subscription.create" => {
            let data: SubscriptionCreatedData =
                serde_json::from_value(event.data.clone()).map_err(invalid)?;
            Ok(ProviderEvent::SubscriptionCreated(SubscriptionCreated {
                email: data.customer.email,
                subscription_code: data.subscription_code,
                authorization_code: data.authorization.and_then(|a| a.authorization_code),
                next_payment_date: data.next_payment_date,
            }))
        }
        "subscription.not_renew" => {
            let data: SubscriptionStatusData =
                serde_json::from_value(event.data.clone()).map_err(invalid)?;
            Ok(ProviderEvent::SubscriptionNotRenewing(
                SubscriptionStatusChange {
                    email: data.customer.email,
                    next_payment_date: data.next_payment_date,
                },
            ))
        }
        "subscription.disable" => {
            let data: SubscriptionStatusData =
                serde_json::from_value(event.data.clone()).map_err(invalid)?;
            Ok(ProviderEvent::SubscriptionDisabled(
                SubscriptionStatusChange {
                    email: data.customer.email,
                    next_payment_date: data.next_payment_date,
                },
            ))
        }
        _ => Ok(ProviderEvent::Unknown),
    }
}

/// Webhook handler: signature verification, dedup, and reconciliation of
/// company state against provider-pushed events.
#[derive(Clone)]
pub struct WebhookHandler {
    pool: PgPool,
    lifecycle: LifecycleService,
    secret: String,
}

impl WebhookHandler {
    pub fn new(pool: PgPool, lifecycle: LifecycleService, secret: String) -> Self {
        Self {
            pool,
            lifecycle,
            secret,
        }
    }

    /// Verify the `x-paystack-signature` header: HMAC-SHA512 hex of the
    /// raw body under the provider secret. Constant-time comparison.
    pub fn verify_signature(&self, body: &[u8], signature: &str) -> BillingResult<()> {
        verify_signature(&self.secret, body, signature)
    }

    /// Process one raw (already signature-verified) webhook body.
    pub async fn handle_event(&self, payload: &str) -> BillingResult<WebhookOutcome> {
        let event = parse_inbound(payload)?;

        // Atomic idempotency claim: the insert either creates the audit row
        // (exclusive processing rights) or re-claims a previously failed
        // attempt. A `processing` claim older than 30 minutes is treated as
        // a crashed handler and re-claimed too; any other existing row
        // means a duplicate delivery.
        let claimed: Option<(Uuid,)> = sqlx::query_as(
            r#"
            INSERT INTO webhook_events (provider_event_id, event_type, payload, status, attempts)
            VALUES ($1, $2, $3::jsonb, 'processing', 1)
            ON CONFLICT (provider_event_id) DO UPDATE SET
                status = 'processing',
                attempts = webhook_events.attempts + 1,
                claimed_at = NOW()
            WHERE webhook_events.status = 'failed'
               OR (webhook_events.status = 'processing'
                   AND webhook_events.claimed_at < NOW() - INTERVAL '30 minutes')
            RETURNING id
            "#,
        )
        .bind(&event.provider_event_id)
        .bind(&event.event_type)
        .bind(payload)
        .fetch_optional(&self.pool)
        .await?;

        if claimed.is_none() {
            info!(
                provider_event_id = %event.provider_event_id,
                event_type = %event.event_type,
                "Duplicate webhook event, skipping"
            );
            return Ok(WebhookOutcome::Duplicate);
        }

        info!(
            provider_event_id = %event.provider_event_id,
            event_type = %event.event_type,
            "Processing webhook event"
        );

        match self.dispatch(&event).await {
            Ok(WebhookOutcome::Unhandled) => {
                self.mark(&event.provider_event_id, "unhandled").await;
                Ok(WebhookOutcome::Unhandled)
            }
            Ok(outcome) => {
                self.mark(&event.provider_event_id, "processed").await;
                Ok(outcome)
            }
            Err(e) => {
                // Company-state changes rolled back with their transaction;
                // the failed audit row persists and is re-claimable on the
                // provider's retry.
                self.mark(&event.provider_event_id, "failed").await;
                Err(e)
            }
        }
    }

    async fn mark(&self, provider_event_id: &str, status: &str) {
        let result = sqlx::query(
            "UPDATE webhook_events \
             SET status = $2, processed_at = CASE WHEN $2 = 'processed' THEN NOW() ELSE processed_at END \
             WHERE provider_event_id = $1",
        )
        .bind(provider_event_id)
        .bind(status)
        .execute(&self.pool)
        .await;

        if let Err(e) = result {
            tracing::error!(
                provider_event_id = %provider_event_id,
                status = %status,
                error = %e,
                "Failed to update webhook audit row"
            );
        }
    }

    async fn dispatch(&self, event: &InboundEvent) -> BillingResult<WebhookOutcome> {
        match classify(event)? {
            ProviderEvent::ChargeSucceeded(charge) => {
                self.handle_charge_succeeded(charge).await?;
                Ok(WebhookOutcome::Processed)
            }
            ProviderEvent::SubscriptionCreated(sub) => {
                self.handle_subscription_created(sub).await?;
                Ok(WebhookOutcome::Processed)
            }
            ProviderEvent::SubscriptionNotRenewing(change) => {
                self.handle_subscription_not_renewing(change).await?;
                Ok(WebhookOutcome::Processed)
            }
            ProviderEvent::SubscriptionDisabled(change) => {
                self.handle_subscription_disabled(change).await?;
                Ok(WebhookOutcome::Processed)
            }
            ProviderEvent::Unknown => {
                info!(event_type = %event.event_type, "Unhandled webhook event type");
                Ok(WebhookOutcome::Unhandled)
            }
        }
    }

    /// Persist the authorization code and transaction reference from a
    /// successful charge.
    async fn handle_charge_succeeded(&self, charge: ChargeSucceeded) -> BillingResult<()> {
        let mut tx = self.pool.begin().await?;
        let result = sqlx::query(
            r#"
            UPDATE companies
            SET provider_transaction_reference = $2,
                provider_authorization_code = COALESCE($3, provider_authorization_code),
                updated_at = NOW()
            WHERE LOWER(email) = LOWER($1)
            "#,
        )
        .bind(&charge.email)
        .bind(&charge.reference)
        .bind(charge.authorization_code.as_deref())
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(BillingError::NotFound("company"));
        }
        tx.commit().await?;

        info!(email = %charge.email, reference = %charge.reference, "Charge recorded");
        Ok(())
    }

    /// Persist the provider subscription and open the new billing cycle.
    async fn handle_subscription_created(&self, sub: SubscriptionCreated) -> BillingResult<()> {
        let now = OffsetDateTime::now_utc();
        let mut tx = self.pool.begin().await?;
        let result = sqlx::query(
            r#"
            UPDATE companies
            SET provider_subscription_code = $2,
                provider_authorization_code = COALESCE($3, provider_authorization_code),
                subscription_status = 'active',
                cycle_started_at = $4,
                cycle_ends_at = COALESCE($5, cycle_ends_at),
                can_update = TRUE,
                can_cancel = TRUE,
                updated_at = NOW()
            WHERE LOWER(email) = LOWER($1)
            "#,
        )
        .bind(&sub.email)
        .bind(&sub.subscription_code)
        .bind(sub.authorization_code.as_deref())
        .bind(now)
        .bind(sub.next_payment_date)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(BillingError::NotFound("company"));
        }
        tx.commit().await?;

        info!(
            email = %sub.email,
            subscription_code = %sub.subscription_code,
            "Provider subscription recorded"
        );
        Ok(())
    }

    /// The provider will not renew this subscription. With a known final
    /// payment date the company deactivates after that date plus the grace
    /// window; without one it expires immediately.
    async fn handle_subscription_not_renewing(
        &self,
        change: SubscriptionStatusChange,
    ) -> BillingResult<()> {
        match change.next_payment_date {
            Some(final_date) => {
                let deactivation = deactivation_date(final_date);
                let mut tx = self.pool.begin().await?;
                let row: Option<(Uuid,)> = sqlx::query_as(
                    r#"
                    UPDATE companies
                    SET scheduled_deactivation = $2,
                        cycle_ends_at = $2,
                        can_update = FALSE,
                        can_cancel = FALSE,
                        updated_at = NOW()
                    WHERE LOWER(email) = LOWER($1)
                    RETURNING id
                    "#,
                )
                .bind(&change.email)
                .bind(deactivation)
                .fetch_optional(&mut *tx)
                .await?;
                tx.commit().await?;

                let Some((company_id,)) = row else {
                    return Err(BillingError::NotFound("company"));
                };
                self.lifecycle
                    .schedule_deactivation_job(company_id, deactivation)
                    .await?;

                info!(
                    email = %change.email,
                    deactivation_date = %deactivation,
                    "Non-renewal recorded; deactivation scheduled"
                );
            }
            None => {
                let result = sqlx::query(
                    r#"
                    UPDATE companies
                    SET subscription_status = 'expired', updated_at = NOW()
                    WHERE LOWER(email) = LOWER($1)
                    "#,
                )
                .bind(&change.email)
                .execute(&self.pool)
                .await?;

                if result.rows_affected() == 0 {
                    return Err(BillingError::NotFound("company"));
                }
                info!(email = %change.email, "Non-renewal without final date; marked expired");
            }
        }
        Ok(())
    }

    /// The provider disabled the subscription on its side.
    async fn handle_subscription_disabled(
        &self,
        change: SubscriptionStatusChange,
    ) -> BillingResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE companies
            SET subscription_status = 'expired',
                provider_subscription_code = NULL,
                provider_authorization_code = NULL,
                updated_at = NOW()
            WHERE LOWER(email) = LOWER($1)
            "#,
        )
        .bind(&change.email)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(BillingError::NotFound("company"));
        }

        info!(email = %change.email, "Provider-side disable recorded; marked expired");
        Ok(())
    }
}

/// Verify a webhook signature: HMAC-SHA512 hex of the raw body under the
/// provider secret, compared in constant time.
pub fn verify_signature(secret: &str, body: &[u8], signature: &str) -> BillingResult<()> {
    let mut mac = HmacSha512::new_from_slice(secret.as_bytes())
        .map_err(|_| BillingError::WebhookSignatureInvalid)?;
    mac.update(body);

    let expected = hex::decode(signature).map_err(|_| {
        warn!("Webhook signature header is not valid hex");
        BillingError::WebhookSignatureInvalid
    })?;
    mac.verify_slice(&expected)
        .map_err(|_| BillingError::WebhookSignatureInvalid)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use time::macros::datetime;

    fn sign(secret: &str, body: &[u8]) -> String {
        let mut mac = HmacSha512::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(body);
        hex::encode(mac.finalize().into_bytes())
    }

    #[test]
    fn signature_round_trip_verifies() {
        let body = br#"{"event":"charge.success","data":{"id":1}}"#;
        let signature = sign("whsec_test", body);
        assert!(verify_signature("whsec_test", body, &signature).is_ok());
    }

    #[test]
    fn tampered_body_fails_verification() {
        let signature = sign("whsec_test", b"original");
        assert!(matches!(
            verify_signature("whsec_test", b"tampered", &signature),
            Err(BillingError::WebhookSignatureInvalid)
        ));
    }

    #[test]
    fn wrong_secret_fails_verification() {
        let body = b"payload";
        let signature = sign("secret_a", body);
        assert!(verify_signature("secret_b", body, &signature).is_err());
    }

    #[test]
    fn non_hex_signature_fails_verification() {
        assert!(verify_signature("whsec_test", b"payload", "not-hex!").is_err());
    }

    #[test]
    fn parse_requires_event_field() {
        let err = parse_inbound(r#"{"data":{"id":1}}"#).unwrap_err();
        assert!(matches!(err, BillingError::WebhookPayloadInvalid(_)));
    }

    #[test]
    fn parse_requires_data_id() {
        let err = parse_inbound(r#"{"event":"charge.success","data":{"ref":"x"}}"#).unwrap_err();
        assert!(matches!(err, BillingError::WebhookPayloadInvalid(_)));
    }

    #[test]
    fn parse_accepts_numeric_and_string_ids() {
        let numeric = parse_inbound(r#"{"event":"charge.success","data":{"id":302}}"#).unwrap();
        assert_eq!(numeric.provider_event_id, "302");

        let string = parse_inbound(r#"{"event":"charge.success","data":{"id":"evt_1"}}"#).unwrap();
        assert_eq!(string.provider_event_id, "evt_1");
    }

    #[test]
    fn classifies_charge_success() {
        let event = parse_inbound(
            r#"{"event":"charge.success","data":{
                "id":302,
                "reference":"ref_9",
                "customer":{"email":"shop@example.com"},
                "authorization":{"authorization_code":"AUTH_5"}}}"#,
        )
        .unwrap();

        match classify(&event).unwrap() {
            ProviderEvent::ChargeSucceeded(charge) => {
                assert_eq!(charge.email, "shop@example.com");
                assert_eq!(charge.reference, "ref_9");
                assert_eq!(charge.authorization_code.as_deref(), Some("AUTH_5"));
            }
            other => panic!("expected charge.success, got {other:?}"),
        }
    }

    #[test]
    fn classifies_subscription_create_with_next_payment_date() {
        let event = parse_inbound(
            r#"{"event":"subscription.create","data":{
                "id":17,
                "subscription_code":"SUB_8",
                "customer":{"email":"shop@example.com"},
                "next_payment_date":"2024-07-01T00:00:00Z"}}"#,
        )
        .unwrap();

        match classify(&event).unwrap() {
            ProviderEvent::SubscriptionCreated(sub) => {
                assert_eq!(sub.subscription_code, "SUB_8");
                assert_eq!(sub.next_payment_date, Some(datetime!(2024-07-01 00:00 UTC)));
            }
            other => panic!("expected subscription.create, got {other:?}"),
        }
    }

    #[test]
    fn mismatched_shape_is_invalid_not_unknown() {
        // subscription.create without its required subscription_code
        let event = parse_inbound(
            r#"{"event":"subscription.create","data":{
                "id":17,"customer":{"email":"shop@example.com"}}}"#,
        )
        .unwrap();

        assert!(matches!(
            classify(&event),
            Err(BillingError::WebhookPayloadInvalid(_))
        ));
    }

    #[test]
    fn unknown_event_type_is_not_an_error() {
        let event = parse_inbound(r#"{"event":"transfer.success","data":{"id":5}}"#).unwrap();
        assert!(matches!(classify(&event).unwrap(), ProviderEvent::Unknown));
    }
}
