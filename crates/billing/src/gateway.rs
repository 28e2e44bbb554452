//! Paystack payment-provider gateway.
//!
//! Thin typed client over the Paystack REST API. Every operation returns
//! `BillingResult` values: provider rejections and transport failures both
//! become `BillingError::Provider`, so the lifecycle controller never sees
//! provider-specific failure shapes.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tracing::{info, warn};

use crate::config::PaystackConfig;
use crate::error::{BillingError, BillingResult};
use crate::plans;

/// Every Paystack response shares this envelope.
#[derive(Debug, Deserialize)]
struct Envelope<T> {
    status: bool,
    #[serde(default)]
    message: String,
    data: Option<T>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProviderCustomer {
    pub id: u64,
    #[serde(default)]
    pub customer_code: Option<String>,
    pub email: String,
}

#[derive(Debug, Deserialize)]
struct InitializeData {
    reference: String,
    authorization_url: String,
    access_code: String,
}

#[derive(Debug, Deserialize)]
struct VerifyData {
    status: String,
    customer: ProviderCustomer,
}

#[derive(Debug, Deserialize)]
struct AuthorizationData {
    authorization_code: String,
}

#[derive(Debug, Deserialize)]
struct SubscriptionCreateData {
    subscription_code: String,
    #[serde(default)]
    authorization: Option<AuthorizationData>,
}

#[derive(Debug, Deserialize)]
struct SubscriptionFetchData {
    #[serde(default, with = "time::serde::rfc3339::option")]
    next_payment_date: Option<OffsetDateTime>,
}

#[derive(Debug, Deserialize)]
struct PlanRef {
    #[serde(default)]
    plan_code: String,
}

#[derive(Debug, Deserialize)]
struct SubscriptionListItem {
    #[serde(default)]
    status: String,
    #[serde(default)]
    email_token: Option<String>,
    subscription_code: String,
    #[serde(default)]
    plan: Option<PlanRef>,
}

#[derive(Debug, Deserialize)]
struct RefundData {
    #[serde(default)]
    status: Option<String>,
}

/// A one-time charge that was initialized and immediately verified.
#[derive(Debug, Clone)]
pub struct InitializedTransaction {
    pub reference: String,
    pub authorization_url: String,
    pub access_code: String,
    /// Provider-reported verification status (`pending` until paid).
    pub verified_status: String,
    pub customer: ProviderCustomer,
}

/// A provider-side subscription with its resolved next payment date.
#[derive(Debug, Clone)]
pub struct CreatedSubscription {
    pub subscription_code: String,
    pub authorization_code: Option<String>,
    pub next_payment_date: Option<OffsetDateTime>,
}

/// Typed Paystack client. Cheap to clone; the inner reqwest client is
/// reference-counted.
#[derive(Clone)]
pub struct PaystackGateway {
    http: reqwest::Client,
    config: PaystackConfig,
}

impl PaystackGateway {
    pub fn new(config: PaystackConfig) -> BillingResult<Self> {
        // A hung provider call should surface as an error, not hang the
        // enclosing request forever.
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .map_err(|e| BillingError::Provider(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { http, config })
    }

    pub fn from_env() -> BillingResult<Self> {
        Self::new(PaystackConfig::from_env()?)
    }

    pub fn config(&self) -> &PaystackConfig {
        &self.config
    }

    async fn unwrap_envelope<T: DeserializeOwned>(
        response: reqwest::Response,
        operation: &str,
    ) -> BillingResult<T> {
        let envelope: Envelope<T> = response
            .json()
            .await
            .map_err(|e| BillingError::Provider(format!("{operation}: invalid response: {e}")))?;

        if !envelope.status {
            return Err(BillingError::Provider(format!(
                "{operation}: {}",
                envelope.message
            )));
        }
        envelope
            .data
            .ok_or_else(|| BillingError::Provider(format!("{operation}: response had no data")))
    }

    async fn post<B: Serialize, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
        operation: &str,
    ) -> BillingResult<T> {
        let response = self
            .http
            .post(format!("{}{}", self.config.base_url, path))
            .bearer_auth(&self.config.secret_key)
            .json(body)
            .send()
            .await
            .map_err(|e| BillingError::Provider(format!("{operation}: request failed: {e}")))?;
        Self::unwrap_envelope(response, operation).await
    }

    async fn get<T: DeserializeOwned>(&self, path: &str, operation: &str) -> BillingResult<T> {
        let response = self
            .http
            .get(format!("{}{}", self.config.base_url, path))
            .bearer_auth(&self.config.secret_key)
            .send()
            .await
            .map_err(|e| BillingError::Provider(format!("{operation}: request failed: {e}")))?;
        Self::unwrap_envelope(response, operation).await
    }

    /// Initialize a one-time transaction and verify it server-side.
    ///
    /// Two chained remote calls: initialize, then verify by reference. The
    /// verify step resolves the provider's customer identity for the email
    /// even before the charge is paid.
    pub async fn initialize_transaction(
        &self,
        email: &str,
        amount: u64,
        plan_code: Option<&str>,
    ) -> BillingResult<InitializedTransaction> {
        let mut body = json!({
            "email": email,
            "amount": amount,
            "channels": ["card"],
        });
        if let Some(code) = plan_code {
            body["plan"] = json!(code);
        }
        if let Some(callback) = &self.config.callback_url {
            body["callback_url"] = json!(callback);
        }

        let init: InitializeData = self
            .post("/transaction/initialize", &body, "initialize transaction")
            .await?;

        let verify: VerifyData = self
            .get(
                &format!("/transaction/verify/{}", init.reference),
                "verify transaction",
            )
            .await?;

        info!(
            reference = %init.reference,
            verified_status = %verify.status,
            "Initialized provider transaction"
        );

        Ok(InitializedTransaction {
            reference: init.reference,
            authorization_url: init.authorization_url,
            access_code: init.access_code,
            verified_status: verify.status,
            customer: verify.customer,
        })
    }

    /// Create a recurring subscription starting at `start_date`, then fetch
    /// it to resolve the concrete next payment date (the create response
    /// does not include it).
    pub async fn create_subscription(
        &self,
        plan_code: &str,
        customer: &str,
        start_date: OffsetDateTime,
        authorization: Option<&str>,
    ) -> BillingResult<CreatedSubscription> {
        let start = start_date
            .format(&Rfc3339)
            .map_err(|e| BillingError::Provider(format!("unformattable start date: {e}")))?;

        let mut body = json!({
            "customer": customer,
            "plan": plan_code,
            "start_date": start,
        });
        if let Some(auth) = authorization {
            body["authorization"] = json!(auth);
        }

        let created: SubscriptionCreateData = self
            .post("/subscription", &body, "create subscription")
            .await?;

        let fetched: SubscriptionFetchData = self
            .get(
                &format!("/subscription/{}", created.subscription_code),
                "fetch subscription",
            )
            .await?;

        info!(
            subscription_code = %created.subscription_code,
            plan_code = %plan_code,
            "Created provider subscription"
        );

        Ok(CreatedSubscription {
            subscription_code: created.subscription_code,
            authorization_code: created.authorization.map(|a| a.authorization_code),
            next_payment_date: fetched.next_payment_date,
        })
    }

    /// Disable the customer's active subscription.
    ///
    /// Resolves the customer by email, lists their provider subscriptions,
    /// filters to ones on a plan this system sells with status `active`,
    /// and disables the first match.
    pub async fn cancel_subscription(&self, email: &str) -> BillingResult<()> {
        let customers: Vec<ProviderCustomer> = self.get("/customer", "list customers").await?;
        let customer = customers
            .into_iter()
            .find(|c| c.email.eq_ignore_ascii_case(email))
            .ok_or(BillingError::NotFound("provider customer"))?;

        let subscriptions: Vec<SubscriptionListItem> = self
            .get(
                &format!("/subscription?customer={}", customer.id),
                "list subscriptions",
            )
            .await?;

        let active = subscriptions.into_iter().find(|s| {
            s.status == "active"
                && s.plan
                    .as_ref()
                    .is_some_and(|p| plans::is_known_plan_code(&p.plan_code))
        });

        let Some(subscription) = active else {
            warn!(email = %email, "Cancel requested but customer has no active subscriptions");
            return Err(BillingError::Provider(
                "no active subscriptions found".to_string(),
            ));
        };

        let token = subscription.email_token.unwrap_or_default();
        let body = json!({
            "code": subscription.subscription_code,
            "token": token,
        });
        let _: serde_json::Value = self
            .post("/subscription/disable", &body, "disable subscription")
            .await?;

        info!(
            email = %email,
            subscription_code = %subscription.subscription_code,
            "Disabled provider subscription"
        );
        Ok(())
    }

    /// Refund a settled transaction. Returns the provider's message.
    pub async fn refund_transaction(
        &self,
        transaction: &str,
        amount: u64,
    ) -> BillingResult<String> {
        let body = json!({
            "transaction": transaction,
            "amount": amount,
        });

        let response = self
            .http
            .post(format!("{}/refund", self.config.base_url))
            .bearer_auth(&self.config.secret_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| BillingError::Provider(format!("refund: request failed: {e}")))?;

        let envelope: Envelope<RefundData> = response
            .json()
            .await
            .map_err(|e| BillingError::Provider(format!("refund: invalid response: {e}")))?;

        if !envelope.status {
            return Err(BillingError::Provider(format!(
                "refund: {}",
                envelope.message
            )));
        }

        info!(transaction = %transaction, amount = amount, "Refund accepted by provider");
        Ok(envelope.message)
    }
}
