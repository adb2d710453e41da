use anyhow::{anyhow, Context};
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use thiserror::Error;

use crate::serde_stripe::{de_i64_or_zero, de_opt_timestamp};

const SIGNATURE_TOLERANCE_SECS: u64 = 300;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SignatureError {
    #[error("STRIPE_WEBHOOK_SECRET is not configured.")]
    NotConfigured,
    #[error("Missing Stripe timestamp in signature.")]
    MissingTimestamp,
    #[error("Missing Stripe v1 signature.")]
    MissingSignature,
    #[error("Stripe signature timestamp outside tolerance.")]
    OutsideTolerance,
    #[error("Invalid Stripe signature.")]
    Mismatch,
}

#[derive(Clone)]
pub struct StripeApi {
    http: reqwest::Client,
    secret_key: Option<String>,
    webhook_secret: Option<String>,
    base_url: String,
}

impl StripeApi {
    pub fn new(secret_key: Option<String>, webhook_secret: Option<String>) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .build()
            .context("failed to create Stripe HTTP client")?;

        Ok(Self {
            http,
            secret_key,
            webhook_secret,
            base_url: "https://api.stripe.com/v1".to_string(),
        })
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn verify_webhook_signature(
        &self,
        signature_header: &str,
        payload: &[u8],
    ) -> Result<(), SignatureError> {
        self.verify_webhook_signature_at(signature_header, payload, Utc::now().timestamp())
    }

    fn verify_webhook_signature_at(
        &self,
        signature_header: &str,
        payload: &[u8],
        now: i64,
    ) -> Result<(), SignatureError> {
        let webhook_secret = self
            .webhook_secret
            .as_ref()
            .ok_or(SignatureError::NotConfigured)?;

        let mut timestamp: Option<i64> = None;
        let mut v1_signatures: Vec<&str> = Vec::new();

        for part in signature_header.split(',') {
            let mut pieces = part.trim().splitn(2, '=');
            let key = pieces.next().unwrap_or_default();
            let value = pieces.next().unwrap_or_default();
            if key == "t" {
                timestamp = value.parse::<i64>().ok();
            } else if key == "v1" {
                v1_signatures.push(value);
            }
        }

        let timestamp = timestamp.ok_or(SignatureError::MissingTimestamp)?;
        if v1_signatures.is_empty() {
            return Err(SignatureError::MissingSignature);
        }

        if now.abs_diff(timestamp) > SIGNATURE_TOLERANCE_SECS {
            return Err(SignatureError::OutsideTolerance);
        }

        let expected = sign_payload(webhook_secret, timestamp, payload);

        let is_match = v1_signatures
            .into_iter()
            .any(|candidate| expected.as_bytes().ct_eq(candidate.as_bytes()).into());

        if !is_match {
            return Err(SignatureError::Mismatch);
        }

        Ok(())
    }

    pub async fn create_customer(&self, email: &str, user_id: &str) -> anyhow::Result<StripeCustomer> {
        let params = vec![
            ("email".to_string(), email.to_string()),
            ("metadata[userId]".to_string(), user_id.to_string()),
        ];
        self.post_form("customers", &params).await
    }

    pub async fn list_customers_by_email(&self, email: &str) -> anyhow::Result<Vec<StripeCustomer>> {
        let list: StripeList<StripeCustomer> = self
            .get_json(
                "customers",
                &[("email", email), ("expand[]", "data.subscriptions")],
            )
            .await?;
        Ok(list.data)
    }

    pub async fn retrieve_customer(&self, customer_id: &str) -> anyhow::Result<StripeCustomer> {
        self.get_json(
            &format!("customers/{}", customer_id),
            &[("expand[]", "subscriptions"), ("expand[]", "sources")],
        )
        .await
    }

    pub async fn update_customer_source(
        &self,
        customer_id: &str,
        source_token: &str,
    ) -> anyhow::Result<StripeCustomer> {
        let params = vec![
            ("source".to_string(), source_token.to_string()),
            ("expand[]".to_string(), "sources".to_string()),
        ];
        self.post_form(&format!("customers/{}", customer_id), &params)
            .await
    }

    pub async fn create_subscription(
        &self,
        customer_id: &str,
        plan_id: &str,
    ) -> anyhow::Result<StripeSubscription> {
        let params = vec![
            ("customer".to_string(), customer_id.to_string()),
            ("trial_from_plan".to_string(), "true".to_string()),
            ("items[0][plan]".to_string(), plan_id.to_string()),
            (
                "expand[]".to_string(),
                "latest_invoice.payment_intent".to_string(),
            ),
        ];
        self.post_form("subscriptions", &params).await
    }

    pub async fn retrieve_subscription(
        &self,
        subscription_id: &str,
    ) -> anyhow::Result<StripeSubscription> {
        self.get_json(&format!("subscriptions/{}", subscription_id), &[])
            .await
    }

    pub async fn set_subscription_default_source(
        &self,
        subscription_id: &str,
        source_id: &str,
    ) -> anyhow::Result<StripeSubscription> {
        let params = vec![("default_source".to_string(), source_id.to_string())];
        self.post_form(&format!("subscriptions/{}", subscription_id), &params)
            .await
    }

    /// Replaces the plan of the subscription's first item and clears any pending cancellation.
    pub async fn change_subscription_plan(
        &self,
        subscription_id: &str,
        item_id: &str,
        plan_id: &str,
    ) -> anyhow::Result<StripeSubscription> {
        let params = vec![
            ("cancel_at_period_end".to_string(), "false".to_string()),
            ("items[0][id]".to_string(), item_id.to_string()),
            ("items[0][plan]".to_string(), plan_id.to_string()),
            (
                "expand[]".to_string(),
                "latest_invoice.payment_intent".to_string(),
            ),
        ];
        self.post_form(&format!("subscriptions/{}", subscription_id), &params)
            .await
    }

    pub async fn cancel_subscription_at_period_end(
        &self,
        subscription_id: &str,
    ) -> anyhow::Result<StripeSubscription> {
        let params = vec![("cancel_at_period_end".to_string(), "true".to_string())];
        self.post_form(&format!("subscriptions/{}", subscription_id), &params)
            .await
    }

    pub async fn delete_subscription(
        &self,
        subscription_id: &str,
    ) -> anyhow::Result<StripeSubscription> {
        self.delete(&format!("subscriptions/{}", subscription_id))
            .await
    }

    pub async fn list_plans(&self) -> anyhow::Result<Vec<StripePlan>> {
        let list: StripeList<StripePlan> = self.get_json("plans", &[("active", "true")]).await?;
        Ok(list.data)
    }

    pub async fn create_billing_portal_session(
        &self,
        customer_id: &str,
        return_url: &str,
    ) -> anyhow::Result<StripeRedirectSession> {
        let params = vec![
            ("customer".to_string(), customer_id.to_string()),
            ("return_url".to_string(), return_url.to_string()),
        ];

        self.post_form("billing_portal/sessions", &params).await
    }

    pub async fn create_checkout_session(
        &self,
        customer: CheckoutCustomer<'_>,
        price_id: &str,
        success_url: &str,
        cancel_url: &str,
    ) -> anyhow::Result<StripeRedirectSession> {
        let mut params = vec![
            ("line_items[0][price]".to_string(), price_id.to_string()),
            ("line_items[0][quantity]".to_string(), "1".to_string()),
            ("mode".to_string(), "subscription".to_string()),
            ("success_url".to_string(), success_url.to_string()),
            ("cancel_url".to_string(), cancel_url.to_string()),
        ];
        match customer {
            CheckoutCustomer::Existing(customer_id) => {
                params.push(("customer".to_string(), customer_id.to_string()))
            }
            CheckoutCustomer::Email(email) => {
                params.push(("customer_email".to_string(), email.to_string()))
            }
        }

        self.post_form("checkout/sessions", &params).await
    }

    fn require_secret_key(&self) -> anyhow::Result<&str> {
        self.secret_key
            .as_deref()
            .filter(|value| !value.trim().is_empty())
            .ok_or_else(|| anyhow!("STRIPE_SECRET_KEY is not configured."))
    }

    async fn post_form<T: DeserializeOwned>(
        &self,
        path: &str,
        params: &[(String, String)],
    ) -> anyhow::Result<T> {
        let key = self.require_secret_key()?;
        let url = format!("{}/{}", self.base_url, path);

        let response = self
            .http
            .post(url)
            .bearer_auth(key)
            .form(params)
            .send()
            .await
            .with_context(|| format!("Stripe POST failed for {}", path))?;

        parse_stripe_response(response, path).await
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, &str)],
    ) -> anyhow::Result<T> {
        let key = self.require_secret_key()?;
        let url = format!("{}/{}", self.base_url, path);

        let response = self
            .http
            .get(url)
            .bearer_auth(key)
            .query(query)
            .send()
            .await
            .with_context(|| format!("Stripe GET failed for {}", path))?;

        parse_stripe_response(response, path).await
    }

    async fn delete<T: DeserializeOwned>(&self, path: &str) -> anyhow::Result<T> {
        let key = self.require_secret_key()?;
        let url = format!("{}/{}", self.base_url, path);

        let response = self
            .http
            .delete(url)
            .bearer_auth(key)
            .send()
            .await
            .with_context(|| format!("Stripe DELETE failed for {}", path))?;

        parse_stripe_response(response, path).await
    }
}

pub fn sign_payload(secret: &str, timestamp: i64, payload: &[u8]) -> String {
    let mut mac =
        Hmac::<Sha256>::new_from_slice(secret.as_bytes()).expect("HMAC accepts keys of any size");
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(payload);
    hex::encode(mac.finalize().into_bytes())
}

async fn parse_stripe_response<T: DeserializeOwned>(
    response: reqwest::Response,
    path: &str,
) -> anyhow::Result<T> {
    let status = response.status();
    let text = response
        .text()
        .await
        .with_context(|| format!("failed to read Stripe response body for {}", path))?;

    if !status.is_success() {
        return Err(anyhow!(
            "Stripe API {} failed with status {}: {}",
            path,
            status,
            text
        ));
    }

    serde_json::from_str::<T>(&text)
        .with_context(|| format!("failed to decode Stripe response for {}", path))
}

pub enum CheckoutCustomer<'a> {
    Existing(&'a str),
    Email(&'a str),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StripeList<T> {
    #[serde(default = "Vec::new")]
    pub data: Vec<T>,
}

impl<T> Default for StripeList<T> {
    fn default() -> Self {
        Self { data: Vec::new() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StripeCustomer {
    pub id: String,
    #[serde(default)]
    pub deleted: bool,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub subscriptions: Option<StripeList<StripeSubscription>>,
    #[serde(default)]
    pub sources: Option<StripeList<StripeSource>>,
}

impl StripeCustomer {
    pub fn first_subscription(&self) -> Option<&StripeSubscription> {
        self.subscriptions
            .as_ref()
            .and_then(|list| list.data.first())
    }

    pub fn first_source(&self) -> Option<&StripeSource> {
        self.sources.as_ref().and_then(|list| list.data.first())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StripeSource {
    pub id: String,
    #[serde(default)]
    pub brand: Option<String>,
    #[serde(default)]
    pub last4: Option<String>,
    #[serde(default)]
    pub exp_month: Option<u32>,
    #[serde(default)]
    pub exp_year: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StripeSubscription {
    pub id: String,
    #[serde(default)]
    pub customer: Option<IdOrObject>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default, deserialize_with = "de_opt_timestamp")]
    pub current_period_end: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "de_opt_timestamp")]
    pub trial_end: Option<DateTime<Utc>>,
    #[serde(default)]
    pub cancel_at_period_end: bool,
    #[serde(default)]
    pub plan: Option<StripePlanRef>,
    #[serde(default)]
    pub items: StripeList<StripeSubscriptionItem>,
}

impl StripeSubscription {
    /// Plan id from the legacy `plan` field, falling back to the first item.
    pub fn plan_id(&self) -> Option<String> {
        self.plan
            .as_ref()
            .map(|plan| plan.id.clone())
            .or_else(|| {
                self.items
                    .data
                    .first()
                    .and_then(|item| item.plan.as_ref().or(item.price.as_ref()))
                    .map(|plan| plan.id.clone())
            })
    }

    pub fn first_item_id(&self) -> Option<&str> {
        self.items.data.first().map(|item| item.id.as_str())
    }

    /// Statuses that still grant access. Objects without a status are treated as live.
    pub fn is_live(&self) -> bool {
        matches!(
            self.status.as_deref(),
            None | Some("active") | Some("trialing") | Some("past_due")
        )
    }

    /// The initial payment never went through, so the customer was never billed.
    pub fn never_paid(&self) -> bool {
        matches!(
            self.status.as_deref(),
            Some("incomplete") | Some("incomplete_expired")
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StripeSubscriptionItem {
    pub id: String,
    #[serde(default)]
    pub plan: Option<StripePlanRef>,
    #[serde(default)]
    pub price: Option<StripePlanRef>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StripePlanRef {
    pub id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StripePlan {
    pub id: String,
    #[serde(default)]
    pub nickname: Option<String>,
    #[serde(default, deserialize_with = "de_i64_or_zero")]
    pub amount: i64,
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default)]
    pub interval: Option<String>,
    #[serde(default)]
    pub trial_period_days: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StripeRedirectSession {
    pub url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum IdOrObject {
    Id(String),
    Object { id: String },
}

impl IdOrObject {
    pub fn id(&self) -> &str {
        match self {
            IdOrObject::Id(value) => value,
            IdOrObject::Object { id } => id,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StripeEvent {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default, deserialize_with = "de_opt_timestamp")]
    pub created: Option<DateTime<Utc>>,
    pub data: StripeEventData,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StripeEventData {
    pub object: serde_json::Value,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StripeInvoice {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub customer: Option<IdOrObject>,
    #[serde(default, deserialize_with = "de_i64_or_zero")]
    pub amount_due: i64,
    #[serde(default, deserialize_with = "de_i64_or_zero")]
    pub amount_paid: i64,
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default)]
    pub hosted_invoice_url: Option<String>,
    #[serde(default, deserialize_with = "de_opt_timestamp")]
    pub next_payment_attempt: Option<DateTime<Utc>>,
}
