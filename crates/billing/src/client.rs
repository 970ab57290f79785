//! Stripe REST API client
//!
//! Thin reqwest wrapper over the handful of Stripe endpoints the billing
//! flows need. Credentials may legitimately be absent (self-hosted
//! deployments); every call checks configuration first and returns
//! `BillingError::NotConfigured` so callers can degrade gracefully.

use std::time::Duration;

use serde::Deserialize;

use crate::error::{BillingError, BillingResult};

const STRIPE_BASE_URL: &str = "https://api.stripe.com/v1";

/// Stripe configuration, read from the environment.
#[derive(Debug, Clone)]
pub struct StripeConfig {
    /// Secret API key (`sk_test_...` / `sk_live_...`). Empty when billing
    /// is not set up.
    pub api_key: String,
    /// Publishable key, exposed to the frontend checkout page.
    pub publishable_key: String,
    /// Webhook signing secret (`whsec_...`).
    pub webhook_secret: String,
    /// Base URL of the product, used for checkout redirect URLs.
    pub site_url: String,
}

impl StripeConfig {
    pub fn from_env() -> Self {
        Self {
            api_key: std::env::var("STRIPE_API_KEY").unwrap_or_default(),
            publishable_key: std::env::var("STRIPE_PUBLISHABLE_KEY").unwrap_or_default(),
            webhook_secret: std::env::var("STRIPE_WEBHOOK_SECRET").unwrap_or_default(),
            site_url: std::env::var("SITE_URL")
                .unwrap_or_else(|_| "http://localhost:8000".to_string()),
        }
    }
}

/// Stripe customer object (the fields we read).
#[derive(Debug, Clone, Deserialize)]
pub struct Customer {
    pub id: String,
    #[serde(default)]
    pub email: Option<String>,
}

/// Stripe Checkout session object.
#[derive(Debug, Clone, Deserialize)]
pub struct CheckoutSession {
    pub id: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub customer: Option<String>,
}

/// Stripe customer portal session.
#[derive(Debug, Clone, Deserialize)]
pub struct PortalSession {
    pub url: String,
}

/// Stripe payment intent (the fields we read).
#[derive(Debug, Clone, Deserialize)]
pub struct PaymentIntent {
    pub id: String,
    #[serde(default)]
    pub status: String,
}

/// Stripe usage record for metered billing.
#[derive(Debug, Clone, Deserialize)]
pub struct UsageRecord {
    pub id: String,
    pub quantity: i64,
}

#[derive(Debug, Deserialize)]
struct StripeErrorBody {
    error: StripeErrorDetail,
}

#[derive(Debug, Deserialize)]
struct StripeErrorDetail {
    #[serde(rename = "type", default)]
    error_type: String,
    #[serde(default)]
    message: String,
}

/// Stripe API client.
#[derive(Clone)]
pub struct StripeClient {
    http: reqwest::Client,
    config: StripeConfig,
}

impl StripeClient {
    pub fn new(config: StripeConfig) -> BillingResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self { http, config })
    }

    pub fn from_env() -> BillingResult<Self> {
        Self::new(StripeConfig::from_env())
    }

    pub fn config(&self) -> &StripeConfig {
        &self.config
    }

    /// Whether an API key is on file. Callers use this to decide whether to
    /// surface billing at all.
    pub fn is_configured(&self) -> bool {
        !self.config.api_key.is_empty()
    }

    fn api_key(&self) -> BillingResult<&str> {
        if self.config.api_key.is_empty() {
            return Err(BillingError::NotConfigured("STRIPE_API_KEY is not set"));
        }
        Ok(&self.config.api_key)
    }

    /// Create a Stripe customer for the given email.
    pub async fn create_customer(&self, email: &str) -> BillingResult<Customer> {
        let api_key = self.api_key()?;
        let params = [("email", email.to_string())];
        let response = self
            .http
            .post(format!("{}/customers", STRIPE_BASE_URL))
            .basic_auth(api_key, Option::<&str>::None)
            .form(&params)
            .send()
            .await?;
        Self::handle_response(response).await
    }

    /// Create a recurring-subscription checkout session against a price.
    pub async fn create_subscription_checkout(
        &self,
        customer_id: &str,
        price_id: &str,
    ) -> BillingResult<CheckoutSession> {
        let api_key = self.api_key()?;
        let params = [
            ("mode", "subscription".to_string()),
            ("customer", customer_id.to_string()),
            ("payment_method_types[0]", "card".to_string()),
            ("line_items[0][price]", price_id.to_string()),
            ("line_items[0][quantity]", "1".to_string()),
            ("success_url", self.success_url()),
            ("cancel_url", self.cancel_url()),
        ];
        let response = self
            .http
            .post(format!("{}/checkout/sessions", STRIPE_BASE_URL))
            .basic_auth(api_key, Option::<&str>::None)
            .form(&params)
            .send()
            .await?;
        Self::handle_response(response).await
    }

    /// Create a card-validation-only checkout session: a 50-cent one-time
    /// charge flagged for manual capture. The hold is cancelled when the
    /// `payment_intent.amount_capturable_updated` webhook arrives; it is
    /// never captured.
    pub async fn create_card_validation_checkout(
        &self,
        customer_id: &str,
    ) -> BillingResult<CheckoutSession> {
        let api_key = self.api_key()?;
        let params = [
            ("mode", "payment".to_string()),
            ("customer", customer_id.to_string()),
            ("payment_method_types[0]", "card".to_string()),
            ("line_items[0][price_data][currency]", "usd".to_string()),
            (
                "line_items[0][price_data][product_data][name]",
                "Card authorization".to_string(),
            ),
            ("line_items[0][price_data][unit_amount]", "50".to_string()),
            ("line_items[0][quantity]", "1".to_string()),
            ("payment_intent_data[capture_method]", "manual".to_string()),
            (
                "payment_intent_data[statement_descriptor]",
                "GLIMPSE PREAUTH".to_string(),
            ),
            ("success_url", self.success_url()),
            ("cancel_url", self.cancel_url()),
        ];
        let response = self
            .http
            .post(format!("{}/checkout/sessions", STRIPE_BASE_URL))
            .basic_auth(api_key, Option::<&str>::None)
            .form(&params)
            .send()
            .await?;
        Self::handle_response(response).await
    }

    /// Create a customer portal session and return its URL.
    pub async fn create_portal_session(&self, customer_id: &str) -> BillingResult<PortalSession> {
        let api_key = self.api_key()?;
        let params = [("customer", customer_id.to_string())];
        let response = self
            .http
            .post(format!("{}/billing_portal/sessions", STRIPE_BASE_URL))
            .basic_auth(api_key, Option::<&str>::None)
            .form(&params)
            .send()
            .await?;
        Self::handle_response(response).await
    }

    /// Cancel an uncaptured payment intent (releases the authorization hold).
    pub async fn cancel_payment_intent(
        &self,
        payment_intent_id: &str,
    ) -> BillingResult<PaymentIntent> {
        let api_key = self.api_key()?;
        let response = self
            .http
            .post(format!(
                "{}/payment_intents/{}/cancel",
                STRIPE_BASE_URL, payment_intent_id
            ))
            .basic_auth(api_key, Option::<&str>::None)
            .send()
            .await?;
        Self::handle_response(response).await
    }

    /// Report metered usage against a subscription item. The idempotency key
    /// makes retried reports safe.
    pub async fn create_usage_record(
        &self,
        subscription_item_id: &str,
        quantity: i64,
        timestamp: i64,
        idempotency_key: &str,
    ) -> BillingResult<UsageRecord> {
        let api_key = self.api_key()?;
        let params = [
            ("quantity", quantity.to_string()),
            ("timestamp", timestamp.to_string()),
            ("action", "set".to_string()),
        ];
        let response = self
            .http
            .post(format!(
                "{}/subscription_items/{}/usage_records",
                STRIPE_BASE_URL, subscription_item_id
            ))
            .basic_auth(api_key, Option::<&str>::None)
            .header("Idempotency-Key", idempotency_key)
            .form(&params)
            .send()
            .await?;
        Self::handle_response(response).await
    }

    fn success_url(&self) -> String {
        // Stripe substitutes the placeholder at redirect time.
        format!(
            "{}/billing/welcome?session_id={{CHECKOUT_SESSION_ID}}",
            self.config.site_url
        )
    }

    fn cancel_url(&self) -> String {
        format!(
            "{}/billing/failed?session_id={{CHECKOUT_SESSION_ID}}",
            self.config.site_url
        )
    }

    async fn handle_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> BillingResult<T> {
        let status = response.status();
        if status.is_success() {
            return Ok(response.json::<T>().await?);
        }
        let body = response.text().await.unwrap_or_default();
        match serde_json::from_str::<StripeErrorBody>(&body) {
            Ok(parsed) => Err(BillingError::Stripe(format!(
                "{}: {}",
                parsed.error.error_type, parsed.error.message
            ))),
            Err(_) => Err(BillingError::Stripe(format!("HTTP {}: {}", status, body))),
        }
    }
}
