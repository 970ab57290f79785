//! Billing and lifecycle messaging for Glimpse
//!
//! Plan catalog, per-organization billing records, Stripe checkout and
//! webhook reconciliation, usage accounting, metered usage reporting, and
//! signup follow-up messaging. The API and worker binaries both drive this
//! crate; neither contains billing logic of its own.

#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used))]

pub mod checkout;
pub mod client;
pub mod email;
pub mod error;
pub mod messaging;
pub mod metered;
pub mod plans;
pub mod records;
pub mod usage;
pub mod webhooks;

pub use checkout::{CheckoutOutcome, CheckoutService};
pub use client::{StripeClient, StripeConfig};
pub use email::{EmailConfig, EmailService};
pub use error::{BillingError, BillingResult};
pub use messaging::{FollowupOutcome, MessagingService};
pub use metered::MeteredBillingService;
pub use plans::{CheckoutMode, Plan, PlanService, PlanSummary};
pub use records::{BillingRecordService, OrganizationBilling};
pub use usage::{EventUsage, UsageMeter};
pub use webhooks::WebhookHandler;

use sqlx::PgPool;
use uuid::Uuid;

/// Billing period granted by a successful card validation, measured from the
/// organization's creation date.
pub const CARD_VALIDATION_PERIOD_DAYS: i64 = 365;

/// Everything billing, wired together. Constructed once at startup and
/// shared behind the application state.
#[derive(Clone)]
pub struct BillingService {
    pub plans: PlanService,
    pub records: BillingRecordService,
    pub checkout: CheckoutService,
    pub webhooks: WebhookHandler,
    pub usage: UsageMeter,
    pub metered: MeteredBillingService,
    pub messaging: MessagingService,
    stripe: StripeClient,
}

impl BillingService {
    /// Build the service graph from the environment. Stripe and email
    /// credentials may be absent; the affected calls fail individually with
    /// `NotConfigured` instead of failing startup.
    pub fn from_env(
        pool: PgPool,
        redis: Option<redis::aio::ConnectionManager>,
    ) -> BillingResult<Self> {
        let stripe = StripeClient::from_env()?;
        let email = EmailService::from_env()?;

        let plans = PlanService::new(pool.clone());
        let records = BillingRecordService::new(pool.clone());
        let checkout = CheckoutService::new(stripe.clone(), records.clone());
        let webhooks = WebhookHandler::new(
            stripe.clone(),
            records.clone(),
            CARD_VALIDATION_PERIOD_DAYS,
        );
        let usage = UsageMeter::new(pool.clone(), redis, usage::DEFAULT_USAGE_CACHE_TTL_SECS);
        let metered = MeteredBillingService::new(pool.clone(), stripe.clone(), usage.clone());
        let messaging = MessagingService::new(pool, email);

        Ok(Self {
            plans,
            records,
            checkout,
            webhooks,
            usage,
            metered,
            messaging,
            stripe,
        })
    }

    /// Whether Stripe credentials are on file.
    pub fn is_configured(&self) -> bool {
        self.stripe.is_configured()
    }

    /// Self-serve enrollment: validate eligibility, assign the plan, flip
    /// the setup gate, and hand back a checkout session.
    pub async fn enroll_self_serve(
        &self,
        organization_id: Uuid,
        plan_key: &str,
        email: &str,
    ) -> BillingResult<CheckoutOutcome> {
        let plan = self.plans.get_active(plan_key).await?;
        if !plan.self_serve {
            return Err(BillingError::PlanNotSelfServe(plan.key));
        }

        let record = self.records.get_or_create(organization_id).await?;
        self.records.assign_plan(record.id, plan.id, true).await?;

        let record = self
            .records
            .get(organization_id)
            .await?
            .ok_or(BillingError::RecordNotFound(organization_id))?;
        self.checkout
            .start_checkout(&record, email, &plan.checkout_mode())
            .await
    }

    /// Customer portal URL for an organization with a Stripe customer on
    /// file. `Ok(None)` when there is no customer to manage.
    pub async fn portal_url(&self, organization_id: Uuid) -> BillingResult<Option<String>> {
        let Some(record) = self.records.get(organization_id).await? else {
            return Ok(None);
        };
        if record.stripe_customer_id.is_empty() {
            return Ok(None);
        }
        let session = self
            .stripe
            .create_portal_session(&record.stripe_customer_id)
            .await?;
        Ok(Some(session.url))
    }
}
