//! Checkout orchestration
//!
//! Produces a `(checkout_session, customer)` pair for redirecting a user to
//! the hosted payment page. Recently created sessions are reused so a user
//! reloading the billing page does not accumulate duplicate sessions.

use time::{Duration, OffsetDateTime};

use crate::client::StripeClient;
use crate::error::BillingResult;
use crate::plans::CheckoutMode;
use crate::records::{BillingRecordService, OrganizationBilling};

/// Sessions younger than this are returned unchanged instead of creating a
/// new one. One minute short of 24 hours as a safety margin against Stripe's
/// own 24-hour session expiry.
pub const SESSION_REUSE_WINDOW_MINUTES: i64 = 1439;

/// Whether a stored checkout session is still fresh enough to reuse.
pub fn session_is_reusable(
    session_id: &str,
    created_at: Option<OffsetDateTime>,
    now: OffsetDateTime,
) -> bool {
    if session_id.is_empty() {
        return false;
    }
    match created_at {
        Some(created) => now - created < Duration::minutes(SESSION_REUSE_WINDOW_MINUTES),
        None => false,
    }
}

/// Outcome of checkout orchestration.
#[derive(Debug, Clone)]
pub struct CheckoutOutcome {
    pub session_id: String,
    pub customer_id: String,
    /// True when an existing session was returned without calling Stripe.
    pub reused: bool,
}

/// Checkout orchestration service.
#[derive(Clone)]
pub struct CheckoutService {
    stripe: StripeClient,
    records: BillingRecordService,
}

impl CheckoutService {
    pub fn new(stripe: StripeClient, records: BillingRecordService) -> Self {
        Self { stripe, records }
    }

    /// Create (or reuse) a checkout session for the organization's billing
    /// record. `email` seeds customer creation when no customer is on file.
    ///
    /// Fails with `BillingError::NotConfigured` when Stripe credentials are
    /// absent; callers degrade the billing section rather than the response.
    pub async fn start_checkout(
        &self,
        record: &OrganizationBilling,
        email: &str,
        mode: &CheckoutMode,
    ) -> BillingResult<CheckoutOutcome> {
        if session_is_reusable(
            &record.stripe_checkout_session,
            record.checkout_session_created_at,
            OffsetDateTime::now_utc(),
        ) {
            tracing::debug!(
                organization_id = %record.organization_id,
                session_id = %record.stripe_checkout_session,
                "Reusing existing checkout session"
            );
            return Ok(CheckoutOutcome {
                session_id: record.stripe_checkout_session.clone(),
                customer_id: record.stripe_customer_id.clone(),
                reused: true,
            });
        }

        let customer_id = if record.stripe_customer_id.is_empty() {
            self.stripe.create_customer(email).await?.id
        } else {
            record.stripe_customer_id.clone()
        };

        let session = match mode {
            CheckoutMode::Subscription { price_id } => {
                self.stripe
                    .create_subscription_checkout(&customer_id, price_id)
                    .await?
            }
            CheckoutMode::CardValidationOnly => {
                self.stripe
                    .create_card_validation_checkout(&customer_id)
                    .await?
            }
        };

        self.records
            .set_checkout_session(record.id, &session.id, &customer_id)
            .await?;

        tracing::info!(
            organization_id = %record.organization_id,
            session_id = %session.id,
            customer_id = %customer_id,
            "Created checkout session"
        );

        Ok(CheckoutOutcome {
            session_id: session.id,
            customer_id,
            reused: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_reused_at_23_hours() {
        let now = OffsetDateTime::now_utc();
        let created = now - Duration::hours(23);
        assert!(session_is_reusable("cs_123", Some(created), now));
    }

    #[test]
    fn test_session_not_reused_after_window() {
        let now = OffsetDateTime::now_utc();
        let created = now - Duration::hours(24) - Duration::minutes(2);
        assert!(!session_is_reusable("cs_123", Some(created), now));
    }

    #[test]
    fn test_window_boundary_is_1439_minutes() {
        let now = OffsetDateTime::now_utc();
        assert!(session_is_reusable(
            "cs_123",
            Some(now - Duration::minutes(1438)),
            now
        ));
        assert!(!session_is_reusable(
            "cs_123",
            Some(now - Duration::minutes(1439)),
            now
        ));
    }

    #[test]
    fn test_empty_or_unstamped_session_is_not_reusable() {
        let now = OffsetDateTime::now_utc();
        assert!(!session_is_reusable("", Some(now), now));
        assert!(!session_is_reusable("cs_123", None, now));
    }
}
