//! Plan catalog
//!
//! Read-only access to the subscription tiers. Plans are managed through an
//! administrative back channel; nothing in the user-facing flows creates or
//! mutates them. Retired (inactive) plans are hidden entirely: retrieval by
//! key returns not-found rather than a soft-listed row.

use serde::Serialize;
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};

/// How checkout is performed for a plan, resolved once when the plan is
/// loaded rather than by comparing plan keys at checkout time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckoutMode {
    /// Recurring subscription against the plan's Stripe price.
    Subscription { price_id: String },
    /// Metered-billing onboarding: a 50-cent manual-capture charge used only
    /// to validate a card; no subscription is created at checkout time.
    CardValidationOnly,
}

/// A subscription tier from the catalog.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Plan {
    pub id: Uuid,
    pub key: String,
    pub name: String,
    pub price_id: String,
    /// Monthly event allowance; `None` means unlimited.
    pub event_allowance: Option<i64>,
    pub is_active: bool,
    pub self_serve: bool,
    pub is_metered_billing: bool,
    pub custom_setup_billing_message: String,
    pub image_url: String,
}

impl Plan {
    pub fn checkout_mode(&self) -> CheckoutMode {
        if self.is_metered_billing {
            CheckoutMode::CardValidationOnly
        } else {
            CheckoutMode::Subscription {
                price_id: self.price_id.clone(),
            }
        }
    }

    pub fn summary(&self) -> PlanSummary {
        PlanSummary {
            key: self.key.clone(),
            name: self.name.clone(),
            custom_setup_billing_message: self.custom_setup_billing_message.clone(),
            allowance: self.event_allowance.map(|value| Allowance {
                value,
                formatted: glimpse_shared::compact_number(value),
            }),
            image_url: self.image_url.clone(),
            self_serve: self.self_serve,
        }
    }
}

/// Event allowance as rendered in API responses.
#[derive(Debug, Clone, Serialize)]
pub struct Allowance {
    pub value: i64,
    pub formatted: String,
}

/// The plan fields exposed over the API.
#[derive(Debug, Clone, Serialize)]
pub struct PlanSummary {
    pub key: String,
    pub name: String,
    pub custom_setup_billing_message: String,
    pub allowance: Option<Allowance>,
    pub image_url: String,
    pub self_serve: bool,
}

const PLAN_COLUMNS: &str = "id, key, name, price_id, event_allowance, is_active, self_serve, \
     is_metered_billing, custom_setup_billing_message, image_url";

/// Read-only plan catalog service.
#[derive(Clone)]
pub struct PlanService {
    pool: PgPool,
}

impl PlanService {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// List active plans, optionally restricted to self-serve-eligible ones.
    pub async fn list_active(&self, self_serve_only: bool) -> BillingResult<Vec<Plan>> {
        let query = if self_serve_only {
            format!(
                "SELECT {} FROM plans WHERE is_active AND self_serve ORDER BY key",
                PLAN_COLUMNS
            )
        } else {
            format!(
                "SELECT {} FROM plans WHERE is_active ORDER BY key",
                PLAN_COLUMNS
            )
        };
        let plans = sqlx::query_as::<_, Plan>(&query).fetch_all(&self.pool).await?;
        Ok(plans)
    }

    /// Retrieve an active plan by key. Inactive plans are not retrievable.
    pub async fn get_active(&self, key: &str) -> BillingResult<Plan> {
        let query = format!(
            "SELECT {} FROM plans WHERE key = $1 AND is_active",
            PLAN_COLUMNS
        );
        sqlx::query_as::<_, Plan>(&query)
            .bind(key)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| BillingError::PlanNotFound(key.to_string()))
    }

    /// Retrieve a plan by internal id (used when rendering a billing record's
    /// assigned plan, which may legitimately be inactive for grandfathered
    /// subscriptions).
    pub async fn get_by_id(&self, id: Uuid) -> BillingResult<Option<Plan>> {
        let query = format!("SELECT {} FROM plans WHERE id = $1", PLAN_COLUMNS);
        let plan = sqlx::query_as::<_, Plan>(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(plan)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plan(is_metered: bool) -> Plan {
        Plan {
            id: Uuid::new_v4(),
            key: "growth".to_string(),
            name: "Growth".to_string(),
            price_id: "price_1H1zJP".to_string(),
            event_allowance: Some(1_000_000),
            is_active: true,
            self_serve: true,
            is_metered_billing: is_metered,
            custom_setup_billing_message: String::new(),
            image_url: String::new(),
        }
    }

    #[test]
    fn test_checkout_mode_subscription_carries_price() {
        assert_eq!(
            plan(false).checkout_mode(),
            CheckoutMode::Subscription {
                price_id: "price_1H1zJP".to_string()
            }
        );
    }

    #[test]
    fn test_checkout_mode_metered_plan_is_card_validation_only() {
        assert_eq!(plan(true).checkout_mode(), CheckoutMode::CardValidationOnly);
    }

    #[test]
    fn test_summary_formats_allowance() {
        let summary = plan(false).summary();
        let allowance = summary.allowance.unwrap();
        assert_eq!(allowance.value, 1_000_000);
        assert_eq!(allowance.formatted, "1M");
    }

    #[test]
    fn test_summary_unlimited_allowance_is_null() {
        let mut p = plan(false);
        p.event_allowance = None;
        assert!(p.summary().allowance.is_none());
    }
}
