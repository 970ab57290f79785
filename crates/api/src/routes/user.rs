//! Authenticated user endpoint
//!
//! Profile plus the billing section the frontend renders: current plan,
//! month-to-date usage, and (when setup is pending) a ready-to-use checkout
//! session. Billing subsection failures degrade the section, never the
//! response.

use axum::extract::State;
use axum::Json;
use serde::Serialize;
use uuid::Uuid;

use glimpse_billing::plans::PlanSummary;

use crate::auth::AuthUser;
use crate::error::ApiResult;
use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct OrganizationInfo {
    pub id: Uuid,
    pub name: String,
}

#[derive(Debug, Serialize)]
pub struct UsageValue {
    pub value: i64,
    pub formatted: String,
}

#[derive(Debug, Serialize)]
pub struct BillingSection {
    pub plan: Option<PlanSummary>,
    /// `null` when the analytics store is unreachable, which is distinct
    /// from a literal zero events.
    pub current_usage: Option<UsageValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub should_setup_billing: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stripe_checkout_session: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subscription_url: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct UserResponse {
    pub id: Uuid,
    pub email: String,
    pub first_name: String,
    pub organization: Option<OrganizationInfo>,
    pub billing: Option<BillingSection>,
}

pub async fn current_user(
    State(state): State<AppState>,
    user: AuthUser,
) -> ApiResult<Json<UserResponse>> {
    let organization = match user.current_organization_id {
        Some(org_id) => sqlx::query_as::<_, (Uuid, String)>(
            "SELECT id, name FROM organizations WHERE id = $1",
        )
        .bind(org_id)
        .fetch_optional(&state.pool)
        .await?
        .map(|(id, name)| OrganizationInfo { id, name }),
        None => None,
    };

    let billing = match &organization {
        Some(org) => Some(billing_section(&state, org.id, &user.email).await?),
        None => None,
    };

    Ok(Json(UserResponse {
        id: user.id,
        email: user.email,
        first_name: user.first_name,
        organization,
        billing,
    }))
}

async fn billing_section(
    state: &AppState,
    organization_id: Uuid,
    email: &str,
) -> ApiResult<BillingSection> {
    let record = state.billing.records.get_or_create(organization_id).await?;

    let plan = match record.plan_id {
        Some(plan_id) => state.billing.plans.get_by_id(plan_id).await?,
        None => None,
    };

    let current_usage = state
        .billing
        .usage
        .cached_monthly_event_usage(organization_id)
        .await
        .as_option()
        .map(|value| UsageValue {
            value,
            formatted: glimpse_shared::compact_number(value),
        });

    let mut section = BillingSection {
        plan: plan.as_ref().map(|p| p.summary()),
        current_usage,
        should_setup_billing: None,
        stripe_checkout_session: None,
        subscription_url: None,
    };

    // Pending setup with no active period: hand the frontend a checkout
    // session. Stripe being down or unconfigured degrades only this part.
    if record.should_setup_billing && !record.is_billing_active() {
        if let Some(plan) = &plan {
            match state
                .billing
                .checkout
                .start_checkout(&record, email, &plan.checkout_mode())
                .await
            {
                Ok(outcome) => {
                    section.should_setup_billing = Some(true);
                    section.subscription_url =
                        Some(format!("/billing/setup?session_id={}", outcome.session_id));
                    section.stripe_checkout_session = Some(outcome.session_id);
                }
                Err(e) => {
                    tracing::warn!(
                        organization_id = %organization_id,
                        error = %e,
                        "Could not create checkout session for billing setup"
                    );
                }
            }
        }
    }

    Ok(section)
}
