//! Billing endpoints: self-serve enrollment, the customer portal redirect,
//! and the Stripe webhook receiver.

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::Redirect;
use axum::Json;
use serde::{Deserialize, Serialize};

use glimpse_billing::BillingError;

use crate::auth::AuthUser;
use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct SubscribeRequest {
    pub plan: String,
}

#[derive(Debug, Serialize)]
pub struct SubscribeResponse {
    pub stripe_checkout_session: String,
    pub subscription_url: String,
}

pub async fn subscribe(
    State(state): State<AppState>,
    user: AuthUser,
    Json(request): Json<SubscribeRequest>,
) -> ApiResult<Json<SubscribeResponse>> {
    let organization_id = user.require_organization()?;

    let outcome = state
        .billing
        .enroll_self_serve(organization_id, &request.plan, &user.email)
        .await
        .map_err(|e| match e {
            // Ineligible plan keys are a client error here, not a 404.
            BillingError::PlanNotFound(key) => {
                ApiError::BadRequest(format!("plan not available for self-serve: {}", key))
            }
            other => ApiError::from(other),
        })?;

    Ok(Json(SubscribeResponse {
        subscription_url: format!("/billing/setup?session_id={}", outcome.session_id),
        stripe_checkout_session: outcome.session_id,
    }))
}

/// Redirect to the Stripe customer portal, or back home when there is no
/// customer to manage.
pub async fn manage(State(state): State<AppState>, user: AuthUser) -> ApiResult<Redirect> {
    let organization_id = user.require_organization()?;
    let url = match state.billing.portal_url(organization_id).await {
        Ok(Some(url)) => url,
        Ok(None) => "/".to_string(),
        Err(e) => {
            tracing::warn!(
                organization_id = %organization_id,
                error = %e,
                "Could not create portal session, redirecting home"
            );
            "/".to_string()
        }
    };
    Ok(Redirect::to(&url))
}

/// Stripe webhook receiver. The raw body is needed for signature
/// verification, so this handler takes `String` rather than `Json`.
pub async fn stripe_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> ApiResult<StatusCode> {
    let signature = headers
        .get("Stripe-Signature")
        .and_then(|v| v.to_str().ok())
        .ok_or(ApiError::Billing(BillingError::InvalidSignature))?;

    let event = state.billing.webhooks.verify_and_parse(&body, signature)?;
    state.billing.webhooks.handle_event(event).await?;

    Ok(StatusCode::OK)
}
