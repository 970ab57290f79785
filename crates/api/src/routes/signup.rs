//! Signup
//!
//! Creates the user, their organization, and a default team in one
//! transaction, then enqueues the post-signup follow-up and optionally
//! pre-assigns a plan from a signup link. Only the billing-relevant slice of
//! signup lives here; the product's full onboarding is a separate service.

use argon2::password_hash::rand_core::OsRng;
use argon2::password_hash::SaltString;
use argon2::{Argon2, PasswordHasher};
use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use glimpse_billing::messaging::{is_valid_email, DEFAULT_FOLLOWUP_DELAY_HOURS};

use crate::auth::generate_session_token;
use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

const MIN_PASSWORD_LENGTH: usize = 8;

#[derive(Debug, Deserialize)]
pub struct SignupRequest {
    pub email: String,
    pub password: String,
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub organization_name: String,
    /// Plan key from a signup link; invalid keys are ignored.
    #[serde(default)]
    pub plan: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct SignupResponse {
    pub id: Uuid,
    pub email: String,
    pub session_token: String,
}

pub async fn signup(
    State(state): State<AppState>,
    Json(request): Json<SignupRequest>,
) -> ApiResult<(StatusCode, Json<SignupResponse>)> {
    if !is_valid_email(&request.email) {
        return Err(ApiError::BadRequest("invalid email address".to_string()));
    }
    if request.password.len() < MIN_PASSWORD_LENGTH {
        return Err(ApiError::BadRequest(format!(
            "password must be at least {} characters",
            MIN_PASSWORD_LENGTH
        )));
    }

    let salt = SaltString::generate(&mut OsRng);
    let password_hash = Argon2::default()
        .hash_password(request.password.as_bytes(), &salt)
        .map_err(|e| anyhow::anyhow!("password hashing failed: {}", e))?
        .to_string();

    let organization_name = if request.organization_name.is_empty() {
        format!("{}'s organization", request.email)
    } else {
        request.organization_name.clone()
    };
    let session_token = generate_session_token();

    let mut tx = state.pool.begin().await?;

    let (organization_id,): (Uuid,) =
        sqlx::query_as("INSERT INTO organizations (name) VALUES ($1) RETURNING id")
            .bind(&organization_name)
            .fetch_one(&mut *tx)
            .await?;

    sqlx::query("INSERT INTO teams (organization_id) VALUES ($1)")
        .bind(organization_id)
        .execute(&mut *tx)
        .await?;

    let user_id: Uuid = match sqlx::query_as::<_, (Uuid,)>(
        "INSERT INTO users (email, password_hash, first_name, current_organization_id, session_token) \
         VALUES ($1, $2, $3, $4, $5) RETURNING id",
    )
    .bind(&request.email)
    .bind(&password_hash)
    .bind(&request.first_name)
    .bind(organization_id)
    .bind(&session_token)
    .fetch_one(&mut *tx)
    .await
    {
        Ok((id,)) => id,
        Err(e) if is_unique_violation(&e) => {
            return Err(ApiError::Conflict("email is already in use".to_string()));
        }
        Err(e) => return Err(e.into()),
    };

    tx.commit().await?;

    // Signup-link plan assignment. A bad key must not fail account creation.
    if let Some(plan_key) = request.plan.as_deref().filter(|k| !k.is_empty()) {
        match state.billing.plans.get_active(plan_key).await {
            Ok(plan) => {
                let record = state.billing.records.get_or_create(organization_id).await?;
                state
                    .billing
                    .records
                    .assign_plan(record.id, plan.id, true)
                    .await?;
                tracing::info!(
                    organization_id = %organization_id,
                    plan = %plan.key,
                    "Plan pre-assigned from signup link"
                );
            }
            Err(e) => {
                tracing::warn!(plan = %plan_key, error = %e, "Ignoring invalid signup plan key");
            }
        }
    }

    if let Err(e) = state
        .billing
        .messaging
        .schedule_signup_followup(user_id, organization_id, DEFAULT_FOLLOWUP_DELAY_HOURS)
        .await
    {
        tracing::error!(user_id = %user_id, error = %e, "Failed to schedule signup follow-up");
    }

    tracing::info!(user_id = %user_id, organization_id = %organization_id, "User signed up");

    Ok((
        StatusCode::CREATED,
        Json(SignupResponse {
            id: user_id,
            email: request.email,
            session_token,
        }),
    ))
}

fn is_unique_violation(e: &sqlx::Error) -> bool {
    matches!(e, sqlx::Error::Database(db) if db.is_unique_violation())
}
