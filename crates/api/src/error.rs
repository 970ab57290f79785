//! API error responses

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use glimpse_billing::BillingError;
use serde_json::json;

/// Errors surfaced to HTTP clients. Everything carries a safe, generic
/// message; internals go to the logs.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("authentication required")]
    Unauthorized,

    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    #[error(transparent)]
    Billing(#[from] BillingError),

    #[error("database error")]
    Database(#[from] sqlx::Error),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

pub type ApiResult<T> = Result<T, ApiError>;

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            ApiError::Unauthorized => (StatusCode::UNAUTHORIZED, self.to_string()),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone()),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg.clone()),
            ApiError::Billing(e) => match e {
                BillingError::InvalidSignature
                | BillingError::InvalidPayload(_)
                | BillingError::SubscriptionItemMismatch(_)
                | BillingError::PlanNotSelfServe(_) => (StatusCode::BAD_REQUEST, e.to_string()),
                BillingError::PlanNotFound(_) => (StatusCode::NOT_FOUND, e.to_string()),
                BillingError::NotConfigured(_) => (
                    StatusCode::SERVICE_UNAVAILABLE,
                    "billing is not available".to_string(),
                ),
                _ => {
                    tracing::error!(error = %e, "Billing operation failed");
                    (
                        StatusCode::INTERNAL_SERVER_ERROR,
                        "internal server error".to_string(),
                    )
                }
            },
            ApiError::Database(e) => {
                tracing::error!(error = %e, "Database error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal server error".to_string(),
                )
            }
            ApiError::Internal(e) => {
                tracing::error!(error = %e, "Internal error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal server error".to_string(),
                )
            }
        };

        (status, Json(json!({ "error": message }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_webhook_errors_map_to_bad_request() {
        let response = ApiError::from(BillingError::InvalidSignature).into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response =
            ApiError::from(BillingError::SubscriptionItemMismatch("si_123".to_string()))
                .into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_unknown_plan_maps_to_not_found() {
        let response =
            ApiError::from(BillingError::PlanNotFound("enterprise".to_string())).into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_transient_errors_hide_details() {
        let response =
            ApiError::from(BillingError::Stripe("card_error: boom".to_string())).into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
