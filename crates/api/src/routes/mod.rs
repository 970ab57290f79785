//! Route table

pub mod billing;
pub mod plans;
pub mod signup;
pub mod user;

use axum::routing::{get, post};
use axum::Router;

use crate::state::AppState;

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/signup", post(signup::signup))
        .route("/api/user", get(user::current_user))
        .route("/billing/subscribe", post(billing::subscribe))
        .route("/billing/manage", post(billing::manage))
        .route("/billing/stripe_webhook", post(billing::stripe_webhook))
        .route("/plans", get(plans::list_plans))
        .route("/plans/{key}", get(plans::get_plan))
        .with_state(state)
}
